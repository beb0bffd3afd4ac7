//! Access to the transfers received by the deposit address.

use std::future::Future;

use thiserror::Error;

use crate::model::{Cursor, Transfer};

pub mod memory;
pub mod toncenter;

/// Errors returned by a [`ChainReader`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network trouble, timeouts, rate limits or a malformed response.
    /// Retrying later may succeed.
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// The request can never succeed as configured, e.g. an invalid address.
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Transfers fetched past a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// Confirmed incoming transfers in ascending chain order.
    pub transfers: Vec<Transfer>,
    /// Position covering every transaction inspected for this batch. Never
    /// passes an unconfirmed transaction.
    pub next_cursor: Cursor,
}

/// Lists confirmed transfers to a single deposit address.
///
/// Implementations must be read-only and deterministic: two calls with the
/// same cursor return the same transfers unless new ones were confirmed in
/// between.
pub trait ChainReader: Send + Sync {
    fn fetch_since(
        &self,
        cursor: Cursor,
    ) -> impl Future<Output = Result<Batch, FetchError>> + Send;
}
