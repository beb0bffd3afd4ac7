//! In-memory chain, for tests and dry runs.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Batch, ChainReader, FetchError};
use crate::Nanoton;
use crate::model::{Cursor, Transfer, TransferId};

const LT_STEP: Cursor = 1_000;

struct ChainTx {
    position: Cursor,
    mc_seqno: u64,
    transfer: Option<Transfer>,
}

struct Inner {
    txs: Vec<ChainTx>,
    tip: u64,
    failures: VecDeque<FetchError>,
    fetches: usize,
}

/// An append-only chain holding the transactions of one deposit address.
///
/// Transactions land in the block at the current masterchain tip; call
/// [`MemoryChain::advance_tip`] to add confirmations.
pub struct MemoryChain {
    address: String,
    confirmation_depth: u64,
    limit: usize,
    inner: Mutex<Inner>,
}

impl MemoryChain {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            confirmation_depth: 1,
            limit: 100,
            inner: Mutex::new(Inner {
                txs: Vec::new(),
                tip: 1,
                failures: VecDeque::new(),
                fetches: 0,
            }),
        }
    }

    pub fn with_confirmation_depth(mut self, depth: u64) -> Self {
        self.confirmation_depth = depth;
        self
    }

    /// Maximum number of chain transactions inspected per fetch.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Append an incoming transfer to the deposit address.
    pub fn deposit(&self, amount: Nanoton, comment: &str) -> TransferId {
        let address = self.address.clone();
        self.deposit_to(&address, amount, comment)
    }

    /// Append an incoming transfer reported with an arbitrary destination.
    pub fn deposit_to(&self, destination: &str, amount: Nanoton, comment: &str) -> TransferId {
        let mut inner = self.lock();
        let position = Self::next_position(&inner);
        let id = TransferId::new(&format!("{position:064x}"), position);
        let mc_seqno = inner.tip;
        inner.txs.push(ChainTx {
            position,
            mc_seqno,
            transfer: Some(Transfer {
                id: id.clone(),
                source: format!("EQsender{position}"),
                destination: destination.to_string(),
                amount,
                comment: comment.to_string(),
                position,
            }),
        });
        id
    }

    /// Append a transaction that carries no incoming transfer.
    pub fn outgoing(&self) -> Cursor {
        let mut inner = self.lock();
        let position = Self::next_position(&inner);
        let mc_seqno = inner.tip;
        inner.txs.push(ChainTx {
            position,
            mc_seqno,
            transfer: None,
        });
        position
    }

    pub fn advance_tip(&self, blocks: u64) {
        self.lock().tip += blocks;
    }

    /// Make the next fetch fail with `error`.
    pub fn fail_next(&self, error: FetchError) {
        self.lock().failures.push_back(error);
    }

    /// Number of fetches served, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_position(inner: &Inner) -> Cursor {
        inner.txs.last().map_or(LT_STEP, |tx| tx.position + LT_STEP)
    }

    fn fetch(&self, cursor: Cursor) -> Result<Batch, FetchError> {
        let mut inner = self.lock();
        inner.fetches += 1;
        if let Some(error) = inner.failures.pop_front() {
            return Err(error);
        }

        let mut batch = Batch {
            transfers: Vec::new(),
            next_cursor: cursor,
        };
        for tx in inner
            .txs
            .iter()
            .filter(|tx| tx.position > cursor)
            .take(self.limit)
        {
            let confirmations = (inner.tip + 1).saturating_sub(tx.mc_seqno);
            if confirmations < self.confirmation_depth {
                break;
            }
            batch.next_cursor = tx.position;
            if let Some(transfer) = &tx.transfer {
                batch.transfers.push(transfer.clone());
            }
        }
        Ok(batch)
    }
}

impl ChainReader for MemoryChain {
    async fn fetch_since(&self, cursor: Cursor) -> Result<Batch, FetchError> {
        self.fetch(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(chain: &MemoryChain, cursor: Cursor) -> Batch {
        chain.fetch(cursor).unwrap()
    }

    #[test]
    fn empty_chain_keeps_cursor() {
        let chain = MemoryChain::new("EQdeposit");
        let batch = fetch(&chain, 0);
        assert!(batch.transfers.is_empty());
        assert_eq!(batch.next_cursor, 0);
    }

    #[test]
    fn returns_transfers_in_order_past_cursor() {
        let chain = MemoryChain::new("EQdeposit");
        let first = chain.deposit(Nanoton::from_ton(1), "1");
        let second = chain.deposit(Nanoton::from_ton(2), "2");

        let batch = fetch(&chain, 0);
        let ids: Vec<_> = batch.transfers.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec![first, second.clone()]);
        assert_eq!(batch.next_cursor, 2 * LT_STEP);

        let batch = fetch(&chain, LT_STEP);
        assert_eq!(batch.transfers.len(), 1);
        assert_eq!(batch.transfers[0].id, second);
    }

    #[test]
    fn repeated_fetch_is_deterministic() {
        let chain = MemoryChain::new("EQdeposit");
        chain.deposit(Nanoton::from_ton(1), "1");
        assert_eq!(fetch(&chain, 0), fetch(&chain, 0));
    }

    #[test]
    fn outgoing_transactions_advance_cursor_only() {
        let chain = MemoryChain::new("EQdeposit");
        let position = chain.outgoing();
        let batch = fetch(&chain, 0);
        assert!(batch.transfers.is_empty());
        assert_eq!(batch.next_cursor, position);
    }

    #[test]
    fn unconfirmed_transactions_hold_cursor() {
        let chain = MemoryChain::new("EQdeposit").with_confirmation_depth(3);
        chain.deposit(Nanoton::from_ton(1), "1");
        chain.advance_tip(1);
        chain.deposit(Nanoton::from_ton(1), "2");

        let batch = fetch(&chain, 0);
        assert!(batch.transfers.is_empty());
        assert_eq!(batch.next_cursor, 0);

        chain.advance_tip(1);
        let batch = fetch(&chain, 0);
        assert_eq!(batch.transfers.len(), 1);
        assert_eq!(batch.next_cursor, LT_STEP);

        chain.advance_tip(1);
        assert_eq!(fetch(&chain, 0).transfers.len(), 2);
    }

    #[test]
    fn limit_bounds_inspected_transactions() {
        let chain = MemoryChain::new("EQdeposit").with_limit(2);
        chain.outgoing();
        chain.deposit(Nanoton::from_ton(1), "1");
        chain.deposit(Nanoton::from_ton(1), "2");

        let batch = fetch(&chain, 0);
        assert_eq!(batch.transfers.len(), 1);
        assert_eq!(batch.next_cursor, 2 * LT_STEP);
    }

    #[test]
    fn injected_failure_is_served_once() {
        let chain = MemoryChain::new("EQdeposit");
        chain.fail_next(FetchError::Transient("timeout".to_string()));
        assert!(chain.fetch(0).unwrap_err().is_transient());
        assert!(chain.fetch(0).is_ok());
        assert_eq!(chain.fetch_count(), 2);
    }
}
