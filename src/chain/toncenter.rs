//! Chain reader backed by the toncenter v3 indexer HTTP API.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{Batch, ChainReader, FetchError};
use crate::Nanoton;
use crate::model::{Cursor, Transfer, TransferId};

/// Connection settings for [`TonCenterReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TonCenterOptions {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub confirmation_depth: u64,
    /// Maximum number of chain transactions requested per fetch.
    pub limit: usize,
}

impl Default for TonCenterOptions {
    fn default() -> Self {
        Self {
            base_url: "https://toncenter.com".to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
            confirmation_depth: 1,
            limit: 100,
        }
    }
}

/// Reads incoming transfers of one account from toncenter.
pub struct TonCenterReader {
    client: Client,
    address: String,
    options: TonCenterOptions,
}

#[derive(Debug, Deserialize)]
struct MasterchainInfo {
    last: BlockRef,
}

#[derive(Debug, Deserialize)]
struct BlockRef {
    seqno: u64,
}

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    transactions: Vec<TransactionDto>,
}

#[derive(Debug, Deserialize)]
struct TransactionDto {
    account: String,
    hash: String,
    #[serde(deserialize_with = "de_u64")]
    lt: u64,
    mc_block_seqno: Option<u64>,
    in_msg: Option<MessageDto>,
    #[serde(default)]
    description: DescriptionDto,
}

#[derive(Debug, Default, Deserialize)]
struct DescriptionDto {
    #[serde(default)]
    aborted: bool,
}

#[derive(Debug, Deserialize)]
struct MessageDto {
    source: Option<String>,
    destination: Option<String>,
    value: Option<String>,
    #[serde(default)]
    bounce: bool,
    #[serde(default)]
    bounced: bool,
    message_content: Option<ContentDto>,
}

#[derive(Debug, Deserialize)]
struct ContentDto {
    decoded: Option<DecodedDto>,
}

#[derive(Debug, Deserialize)]
struct DecodedDto {
    #[serde(rename = "type")]
    kind: String,
    comment: Option<String>,
}

/// toncenter encodes 64-bit integers as strings.
fn de_u64<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl TonCenterReader {
    pub fn new(address: impl Into<String>, options: TonCenterOptions) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| FetchError::Permanent(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            address: address.into(),
            options,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.options.base_url.trim_end_matches('/'));
        let request = self.client.get(url);
        match &self.options.api_key {
            Some(key) => request.header("X-API-Key", key),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, FetchError> {
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Transient(format!("malformed response: {e}")))
    }

    async fn masterchain_tip(&self) -> Result<u64, FetchError> {
        let info: MasterchainInfo = Self::send(self.get("/api/v3/masterchainInfo")).await?;
        Ok(info.last.seqno)
    }

    async fn transactions(&self, cursor: Cursor) -> Result<Vec<TransactionDto>, FetchError> {
        let request = self.get("/api/v3/transactions").query(&[
            ("account", self.address.clone()),
            ("start_lt", cursor.saturating_add(1).to_string()),
            ("limit", self.options.limit.to_string()),
            ("offset", "0".to_string()),
            ("sort", "asc".to_string()),
        ]);
        let response: TransactionsResponse = Self::send(request).await?;
        Ok(response.transactions)
    }
}

impl ChainReader for TonCenterReader {
    async fn fetch_since(&self, cursor: Cursor) -> Result<Batch, FetchError> {
        // Read the tip first so every transaction seen is judged against a
        // tip at least as old as itself
        let tip = self.masterchain_tip().await?;
        let transactions = self.transactions(cursor).await?;
        debug!(
            cursor,
            tip,
            fetched = transactions.len(),
            "fetched account transactions"
        );
        Ok(batch_from(
            transactions,
            cursor,
            tip,
            self.options.confirmation_depth,
            &self.address,
        ))
    }
}

fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let message = format!("toncenter returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        FetchError::Transient(message)
    } else {
        FetchError::Permanent(message)
    }
}

/// Turn an ascending page of account transactions into a batch, stopping at
/// the first transaction without enough confirmations.
fn batch_from(
    mut transactions: Vec<TransactionDto>,
    cursor: Cursor,
    tip: u64,
    confirmation_depth: u64,
    address: &str,
) -> Batch {
    transactions.sort_by_key(|tx| tx.lt);

    let mut batch = Batch {
        transfers: Vec::new(),
        next_cursor: cursor,
    };
    for tx in transactions.into_iter().filter(|tx| tx.lt > cursor) {
        if confirmation_depth > 0 {
            let confirmations = tx
                .mc_block_seqno
                .map_or(0, |seqno| (tip + 1).saturating_sub(seqno));
            if confirmations < confirmation_depth {
                debug!(lt = tx.lt, confirmations, "stopping at unconfirmed transaction");
                break;
            }
        }
        batch.next_cursor = tx.lt;
        if let Some(transfer) = incoming_transfer(tx, address) {
            batch.transfers.push(transfer);
        }
    }
    batch
}

/// The value-carrying internal message that credited the account, if any.
fn incoming_transfer(tx: TransactionDto, address: &str) -> Option<Transfer> {
    let msg = tx.in_msg?;
    // External messages have no source
    let source = msg.source.filter(|s| !s.is_empty())?;
    if msg.destination.as_deref() != Some(tx.account.as_str()) {
        return None;
    }
    if msg.bounced || (msg.bounce && tx.description.aborted) {
        return None;
    }

    let raw_value = msg.value.unwrap_or_default();
    let amount = raw_value.parse::<u64>().map(Nanoton::new).unwrap_or_else(|_| {
        warn!(hash = %tx.hash, value = %raw_value, "unparsable transfer value");
        Nanoton::ZERO
    });
    let comment = msg
        .message_content
        .and_then(|content| content.decoded)
        .filter(|decoded| decoded.kind == "text_comment")
        .and_then(|decoded| decoded.comment)
        .unwrap_or_default();

    Some(Transfer {
        id: TransferId::new(&tx.hash, tx.lt),
        source,
        destination: address.to_string(),
        amount,
        comment,
        position: tx.lt,
    })
}
