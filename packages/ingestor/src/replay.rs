//! Replay Ledger
//!
//! An in-process ledger backed by a JSON fixture: transactions carry their
//! inbound message as a base64 bag of cells, and NFT items are answered from a
//! table. It implements the session, ledger and NFT query interfaces, so a
//! subscription can run against it exactly as against a live node.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use alloy::primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::address::MsgAddress;
use crate::boc;
use crate::cell::{Cell, DecodeError};
use crate::config::NetworkConfigSource;
use crate::message::{BouncePhase, InboundMessage, InternalMessage, RawTransaction, TransactionDescription};
use crate::query::{NftContent, NftItemState, NftQuery, QueryError};
use crate::session::{AccountInfo, BlockRef, LedgerClient, LedgerError, Session, SessionProvider};

/// Shard of the masterchain blocks reported by the replay ledger
const MASTERCHAIN_SHARD: u64 = 0x8000_0000_0000_0000;

/// Errors loading a replay fixture
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Failed to read fixture: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid fixture JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid inbound message of transaction {lt}: {source}")]
    Message {
        lt: u64,
        #[source]
        source: DecodeError,
    },

    #[error("Invalid NFT item {address}: {reason}")]
    NftItem { address: String, reason: String },
}

/// Bounce phase outcome as written in fixtures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureBounce {
    NegativeFunds,
    NoFunds,
    Ok,
}

impl From<FixtureBounce> for BouncePhase {
    fn from(bounce: FixtureBounce) -> Self {
        match bounce {
            FixtureBounce::NegativeFunds => BouncePhase::NegativeFunds,
            FixtureBounce::NoFunds => BouncePhase::NoFunds,
            FixtureBounce::Ok => BouncePhase::Ok,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureTransaction {
    pub lt: u64,
    #[serde(default)]
    pub now: u32,
    /// Inbound message as a base64 bag of cells
    #[serde(default)]
    pub in_msg: Option<String>,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub bounce: Option<FixtureBounce>,
}

impl FixtureTransaction {
    /// Fixture entry for an ordinary transaction carrying `msg`
    pub fn from_message(lt: u64, msg: &InternalMessage) -> Result<Self, DecodeError> {
        Ok(Self {
            lt,
            now: msg.created_at,
            in_msg: Some(boc::to_base64(&msg.to_cell()?)),
            aborted: false,
            bounce: None,
        })
    }

    pub fn to_transaction(&self) -> Result<RawTransaction, ReplayError> {
        let in_msg = match &self.in_msg {
            Some(encoded) => {
                let cell = boc::from_base64(encoded).map_err(|source| ReplayError::Message { lt: self.lt, source })?;
                let msg = InboundMessage::parse(&cell).map_err(|source| ReplayError::Message { lt: self.lt, source })?;
                Some(msg)
            }
            None => None,
        };
        Ok(RawTransaction {
            lt: self.lt,
            now: self.now,
            in_msg,
            description: TransactionDescription::Ordinary {
                aborted: self.aborted,
                bounce: self.bounce.map(BouncePhase::from),
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureNftItem {
    pub address: String,
    #[serde(default = "default_initialized")]
    pub initialized: bool,
    /// Decimal index within the collection
    pub index: String,
    pub owner: String,
    /// Empty for items outside any collection
    #[serde(default)]
    pub collection: String,
    /// Off-chain content URI returned by the collection
    #[serde(default)]
    pub content_uri: Option<String>,
}

fn default_initialized() -> bool {
    true
}

/// Contents of a replay fixture file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFixture {
    /// Last logical time of the account when the subscription starts
    #[serde(default)]
    pub last_lt: u64,
    /// Masterchain seqno reported as the session block
    #[serde(default)]
    pub seqno: u32,
    #[serde(default)]
    pub transactions: Vec<FixtureTransaction>,
    #[serde(default)]
    pub nft_items: Vec<FixtureNftItem>,
}

impl ReplayFixture {
    pub fn from_json(json: &str) -> Result<Self, ReplayError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, ReplayError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

struct NftEntry {
    state: NftItemState,
    content_uri: Option<String>,
}

/// Fixture-backed ledger; clone the `Arc` to share it between sessions
pub struct ReplayLedger {
    last_lt: u64,
    block: BlockRef,
    transactions: Mutex<Vec<RawTransaction>>,
    nft_items: Mutex<HashMap<MsgAddress, NftEntry>>,
    appended: Notify,
    generation: AtomicU64,
}

impl ReplayLedger {
    pub fn new(last_lt: u64) -> Self {
        Self {
            last_lt,
            block: BlockRef {
                workchain: -1,
                shard: MASTERCHAIN_SHARD,
                seqno: 0,
            },
            transactions: Mutex::new(Vec::new()),
            nft_items: Mutex::new(HashMap::new()),
            appended: Notify::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_fixture(fixture: &ReplayFixture) -> Result<Self, ReplayError> {
        let mut ledger = Self::new(fixture.last_lt);
        ledger.block.seqno = fixture.seqno;
        for tx in &fixture.transactions {
            ledger.push_transaction(tx.to_transaction()?);
        }
        for item in &fixture.nft_items {
            ledger.insert_fixture_item(item)?;
        }
        Ok(ledger)
    }

    /// Load a fixture file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let ledger = Self::from_fixture(&ReplayFixture::from_json(&json)?)?;
        info!(
            path = %path.display(),
            transactions = ledger.transaction_count(),
            "Loaded replay fixture"
        );
        Ok(ledger)
    }

    pub fn block(&self) -> BlockRef {
        self.block
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Append a transaction, waking active feeds
    pub fn push_transaction(&self, tx: RawTransaction) {
        {
            let mut transactions = self.transactions.lock().unwrap_or_else(PoisonError::into_inner);
            let pos = transactions.partition_point(|existing| existing.lt <= tx.lt);
            transactions.insert(pos, tx);
        }
        self.appended.notify_waiters();
    }

    pub fn insert_nft_item(&self, address: MsgAddress, state: NftItemState, content_uri: Option<String>) {
        self.nft_items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, NftEntry { state, content_uri });
    }

    fn insert_fixture_item(&self, item: &FixtureNftItem) -> Result<(), ReplayError> {
        let invalid = |reason: String| ReplayError::NftItem {
            address: item.address.clone(),
            reason,
        };
        let address: MsgAddress = item.address.parse().map_err(|e: DecodeError| invalid(e.to_string()))?;
        let index: U256 = item
            .index
            .parse()
            .map_err(|_| invalid(format!("index '{}' is not a decimal integer", item.index)))?;
        let owner: MsgAddress = item.owner.parse().map_err(|e: DecodeError| invalid(e.to_string()))?;
        let collection: MsgAddress = item.collection.parse().map_err(|e: DecodeError| invalid(e.to_string()))?;

        self.insert_nft_item(
            address,
            NftItemState {
                initialized: item.initialized,
                index,
                owner,
                collection,
                individual_content: Arc::new(Cell::default()),
            },
            item.content_uri.clone(),
        );
        Ok(())
    }

    /// End every active feed with an error, as a dropped node connection would
    pub fn interrupt_feeds(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.appended.notify_waiters();
    }

    fn pending_after(&self, lt: u64) -> Vec<RawTransaction> {
        let transactions = self.transactions.lock().unwrap_or_else(PoisonError::into_inner);
        let start = transactions.partition_point(|tx| tx.lt <= lt);
        transactions[start..].to_vec()
    }
}

#[async_trait]
impl LedgerClient for ReplayLedger {
    async fn current_account_info(&self, block: &BlockRef, address: &MsgAddress) -> Result<AccountInfo, LedgerError> {
        if address.is_none() {
            return Err(LedgerError::Account {
                address: String::new(),
                reason: "addr_none has no account".to_string(),
            });
        }
        debug!(block = %block, address = %address, last_lt = self.last_lt, "Replay account lookup");
        Ok(AccountInfo { last_lt: self.last_lt })
    }

    async fn subscribe_transactions(
        &self,
        address: &MsgAddress,
        from_lt: u64,
        sink: mpsc::Sender<RawTransaction>,
    ) -> Result<(), LedgerError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut next_lt = from_lt;
        debug!(address = %address, from_lt, "Replay feed started");

        loop {
            let appended = self.appended.notified();
            if self.generation.load(Ordering::SeqCst) != generation {
                return Err(LedgerError::Feed("replay feed interrupted".to_string()));
            }

            for tx in self.pending_after(next_lt) {
                next_lt = tx.lt;
                if sink.send(tx).await.is_err() {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = appended => {}
                _ = sink.closed() => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl NftQuery for ReplayLedger {
    async fn get_item_state(&self, item: &MsgAddress) -> Result<NftItemState, QueryError> {
        let items = self.nft_items.lock().unwrap_or_else(PoisonError::into_inner);
        items
            .get(item)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| QueryError::Failed {
                method: "get_nft_data",
                address: item.to_string(),
                reason: "no such item".to_string(),
            })
    }

    async fn get_collection_content(
        &self,
        collection: &MsgAddress,
        index: U256,
        individual_content: Arc<Cell>,
    ) -> Result<NftContent, QueryError> {
        let items = self.nft_items.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = items
            .values()
            .find(|entry| entry.state.collection == *collection && entry.state.index == index)
            .ok_or_else(|| QueryError::Failed {
                method: "get_nft_content",
                address: collection.to_string(),
                reason: format!("no item with index {index}"),
            })?;
        Ok(match &entry.content_uri {
            Some(uri) => NftContent::Offchain { uri: uri.clone() },
            None => NftContent::Onchain(individual_content),
        })
    }
}

#[async_trait]
impl SessionProvider for Arc<ReplayLedger> {
    async fn connect(&self, network: &NetworkConfigSource) -> Result<Session, LedgerError> {
        debug!(network = ?network, "Replay session ignores the network config");
        Ok(Session {
            client: self.clone(),
            nft: self.clone(),
            block: self.block,
        })
    }
}
