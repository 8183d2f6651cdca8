//! Ledger Session
//!
//! Interfaces to the ledger node: a provider that establishes a session from a
//! network config, and the client used to look up the account and stream its
//! transactions.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::address::MsgAddress;
use crate::config::NetworkConfigSource;
use crate::message::RawTransaction;
use crate::query::NftQuery;

/// Errors that can occur talking to the ledger
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Failed to load network config: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Account lookup failed for {address}: {reason}")]
    Account { address: String, reason: String },

    #[error("Transaction feed failed: {0}")]
    Feed(String),
}

/// A masterchain block the session is pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockRef {
    pub workchain: i32,
    pub shard: u64,
    pub seqno: u32,
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{:016x},{})", self.workchain, self.shard, self.seqno)
    }
}

/// Account state relevant to the subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountInfo {
    /// Logical time of the last transaction of the account, 0 if it has none
    pub last_lt: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Account state as of `block`
    async fn current_account_info(
        &self,
        block: &BlockRef,
        address: &MsgAddress,
    ) -> Result<AccountInfo, LedgerError>;

    /// Send every transaction of `address` with a logical time above `from_lt`
    /// into `sink`, in logical-time order, then keep following new ones.
    ///
    /// Returns when the feed ends or `sink` is closed.
    async fn subscribe_transactions(
        &self,
        address: &MsgAddress,
        from_lt: u64,
        sink: mpsc::Sender<RawTransaction>,
    ) -> Result<(), LedgerError>;
}

/// A connected session: query client, NFT lookups and the pinned block
#[derive(Clone)]
pub struct Session {
    pub client: Arc<dyn LedgerClient>,
    pub nft: Arc<dyn NftQuery>,
    pub block: BlockRef,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("block", &self.block).finish_non_exhaustive()
    }
}

/// Establishes sessions from a network config
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn connect(&self, network: &NetworkConfigSource) -> Result<Session, LedgerError>;
}
