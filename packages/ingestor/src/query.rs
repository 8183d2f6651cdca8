//! NFT State Queries
//!
//! Read-only lookups against NFT item and collection contracts, needed to
//! complete an ownership notification. Implemented by the ledger session.

use std::sync::Arc;

use alloy::primitives::U256;
use async_trait::async_trait;
use thiserror::Error;

use crate::address::MsgAddress;
use crate::cell::Cell;

/// Errors returned by the NFT query collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Get method {method} failed on {address}: {reason}")]
    Failed {
        method: &'static str,
        address: String,
        reason: String,
    },

    #[error("Unexpected get method result: {0}")]
    InvalidResult(String),

    #[error("Ledger query unavailable: {0}")]
    Unavailable(String),
}

/// Result of `get_nft_data` on an item contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftItemState {
    pub initialized: bool,
    pub index: U256,
    pub owner: MsgAddress,
    /// `MsgAddress::None` for items outside any collection
    pub collection: MsgAddress,
    /// Item-specific content, resolved through the collection
    pub individual_content: Arc<Cell>,
}

/// Full item content as returned by the collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NftContent {
    Offchain { uri: String },
    Onchain(Arc<Cell>),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NftQuery: Send + Sync {
    /// Item state of the NFT contract at `item`
    async fn get_item_state(&self, item: &MsgAddress) -> Result<NftItemState, QueryError>;

    /// Full content of item `index`, merged by the collection with `individual_content`
    async fn get_collection_content(
        &self,
        collection: &MsgAddress,
        index: U256,
        individual_content: Arc<Cell>,
    ) -> Result<NftContent, QueryError>;
}
