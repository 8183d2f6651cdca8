//! Transaction Records
//!
//! Typed records handed to callbacks. Every record is the common envelope of the
//! inbound message plus a category-specific body, and serializes to JSON with
//! snake_case keys. Amounts and indices are decimal strings.

use serde::{Deserialize, Serialize};

use crate::filter::TransferKind;
use crate::message::InternalMessage;

/// Fields shared by every record, taken from the inbound message header
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub ihr_disabled: bool,
    pub bounce: bool,
    pub bounced: bool,
    /// Source address, user-friendly bounceable form (empty for `addr_none`)
    pub src_addr: String,
    pub dst_addr: String,
    /// Value in nanotons as a decimal string
    pub amount: String,
    pub ihr_fee: String,
    pub fwd_fee: String,
    /// Logical time of the message, unique and increasing per source account
    pub created_lt: u64,
    /// Unix timestamp of the message
    pub created_at: u32,
}

impl Envelope {
    pub fn from_message(msg: &InternalMessage) -> Self {
        Self {
            ihr_disabled: msg.ihr_disabled,
            bounce: msg.bounce,
            bounced: msg.bounced,
            src_addr: msg.src.to_string(),
            dst_addr: msg.dst.to_string(),
            amount: msg.amount.to_string(),
            ihr_fee: msg.ihr_fee.to_string(),
            fwd_fee: msg.fwd_fee.to_string(),
            created_lt: msg.created_lt,
            created_at: msg.created_at,
        }
    }
}

/// Envelope plus a typed body. The envelope fields sit at the top level of the JSON object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionRecord<B> {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub body: B,
}

impl<B> TransactionRecord<B>
where
    B: Serialize + for<'de> Deserialize<'de>,
{
    pub fn new(envelope: Envelope, body: B) -> Self {
        Self { envelope, body }
    }

    /// Serialize the record to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize a record from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Body of a plain TON transfer
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NativeBody {
    /// Always `0`
    pub op_code: u32,
    /// Text comment, empty when none was attached
    pub message: String,
}

/// Body of a jetton `transfer_notification`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JettonBody {
    pub op_code: u32,
    pub query_id: u64,
    /// Jetton amount in base units as a decimal string
    pub amount: String,
    /// Original owner of the transferred jettons
    pub sender: String,
    pub message: String,
}

/// Body of an NFT `ownership_assigned` notification, completed with the item state
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NftBody {
    pub op_code: u32,
    pub initialized: bool,
    /// Index within the collection as a decimal string
    pub index: String,
    pub nft_address: String,
    pub owner_address: String,
    /// Empty when the item belongs to no collection
    pub collection_address: String,
    /// Off-chain content URI, empty when unresolved
    pub meta: String,
    pub message: String,
}

pub type NativeRecord = TransactionRecord<NativeBody>;
pub type JettonRecord = TransactionRecord<JettonBody>;
pub type NftRecord = TransactionRecord<NftBody>;

/// A decoded record of any category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "category", content = "record", rename_all = "snake_case")]
pub enum Record {
    Native(NativeRecord),
    Jetton(JettonRecord),
    Nft(NftRecord),
}

impl Record {
    pub fn kind(&self) -> TransferKind {
        match self {
            Record::Native(_) => TransferKind::Native,
            Record::Jetton(_) => TransferKind::Jetton,
            Record::Nft(_) => TransferKind::Nft,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            Record::Native(record) => &record.envelope,
            Record::Jetton(record) => &record.envelope,
            Record::Nft(record) => &record.envelope,
        }
    }

    pub fn created_lt(&self) -> u64 {
        self.envelope().created_lt
    }

    /// Serialize with the category tag, as published to downstream consumers
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
