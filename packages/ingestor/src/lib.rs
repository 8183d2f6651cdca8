//! TonWatch Ingestor Library
//!
//! This crate follows the transactions of a single TON account, classifies each
//! inbound message by its opcode, decodes native, jetton and NFT transfers into
//! typed records and hands them to registered callbacks.

pub mod address;
pub mod boc;
pub mod cell;
pub mod config;
pub mod decoder;
pub mod filter;
pub mod handlers;
pub mod message;
pub mod publisher;
pub mod query;
pub mod record;
pub mod replay;
pub mod session;
pub mod subscription;

// Re-export commonly used types
pub use address::MsgAddress;
pub use cell::{Cell, CellBuilder, CellReader, DecodeError};
pub use config::SubscriptionConfig;
pub use decoder::{decode_message, PayloadError};
pub use filter::{classify, TransferKind};
pub use handlers::CallbackRegistry;
pub use record::{JettonRecord, NativeRecord, NftRecord, Record};
pub use subscription::{LoopState, Subscription, SubscriptionError};
