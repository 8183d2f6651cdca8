//! Transaction Classification
//!
//! Classifies inbound messages by the 32-bit operation code at the head of the
//! body and decides which transactions the subscription reports at all.

use std::collections::HashMap;
use std::sync::LazyLock;

use tracing::debug;

use crate::cell::Cell;
use crate::message::{InternalMessage, RawTransaction};

/// Plain transfer, optionally carrying a text comment
pub const OP_NATIVE: u32 = 0x0000_0000;

/// Jetton `transfer_notification`
pub const OP_JETTON_NOTIFY: u32 = 0x7362_d09c;

/// NFT `ownership_assigned`
pub const OP_NFT_OWNERSHIP_ASSIGNED: u32 = 0x0513_8d91;

/// Width of the operation code prefix
pub const OP_CODE_BITS: usize = 32;

/// The three transfer categories the subscription reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Native TON transfer - 0x00000000
    Native,
    /// Jetton transfer notification - 0x7362d09c
    Jetton,
    /// NFT ownership assigned - 0x05138d91
    Nft,
}

impl TransferKind {
    pub fn op_code(&self) -> u32 {
        match self {
            TransferKind::Native => OP_NATIVE,
            TransferKind::Jetton => OP_JETTON_NOTIFY,
            TransferKind::Nft => OP_NFT_OWNERSHIP_ASSIGNED,
        }
    }

    /// Returns the category name used in logs and serialized records
    pub fn name(&self) -> &'static str {
        match self {
            TransferKind::Native => "native",
            TransferKind::Jetton => "jetton",
            TransferKind::Nft => "nft",
        }
    }

    /// Returns the operation code as hex with 0x prefix
    pub fn hex(&self) -> &'static str {
        match self {
            TransferKind::Native => "0x00000000",
            TransferKind::Jetton => "0x7362d09c",
            TransferKind::Nft => "0x05138d91",
        }
    }
}

/// Static lookup table for operation codes
static TRANSFER_KINDS: LazyLock<HashMap<u32, TransferKind>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert(OP_NATIVE, TransferKind::Native);
    map.insert(OP_JETTON_NOTIFY, TransferKind::Jetton);
    map.insert(OP_NFT_OWNERSHIP_ASSIGNED, TransferKind::Nft);
    map
});

/// Get the transfer category for an operation code, if it is one we report
///
/// # Arguments
/// * `op_code` - The 32-bit operation code of the message body
///
/// # Returns
/// `Some(TransferKind)` for a known code, `None` otherwise
pub fn get_transfer_kind(op_code: u32) -> Option<TransferKind> {
    TRANSFER_KINDS.get(&op_code).copied()
}

/// Read the operation code at offset 0 of a message body
///
/// A body shorter than 32 bits is a bare transfer and yields `OP_NATIVE`.
pub fn read_op_code(body: &Cell) -> u32 {
    body.reader()
        .read_uint(OP_CODE_BITS)
        .map(|op| op as u32)
        .unwrap_or(OP_NATIVE)
}

/// Classify a message body
///
/// # Arguments
/// * `body` - The body cell of the inbound message
///
/// # Returns
/// `Some(TransferKind)` when the body belongs to a reported category, `None`
/// for any other operation code
pub fn classify(body: &Cell) -> Option<TransferKind> {
    let op_code = read_op_code(body);
    let kind = get_transfer_kind(op_code);
    if kind.is_none() {
        debug!(op_code = %format!("{op_code:#010x}"), "Ignoring unrecognized operation code");
    }
    kind
}

/// The inbound internal message of a transaction, if the transaction should be reported
///
/// Transactions without an inbound internal message are skipped, as are ordinary
/// transactions whose bounce phase completed (the transfer was reverted).
pub fn observable_message(tx: &RawTransaction) -> Option<&InternalMessage> {
    if tx.bounced_successfully() {
        return None;
    }
    tx.in_msg.as_ref().and_then(|msg| msg.as_internal())
}
