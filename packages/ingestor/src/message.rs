//! Inbound Messages and Raw Transactions
//!
//! The shapes handed over by the ledger feed. `InboundMessage::parse` decodes a
//! `Message Any` cell: the `int_msg_info$0` header of internal messages, the
//! optional `StateInit` (skipped) and the `Either X ^X` body.

use std::sync::Arc;

use alloy::primitives::U256;

use crate::address::MsgAddress;
use crate::cell::{Cell, CellBuilder, CellReader, DecodeError};

/// Header and body of an internal message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalMessage {
    pub ihr_disabled: bool,
    pub bounce: bool,
    pub bounced: bool,
    pub src: MsgAddress,
    pub dst: MsgAddress,
    /// Value carried in nanotons
    pub amount: U256,
    pub ihr_fee: U256,
    pub fwd_fee: U256,
    pub created_lt: u64,
    pub created_at: u32,
    pub body: Arc<Cell>,
}

impl InternalMessage {
    /// Parse an internal message, the leading `int_msg_info$0` tag included
    pub fn parse(cell: &Cell) -> Result<Self, DecodeError> {
        let mut reader = cell.reader();
        if reader.read_bit()? {
            return Err(DecodeError::UnsupportedMessage("not an internal message"));
        }
        Self::parse_after_tag(&mut reader)
    }

    fn parse_after_tag(reader: &mut CellReader<'_>) -> Result<Self, DecodeError> {
        let ihr_disabled = reader.read_bit()?;
        let bounce = reader.read_bit()?;
        let bounced = reader.read_bit()?;
        let src = reader.read_address()?;
        let dst = reader.read_address()?;
        let amount = reader.read_amount()?;
        // extra currencies are not reported
        reader.read_optional_ref()?;
        let ihr_fee = reader.read_amount()?;
        let fwd_fee = reader.read_amount()?;
        let created_lt = reader.read_uint(64)?;
        let created_at = reader.read_uint(32)? as u32;

        // init:(Maybe (Either StateInit ^StateInit))
        if reader.read_bit()? {
            if reader.read_bit()? {
                reader.read_ref()?;
            } else {
                skip_state_init(reader)?;
            }
        }

        // body:(Either X ^X)
        let body = if reader.read_bit()? {
            reader.read_ref_cell()?
        } else {
            Arc::new(reader.to_cell()?)
        };

        Ok(Self {
            ihr_disabled,
            bounce,
            bounced,
            src,
            dst,
            amount,
            ihr_fee,
            fwd_fee,
            created_lt,
            created_at,
            body,
        })
    }

    /// Encode as a `Message` cell with no `StateInit` and the body in a reference
    pub fn to_cell(&self) -> Result<Cell, DecodeError> {
        let mut builder = CellBuilder::new();
        builder
            .store_bit(false)?
            .store_bit(self.ihr_disabled)?
            .store_bit(self.bounce)?
            .store_bit(self.bounced)?
            .store_address(&self.src)?
            .store_address(&self.dst)?
            .store_amount(self.amount)?
            .store_maybe_ref(None)?
            .store_amount(self.ihr_fee)?
            .store_amount(self.fwd_fee)?
            .store_uint(self.created_lt, 64)?
            .store_uint(u64::from(self.created_at), 32)?
            .store_bit(false)?
            .store_bit(true)?
            .store_ref(self.body.clone())?;
        Ok(builder.build())
    }
}

fn skip_state_init(reader: &mut CellReader<'_>) -> Result<(), DecodeError> {
    // split_depth:(Maybe (## 5))
    if reader.read_bit()? {
        reader.skip_bits(5)?;
    }
    // special:(Maybe TickTock)
    if reader.read_bit()? {
        reader.skip_bits(2)?;
    }
    // code, data, library
    for _ in 0..3 {
        reader.read_optional_ref()?;
    }
    Ok(())
}

/// The message that triggered a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Internal(InternalMessage),
    /// `ext_in_msg_info$10`, kept only as a marker
    External,
}

impl InboundMessage {
    pub fn parse(cell: &Cell) -> Result<Self, DecodeError> {
        let mut reader = cell.reader();
        if reader.read_bit()? {
            return Ok(InboundMessage::External);
        }
        InternalMessage::parse_after_tag(&mut reader).map(InboundMessage::Internal)
    }

    pub fn as_internal(&self) -> Option<&InternalMessage> {
        match self {
            InboundMessage::Internal(msg) => Some(msg),
            InboundMessage::External => None,
        }
    }
}

/// Outcome of the bounce phase of an ordinary transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BouncePhase {
    NegativeFunds,
    NoFunds,
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionDescription {
    Ordinary {
        aborted: bool,
        bounce: Option<BouncePhase>,
    },
    TickTock,
    Other,
}

/// A transaction as delivered by the ledger feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    /// Logical time of the transaction
    pub lt: u64,
    /// Unix time the transaction was included
    pub now: u32,
    pub in_msg: Option<InboundMessage>,
    pub description: TransactionDescription,
}

impl RawTransaction {
    /// An ordinary transaction carrying `msg`, with no bounce phase
    pub fn ordinary(lt: u64, msg: InternalMessage) -> Self {
        Self {
            lt,
            now: msg.created_at,
            in_msg: Some(InboundMessage::Internal(msg)),
            description: TransactionDescription::Ordinary {
                aborted: false,
                bounce: None,
            },
        }
    }

    /// Whether the bounce phase completed, i.e. the transfer was reverted
    pub fn bounced_successfully(&self) -> bool {
        matches!(
            self.description,
            TransactionDescription::Ordinary {
                bounce: Some(BouncePhase::Ok),
                ..
            }
        )
    }
}
