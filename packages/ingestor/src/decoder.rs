//! Payload Decoder
//!
//! Decodes the body of an inbound internal message into a typed record.
//! Supports native transfers (0x00000000), jetton transfer notifications
//! (0x7362d09c) and NFT ownership assignments (0x05138d91).

use thiserror::Error;

use crate::cell::{CellReader, DecodeError};
use crate::filter::{classify, TransferKind, OP_CODE_BITS, OP_NFT_OWNERSHIP_ASSIGNED};
use crate::message::InternalMessage;
use crate::query::{NftContent, NftQuery, QueryError};
use crate::record::{
    Envelope, JettonBody, JettonRecord, NativeBody, NativeRecord, NftBody, NftRecord, Record,
};

/// Tag of a text comment payload
pub const TEXT_COMMENT_TAG: u64 = 0x0000_0000;

/// Errors that can occur while decoding a message body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Malformed body: {0}")]
    Decode(#[from] DecodeError),

    #[error("Failed to read {field}: {source}")]
    Field {
        field: &'static str,
        #[source]
        source: DecodeError,
    },

    #[error("NFT lookup failed: {0}")]
    Query(#[from] QueryError),

    #[error("NFT notification has no source address")]
    MissingSource,
}

/// Attach the name of the field being read to a cell error
trait FieldContext<T> {
    fn field(self, field: &'static str) -> Result<T, PayloadError>;
}

impl<T> FieldContext<T> for Result<T, DecodeError> {
    fn field(self, field: &'static str) -> Result<T, PayloadError> {
        self.map_err(|source| PayloadError::Field { field, source })
    }
}

/// Extract the optional text comment that follows the category fields
///
/// With bits left in the body a presence flag selects the comment cell; a body
/// with no bits left may carry the comment cell as its next reference. A set
/// flag with no reference behind it is an error, as is any read failure inside
/// the comment cell.
///
/// # Returns
/// The comment text, or an empty string when there is none or the payload is
/// not a text comment
pub fn read_comment(reader: &mut CellReader<'_>) -> Result<String, PayloadError> {
    let child = if reader.remaining_bits() > 0 {
        reader.read_optional_ref().field("comment")?
    } else if reader.remaining_refs() > 0 {
        Some(reader.read_ref()?)
    } else {
        None
    };

    let Some(mut child) = child else {
        return Ok(String::new());
    };

    let tag = child.read_uint(32).field("comment tag")?;
    if tag != TEXT_COMMENT_TAG {
        return Ok(String::new());
    }
    child.read_chained_string().field("comment")
}

/// Decode a native transfer
///
/// A body shorter than 32 bits is a bare transfer with an empty comment. Whole
/// bytes after the opcode are the comment text itself, continued through the
/// first reference; anything else goes through [`read_comment`].
pub fn decode_native(msg: &InternalMessage) -> Result<NativeRecord, PayloadError> {
    let envelope = Envelope::from_message(msg);
    let mut reader = msg.body.reader();

    if reader.read_uint(OP_CODE_BITS).is_err() {
        return Ok(NativeRecord::new(envelope, NativeBody::default()));
    }
    let bits = reader.remaining_bits();
    let message = if bits > 0 && bits % 8 == 0 {
        reader.read_chained_string().field("comment")?
    } else {
        read_comment(&mut reader)?
    };

    Ok(NativeRecord::new(
        envelope,
        NativeBody {
            op_code: TransferKind::Native.op_code(),
            message,
        },
    ))
}

/// Decode a jetton `transfer_notification`
///
/// # Arguments
/// * `msg` - Inbound message whose body starts with 0x7362d09c
///
/// # Returns
/// A `JettonRecord`, or an error if the query id, amount or sender is missing
pub fn decode_jetton(msg: &InternalMessage) -> Result<JettonRecord, PayloadError> {
    let mut reader = msg.body.reader();

    let op_code = reader.read_uint(OP_CODE_BITS).field("op_code")? as u32;
    let query_id = reader.read_uint(64).field("query_id")?;
    let amount = reader.read_amount().field("amount")?;
    let sender = reader.read_address().field("sender")?;
    let message = read_comment(&mut reader)?;

    Ok(JettonRecord::new(
        Envelope::from_message(msg),
        JettonBody {
            op_code,
            query_id,
            amount: amount.to_string(),
            sender: sender.to_string(),
            message,
        },
    ))
}

/// Decode an NFT `ownership_assigned` notification
///
/// The source of the message is the item contract. Its state is fetched from
/// `nft`, and when the item belongs to a collection the collection resolves the
/// content URI. Either lookup failing aborts the decode.
pub async fn decode_nft(
    msg: &InternalMessage,
    nft: &dyn NftQuery,
) -> Result<NftRecord, PayloadError> {
    if msg.src.is_none() {
        return Err(PayloadError::MissingSource);
    }
    let mut reader = msg.body.reader();
    reader.skip_bits(OP_CODE_BITS).field("op_code")?;

    let state = nft.get_item_state(&msg.src).await?;

    let mut meta = String::new();
    if !state.collection.is_none() {
        let content = nft
            .get_collection_content(&state.collection, state.index, state.individual_content.clone())
            .await?;
        if let NftContent::Offchain { uri } = content {
            meta = uri;
        }
    }

    let message = read_comment(&mut reader)?;

    Ok(NftRecord::new(
        Envelope::from_message(msg),
        NftBody {
            op_code: OP_NFT_OWNERSHIP_ASSIGNED,
            initialized: state.initialized,
            index: state.index.to_string(),
            nft_address: msg.src.to_string(),
            owner_address: state.owner.to_string(),
            collection_address: state.collection.to_string(),
            meta,
            message,
        },
    ))
}

/// Classify an inbound message and decode it with the matching decoder
///
/// # Returns
/// `Ok(Some(Record))` on success, `Ok(None)` when the operation code is not one
/// we report, `Err` when the body is malformed or an NFT lookup fails
pub async fn decode_message(
    msg: &InternalMessage,
    nft: &dyn NftQuery,
) -> Result<Option<Record>, PayloadError> {
    let Some(kind) = classify(&msg.body) else {
        return Ok(None);
    };

    let record = match kind {
        TransferKind::Native => Record::Native(decode_native(msg)?),
        TransferKind::Jetton => Record::Jetton(decode_jetton(msg)?),
        TransferKind::Nft => Record::Nft(decode_nft(msg, nft).await?),
    };
    Ok(Some(record))
}
