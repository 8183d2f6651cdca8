//! Callback Registry
//!
//! One optional handler per transfer category. Categories without a handler
//! are dropped silently.

use std::fmt;
use std::sync::Arc;

use crate::record::{JettonRecord, NativeRecord, NftRecord, Record};

/// A callback receiving one record of type `T`.
///
/// Handlers run on the subscription's consumer task and hold up delivery of
/// later records until they return, so they should hand slow work off elsewhere.
pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Registry of the native, jetton and NFT handlers
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    native: Option<Handler<NativeRecord>>,
    jetton: Option<Handler<JettonRecord>>,
    nft: Option<Handler<NftRecord>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the native transfer handler, replacing any previous one
    pub fn on_native<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(NativeRecord) + Send + Sync + 'static,
    {
        self.native = Some(Arc::new(handler));
        self
    }

    /// Register the jetton transfer handler, replacing any previous one
    pub fn on_jetton<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(JettonRecord) + Send + Sync + 'static,
    {
        self.jetton = Some(Arc::new(handler));
        self
    }

    /// Register the NFT transfer handler, replacing any previous one
    pub fn on_nft<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(NftRecord) + Send + Sync + 'static,
    {
        self.nft = Some(Arc::new(handler));
        self
    }

    /// Hand a record to the handler of its category
    ///
    /// # Returns
    /// `true` if a handler was registered and invoked, `false` if the record was dropped
    pub fn dispatch(&self, record: Record) -> bool {
        match record {
            Record::Native(record) => invoke(&self.native, record),
            Record::Jetton(record) => invoke(&self.jetton, record),
            Record::Nft(record) => invoke(&self.nft, record),
        }
    }
}

fn invoke<T>(handler: &Option<Handler<T>>, record: T) -> bool {
    match handler {
        Some(handler) => {
            handler(record);
            true
        }
        None => false,
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("native", &self.native.is_some())
            .field("jetton", &self.jetton.is_some())
            .field("nft", &self.nft.is_some())
            .finish()
    }
}
