//! Subscription Loop
//!
//! Follows the transactions of one account and delivers decoded records to the
//! registered callbacks. A feed task pulls transactions from the ledger into a
//! bounded queue; a consumer task drains it in order. Both are supervised: the
//! feed is resubscribed from the last received logical time with exponential
//! backoff, and a consumer that panics is restarted on the same queue.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::address::MsgAddress;
use crate::config::{ConfigError, SubscriptionConfig};
use crate::decoder::{decode_message, PayloadError};
use crate::filter::{observable_message, TransferKind};
use crate::handlers::CallbackRegistry;
use crate::message::RawTransaction;
use crate::query::NftQuery;
use crate::record::{JettonRecord, NativeRecord, NftRecord};
use crate::session::{BlockRef, LedgerClient, LedgerError, SessionProvider};

/// Errors that prevent a subscription from starting
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Failed to establish ledger session: {0}")]
    Connect(#[source] LedgerError),

    #[error("Failed to look up account: {0}")]
    AccountLookup(#[source] LedgerError),
}

/// State of the consumer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for or processing transactions
    Listening,
    /// The consumer faulted and is waiting to be restarted
    Recovering,
}

/// Filter, decode and dispatch one transaction
///
/// # Returns
/// `Some(TransferKind)` when a record was decoded (and handed to its handler, if
/// any), `None` when the transaction is not reported, or the decode error
pub async fn process_transaction(
    tx: &RawTransaction,
    nft: &dyn NftQuery,
    registry: &CallbackRegistry,
) -> Result<Option<TransferKind>, PayloadError> {
    let Some(msg) = observable_message(tx) else {
        debug!(lt = tx.lt, "Skipping transaction without a reportable inbound message");
        return Ok(None);
    };

    let Some(record) = decode_message(msg, nft).await? else {
        return Ok(None);
    };

    let kind = record.kind();
    if !registry.dispatch(record) {
        debug!(lt = tx.lt, kind = kind.name(), "No handler registered, record dropped");
    }
    Ok(Some(kind))
}

/// Everything the consumer worker needs, shared across restarts
struct Consumer {
    nft: Arc<dyn NftQuery>,
    registry: Arc<RwLock<CallbackRegistry>>,
    position: Arc<AtomicU64>,
    restarts: Arc<AtomicU32>,
    state: watch::Sender<LoopState>,
    config: SubscriptionConfig,
}

impl Consumer {
    /// Snapshot of the registry, so handlers run without holding the lock
    fn registry(&self) -> CallbackRegistry {
        match self.registry.read() {
            Ok(registry) => registry.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn run(self: Arc<Self>, queue: Arc<Mutex<mpsc::Receiver<RawTransaction>>>) {
        let mut queue = queue.lock().await;
        while let Some(tx) = queue.recv().await {
            self.position.fetch_max(tx.lt, Ordering::SeqCst);
            let registry = self.registry();
            match process_transaction(&tx, self.nft.as_ref(), &registry).await {
                Ok(Some(kind)) => debug!(lt = tx.lt, kind = kind.name(), "Delivered record"),
                Ok(None) => {}
                Err(e) => warn!(lt = tx.lt, error = %e, "Dropping transaction that failed to decode"),
            }
        }
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run the consumer worker, restarting it whenever it panics
///
/// Returns once the queue is closed.
async fn supervise_consumer(consumer: Arc<Consumer>, queue: Arc<Mutex<mpsc::Receiver<RawTransaction>>>) {
    let mut attempt = 0u32;
    let mut last_fault_position = consumer.position.load(Ordering::SeqCst);

    loop {
        let mut worker = AbortOnDrop(tokio::spawn(consumer.clone().run(queue.clone())));
        match (&mut worker.0).await {
            Ok(()) => {
                info!("Transaction queue closed, consumer stopped");
                return;
            }
            Err(e) if e.is_panic() => {
                let position = consumer.position.load(Ordering::SeqCst);
                if position != last_fault_position {
                    attempt = 0;
                }
                last_fault_position = position;

                let restarts = consumer.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                consumer.state.send_replace(LoopState::Recovering);
                let delay = consumer.config.backoff_delay(attempt);
                error!(position, restarts, ?delay, "Consumer panicked, restarting");

                sleep(delay).await;
                attempt = attempt.saturating_add(1);
                consumer.state.send_replace(LoopState::Listening);
            }
            Err(e) => {
                warn!(error = %e, "Consumer cancelled");
                return;
            }
        }
    }
}

/// Keep the ledger feed running, resubscribing from the last received logical time
///
/// Returns once the consumer side of the queue is gone.
async fn supervise_feed(
    client: Arc<dyn LedgerClient>,
    address: MsgAddress,
    position: Arc<AtomicU64>,
    sink: mpsc::Sender<RawTransaction>,
    config: SubscriptionConfig,
) {
    let mut attempt = 0u32;

    loop {
        let from_lt = position.load(Ordering::SeqCst);
        info!(from_lt, "Subscribing to account transactions");
        let result = client.subscribe_transactions(&address, from_lt, sink.clone()).await;

        if sink.is_closed() {
            info!("Consumer gone, stopping transaction feed");
            return;
        }
        match result {
            Ok(()) => warn!(from_lt, "Transaction feed ended, resubscribing"),
            Err(e) => error!(from_lt, error = %e, "Transaction feed failed, resubscribing"),
        }

        if position.load(Ordering::SeqCst) > from_lt {
            attempt = 0;
        }
        let delay = config.backoff_delay(attempt);
        debug!(attempt, ?delay, "Waiting before resubscribing");
        sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}

/// A running subscription to the transactions of one account.
///
/// Records are delivered at least once: after a feed restart, transactions
/// still queued at that moment may be delivered again. Use `created_lt` to
/// discard duplicates. Dropping the handle stops the subscription.
pub struct Subscription {
    address: MsgAddress,
    block: BlockRef,
    start_lt: u64,
    position: Arc<AtomicU64>,
    registry: Arc<RwLock<CallbackRegistry>>,
    state: watch::Receiver<LoopState>,
    restarts: Arc<AtomicU32>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Connect to the ledger and start following the configured account
    ///
    /// # Arguments
    /// * `config` - Account, network config and queue/backoff settings
    /// * `provider` - Establishes the ledger session
    /// * `registry` - Initial callbacks; more can be registered later
    ///
    /// # Returns
    /// The running subscription, or the error that prevented it from starting
    pub async fn start(
        config: &SubscriptionConfig,
        provider: &dyn SessionProvider,
        registry: CallbackRegistry,
    ) -> Result<Self, SubscriptionError> {
        let address = config.validate()?;
        let network = config.network_source()?;

        let session = provider.connect(&network).await.map_err(SubscriptionError::Connect)?;
        let account = session
            .client
            .current_account_info(&session.block, &address)
            .await
            .map_err(SubscriptionError::AccountLookup)?;

        info!(
            address = %address,
            block = %session.block,
            last_lt = account.last_lt,
            "Subscription started"
        );

        let position = Arc::new(AtomicU64::new(account.last_lt));
        let registry = Arc::new(RwLock::new(registry));
        let restarts = Arc::new(AtomicU32::new(0));
        let (state_tx, state_rx) = watch::channel(LoopState::Listening);
        let (sink, queue) = mpsc::channel(config.queue_capacity);

        let consumer = Arc::new(Consumer {
            nft: session.nft.clone(),
            registry: registry.clone(),
            position: position.clone(),
            restarts: restarts.clone(),
            state: state_tx,
            config: config.clone(),
        });

        let feed = tokio::spawn(supervise_feed(
            session.client.clone(),
            address,
            position.clone(),
            sink,
            config.clone(),
        ));
        let consume = tokio::spawn(supervise_consumer(consumer, Arc::new(Mutex::new(queue))));

        Ok(Self {
            address,
            block: session.block,
            start_lt: account.last_lt,
            position,
            registry,
            state: state_rx,
            restarts,
            tasks: vec![feed, consume],
        })
    }

    fn with_registry(&self, register: impl FnOnce(&mut CallbackRegistry)) {
        match self.registry.write() {
            Ok(mut registry) => register(&mut *registry),
            Err(poisoned) => register(&mut *poisoned.into_inner()),
        }
    }

    /// Register the native transfer handler, replacing any previous one
    pub fn on_native<F>(&self, handler: F)
    where
        F: Fn(NativeRecord) + Send + Sync + 'static,
    {
        self.with_registry(|registry| {
            registry.on_native(handler);
        });
    }

    /// Register the jetton transfer handler, replacing any previous one
    pub fn on_jetton<F>(&self, handler: F)
    where
        F: Fn(JettonRecord) + Send + Sync + 'static,
    {
        self.with_registry(|registry| {
            registry.on_jetton(handler);
        });
    }

    /// Register the NFT transfer handler, replacing any previous one
    pub fn on_nft<F>(&self, handler: F)
    where
        F: Fn(NftRecord) + Send + Sync + 'static,
    {
        self.with_registry(|registry| {
            registry.on_nft(handler);
        });
    }

    pub fn address(&self) -> &MsgAddress {
        &self.address
    }

    /// Block the session was pinned to at startup
    pub fn block(&self) -> BlockRef {
        self.block
    }

    /// Last logical time of the account when the subscription started
    pub fn start_lt(&self) -> u64 {
        self.start_lt
    }

    /// Logical time of the last transaction taken from the queue
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition
    pub fn state_changes(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    /// Number of times the consumer has been restarted after a fault
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Stop the feed and the consumer
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
