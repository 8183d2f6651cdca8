//! Redis Publisher
//!
//! Publishes decoded transfer records to a Redis pub/sub channel as JSON. Callbacks
//! are synchronous, so records are handed to a forwarder task through a bounded
//! queue and published from there.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::handlers::CallbackRegistry;
use crate::record::Record;

/// Default Redis channel for publishing transfer records
pub const DEFAULT_CHANNEL: &str = "tonwatch_records";

/// Default capacity of the forwarder queue
pub const DEFAULT_FORWARD_CAPACITY: usize = 1024;

/// Errors that can occur during publishing
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Forwarder queue is full")]
    QueueFull,

    #[error("Forwarder has stopped")]
    QueueClosed,
}

/// Destination of published payloads
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSink: Send {
    /// Publish `payload` on `channel`, returning the number of receivers
    async fn publish(&mut self, channel: &str, payload: String) -> Result<i64, PublishError>;
}

#[async_trait]
impl MessageSink for MultiplexedConnection {
    async fn publish(&mut self, channel: &str, payload: String) -> Result<i64, PublishError> {
        let subscribers: i64 = AsyncCommands::publish(self, channel, payload).await?;
        Ok(subscribers)
    }
}

/// Redis publisher for transfer records
pub struct Publisher<S = MultiplexedConnection> {
    sink: S,
    channel: String,
}

impl Publisher<MultiplexedConnection> {
    /// Open a Redis connection and publish on `channel`
    ///
    /// # Arguments
    /// * `url` - Redis URL, e.g. `redis://127.0.0.1/`
    /// * `channel` - The pub/sub channel name to publish to
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, PublishError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection, channel))
    }
}

impl<S: MessageSink> Publisher<S> {
    pub fn new(sink: S, channel: impl Into<String>) -> Self {
        Self {
            sink,
            channel: channel.into(),
        }
    }

    /// Create a new publisher with the default channel
    pub fn with_default_channel(sink: S) -> Self {
        Self::new(sink, DEFAULT_CHANNEL)
    }

    /// Publish a record as JSON
    ///
    /// # Returns
    /// The number of subscribers that received the message
    pub async fn publish_record(&mut self, record: &Record) -> Result<i64, PublishError> {
        let json = record.to_json()?;
        self.sink.publish(&self.channel, json).await
    }

    /// Get the channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl<S: MessageSink + 'static> Publisher<S> {
    /// Move the publisher onto its own task, fed through a queue of `capacity` records
    pub fn spawn_forwarder(mut self, capacity: usize) -> RecordForwarder {
        let (sender, mut queue) = mpsc::channel::<Record>(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(record) = queue.recv().await {
                let created_lt = record.created_lt();
                match self.publish_record(&record).await {
                    Ok(subscribers) => debug!(
                        channel = %self.channel,
                        created_lt,
                        subscribers,
                        "Published record"
                    ),
                    Err(e) => warn!(channel = %self.channel, created_lt, error = %e, "Failed to publish record"),
                }
            }
        });
        RecordForwarder { sender, task }
    }
}

/// Handle feeding records to a spawned publisher
pub struct RecordForwarder {
    sender: mpsc::Sender<Record>,
    task: JoinHandle<()>,
}

impl RecordForwarder {
    /// Queue a record without waiting
    pub fn forward(&self, record: Record) -> Result<(), PublishError> {
        forward_to(&self.sender, record)
    }

    /// A registry forwarding every category to the publisher
    pub fn registry(&self) -> CallbackRegistry {
        let mut registry = CallbackRegistry::new();
        let native = self.sender.clone();
        let jetton = self.sender.clone();
        let nft = self.sender.clone();
        registry
            .on_native(move |record| report(forward_to(&native, Record::Native(record))))
            .on_jetton(move |record| report(forward_to(&jetton, Record::Jetton(record))))
            .on_nft(move |record| report(forward_to(&nft, Record::Nft(record))));
        registry
    }

    /// Stop accepting records and wait for queued ones to be published
    ///
    /// Registries handed out by `registry()` keep the queue open until they are dropped.
    pub async fn close(self) {
        drop(self.sender);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Forwarder task failed");
        }
    }
}

fn forward_to(sender: &mpsc::Sender<Record>, record: Record) -> Result<(), PublishError> {
    sender.try_send(record).map_err(|e| match e {
        TrySendError::Full(_) => PublishError::QueueFull,
        TrySendError::Closed(_) => PublishError::QueueClosed,
    })
}

fn report(result: Result<(), PublishError>) {
    if let Err(e) = result {
        warn!(error = %e, "Record not forwarded");
    }
}
