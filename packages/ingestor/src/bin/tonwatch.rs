//! # tonwatch
//!
//! Follows one account on a replay ledger and prints every decoded transfer as
//! pretty JSON. Press Ctrl-C to stop.
//!
//! # Environment Variables
//!
//! - `TONWATCH_ADDRESS` - account to follow (raw or user-friendly form)
//! - `TONWATCH_LOG` - log level, defaults to `info`
//! - `TONWATCH_REDIS_URL` - when set, records are also published to Redis
//! - `TONWATCH_REDIS_CHANNEL` - Redis channel, defaults to `tonwatch_records`
//!
//! ```sh
//! TONWATCH_ADDRESS=EQ... tonwatch fixture.json
//! ```

use std::sync::Arc;

use tokio::signal;
use tracing::{info, Level};

use tonwatch_ingestor::handlers::CallbackRegistry;
use tonwatch_ingestor::publisher::{Publisher, DEFAULT_CHANNEL, DEFAULT_FORWARD_CAPACITY};
use tonwatch_ingestor::record::Record;
use tonwatch_ingestor::replay::ReplayLedger;
use tonwatch_ingestor::{Subscription, SubscriptionConfig};

const ENV_LOG: &str = "TONWATCH_LOG";
const ENV_REDIS_URL: &str = "TONWATCH_REDIS_URL";
const ENV_REDIS_CHANNEL: &str = "TONWATCH_REDIS_CHANNEL";

fn print_record(record: &Record) {
    let json = match record {
        Record::Native(r) => r.to_json_pretty(),
        Record::Jetton(r) => r.to_json_pretty(),
        Record::Nft(r) => r.to_json_pretty(),
    };
    match json {
        Ok(json) => println!("[{}]\n{json}", record.kind().name()),
        Err(e) => eprintln!("failed to serialize record: {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var(ENV_LOG)
        .ok()
        .and_then(|value| value.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    let fixture = std::env::args()
        .nth(1)
        .ok_or("usage: tonwatch <fixture.json>")?;
    let ledger = Arc::new(ReplayLedger::load(&fixture)?);
    let config = SubscriptionConfig::from_env()?;

    let forwarder = match std::env::var(ENV_REDIS_URL) {
        Ok(url) => {
            let channel = std::env::var(ENV_REDIS_CHANNEL).unwrap_or_else(|_| DEFAULT_CHANNEL.to_string());
            let publisher = Publisher::connect(&url, channel).await?;
            info!(channel = publisher.channel(), "Publishing records to Redis");
            Some(publisher.spawn_forwarder(DEFAULT_FORWARD_CAPACITY))
        }
        Err(_) => None,
    };

    let forwarded = forwarder.as_ref().map(|forwarder| forwarder.registry());
    let deliver = Arc::new(move |record: Record| {
        print_record(&record);
        if let Some(forwarded) = &forwarded {
            forwarded.dispatch(record);
        }
    });

    let mut registry = CallbackRegistry::new();
    let native = deliver.clone();
    let jetton = deliver.clone();
    registry
        .on_native(move |record| native(Record::Native(record)))
        .on_jetton(move |record| jetton(Record::Jetton(record)))
        .on_nft(move |record| deliver(Record::Nft(record)));

    let subscription = Subscription::start(&config, &ledger, registry).await?;
    info!(
        address = %subscription.address(),
        block = %subscription.block(),
        start_lt = subscription.start_lt(),
        "Watching account (Ctrl-C to stop)"
    );

    signal::ctrl_c().await?;
    info!(
        position = subscription.position(),
        restarts = subscription.restarts(),
        "Shutting down"
    );
    subscription.close();
    if let Some(forwarder) = forwarder {
        forwarder.close().await;
    }
    Ok(())
}
