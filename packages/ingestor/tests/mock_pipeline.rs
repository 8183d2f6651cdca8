//! Mock Pipeline Integration Tests
//!
//! Runs full subscriptions against the in-process replay ledger (no node, no
//! Redis). Verifies feed → filter → decode → dispatch end to end, including
//! ordering, dropped transactions and recovery after a panicking callback.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::U256;
use async_trait::async_trait;

use tonwatch_ingestor::address::MsgAddress;
use tonwatch_ingestor::cell::{Cell, CellBuilder};
use tonwatch_ingestor::config::{ConfigError, NetworkConfigSource};
use tonwatch_ingestor::filter::{OP_JETTON_NOTIFY, OP_NFT_OWNERSHIP_ASSIGNED};
use tonwatch_ingestor::message::{BouncePhase, InboundMessage, InternalMessage, RawTransaction, TransactionDescription};
use tonwatch_ingestor::publisher::{MessageSink, PublishError, Publisher};
use tonwatch_ingestor::record::Record;
use tonwatch_ingestor::replay::{FixtureNftItem, FixtureTransaction, ReplayFixture, ReplayLedger};
use tonwatch_ingestor::session::{LedgerError, Session, SessionProvider};
use tonwatch_ingestor::{CallbackRegistry, LoopState, Subscription, SubscriptionConfig, SubscriptionError};

const ACCOUNT: &str = "EQAno5PEMnsMt26bPgnXeFMOBVzSNHor2ctgyALrg3oD5fy_";
const SENDER: &str = "0:7777777777777777777777777777777777777777777777777777777777777777";
const JETTON_OWNER: &str = "0:8888888888888888888888888888888888888888888888888888888888888888";
const NFT_ITEM: &str = "0:1111111111111111111111111111111111111111111111111111111111111111";
const NFT_OWNER: &str = "0:2222222222222222222222222222222222222222222222222222222222222222";
const NFT_COLLECTION: &str = "0:3333333333333333333333333333333333333333333333333333333333333333";

fn address(raw: &str) -> MsgAddress {
    raw.parse().unwrap()
}

fn config() -> SubscriptionConfig {
    SubscriptionConfig {
        initial_backoff_ms: 5,
        max_backoff_ms: 50,
        ..SubscriptionConfig::for_address(ACCOUNT)
    }
}

fn message(lt: u64, src: &str, body: Cell) -> InternalMessage {
    InternalMessage {
        ihr_disabled: true,
        bounce: false,
        bounced: false,
        src: address(src),
        dst: address(ACCOUNT),
        amount: U256::from(50_000_000u64),
        ihr_fee: U256::ZERO,
        fwd_fee: U256::from(666_672u64),
        created_lt: lt,
        created_at: 1_700_000_000 + lt as u32,
        body: Arc::new(body),
    }
}

fn text_cell(text: &str) -> Arc<Cell> {
    let mut builder = CellBuilder::new();
    builder.store_uint(0, 32).unwrap().store_bytes(text.as_bytes()).unwrap();
    Arc::new(builder.build())
}

fn native_tx(lt: u64, comment: &str) -> RawTransaction {
    let mut body = CellBuilder::new();
    body.store_uint(0, 32).unwrap().store_ref(text_cell(comment)).unwrap();
    RawTransaction::ordinary(lt, message(lt, SENDER, body.build()))
}

fn jetton_tx(lt: u64, query_id: u64, amount: u64) -> RawTransaction {
    let mut body = CellBuilder::new();
    body.store_uint(u64::from(OP_JETTON_NOTIFY), 32)
        .unwrap()
        .store_uint(query_id, 64)
        .unwrap()
        .store_amount(U256::from(amount))
        .unwrap()
        .store_address(&address(JETTON_OWNER))
        .unwrap();
    RawTransaction::ordinary(lt, message(lt, SENDER, body.build()))
}

fn nft_tx(lt: u64) -> RawTransaction {
    let mut body = CellBuilder::new();
    body.store_uint(u64::from(OP_NFT_OWNERSHIP_ASSIGNED), 32)
        .unwrap()
        .store_uint(0, 64)
        .unwrap()
        .store_address(&address(SENDER))
        .unwrap()
        .store_bit(false)
        .unwrap();
    RawTransaction::ordinary(lt, message(lt, NFT_ITEM, body.build()))
}

fn inbound(tx: RawTransaction) -> InternalMessage {
    match tx.in_msg {
        Some(InboundMessage::Internal(msg)) => msg,
        other => panic!("expected an internal message, got {other:?}"),
    }
}

fn nft_item(content_uri: Option<&str>) -> FixtureNftItem {
    FixtureNftItem {
        address: NFT_ITEM.to_string(),
        initialized: true,
        index: "42".to_string(),
        owner: NFT_OWNER.to_string(),
        collection: NFT_COLLECTION.to_string(),
        content_uri: content_uri.map(str::to_string),
    }
}

/// Collects every delivered record
#[derive(Clone, Default)]
struct Collector {
    records: Arc<Mutex<Vec<Record>>>,
}

impl Collector {
    fn registry(&self) -> CallbackRegistry {
        let mut registry = CallbackRegistry::new();
        let native = self.records.clone();
        let jetton = self.records.clone();
        let nft = self.records.clone();
        registry
            .on_native(move |r| native.lock().unwrap().push(Record::Native(r)))
            .on_jetton(move |r| jetton.lock().unwrap().push(Record::Jetton(r)))
            .on_nft(move |r| nft.lock().unwrap().push(Record::Nft(r)));
        registry
    }

    fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    async fn wait_for(&self, count: usize) -> Vec<Record> {
        wait_until(|| self.len() >= count).await;
        self.records()
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn start(ledger: &Arc<ReplayLedger>, collector: &Collector) -> Subscription {
    Subscription::start(&config(), ledger, collector.registry()).await.unwrap()
}

fn native_messages(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(|record| match record {
            Record::Native(r) => Some(r.body.message.clone()),
            _ => None,
        })
        .collect()
}

// ==================== End-to-end Scenario Tests ====================

#[tokio::test]
async fn test_native_transfer_with_comment() {
    let ledger = Arc::new(ReplayLedger::new(0));
    ledger.push_transaction(native_tx(1, "hello"));

    let collector = Collector::default();
    let subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(1).await;

    let Record::Native(record) = &records[0] else {
        panic!("expected a native record, got {:?}", records[0]);
    };
    assert_eq!(record.body.op_code, 0);
    assert_eq!(record.body.message, "hello");
    assert_eq!(record.envelope.src_addr, address(SENDER).to_string());
    assert_eq!(record.envelope.dst_addr, ACCOUNT);
    assert_eq!(record.envelope.amount, "50000000");
    assert_eq!(record.envelope.created_lt, 1);
    assert_eq!(subscription.position(), 1);
}

#[tokio::test]
async fn test_native_transfer_with_inline_comment() {
    let ledger = Arc::new(ReplayLedger::new(0));
    let mut body = CellBuilder::new();
    body.store_uint(0, 32).unwrap().store_bytes("спасибо".as_bytes()).unwrap();
    ledger.push_transaction(RawTransaction::ordinary(1, message(1, SENDER, body.build())));

    let collector = Collector::default();
    let _subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(1).await;

    assert_eq!(native_messages(&records), vec!["спасибо"]);
}

#[tokio::test]
async fn test_jetton_transfer_notification() {
    let ledger = Arc::new(ReplayLedger::new(0));
    ledger.push_transaction(jetton_tx(1, 7, 1_000_000_000));

    let collector = Collector::default();
    let _subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(1).await;

    let Record::Jetton(record) = &records[0] else {
        panic!("expected a jetton record, got {:?}", records[0]);
    };
    assert_eq!(record.body.op_code, OP_JETTON_NOTIFY);
    assert_eq!(record.body.query_id, 7);
    assert_eq!(record.body.amount, "1000000000");
    assert_eq!(record.body.sender, address(JETTON_OWNER).to_string());
    assert_eq!(record.body.message, "");
}

#[tokio::test]
async fn test_nft_ownership_assigned_with_offchain_content() {
    let fixture = ReplayFixture {
        nft_items: vec![nft_item(Some("https://nft.example.org/42.json"))],
        ..Default::default()
    };
    let ledger = Arc::new(ReplayLedger::from_fixture(&fixture).unwrap());
    ledger.push_transaction(nft_tx(1));

    let collector = Collector::default();
    let _subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(1).await;

    let Record::Nft(record) = &records[0] else {
        panic!("expected an NFT record, got {:?}", records[0]);
    };
    assert_eq!(record.body.op_code, OP_NFT_OWNERSHIP_ASSIGNED);
    assert!(record.body.initialized);
    assert_eq!(record.body.index, "42");
    assert_eq!(record.body.nft_address, address(NFT_ITEM).to_string());
    assert_eq!(record.body.owner_address, address(NFT_OWNER).to_string());
    assert_eq!(record.body.collection_address, address(NFT_COLLECTION).to_string());
    assert_eq!(record.body.meta, "https://nft.example.org/42.json");
}

#[tokio::test]
async fn test_nft_with_onchain_content_has_empty_meta() {
    let fixture = ReplayFixture {
        nft_items: vec![nft_item(None)],
        ..Default::default()
    };
    let ledger = Arc::new(ReplayLedger::from_fixture(&fixture).unwrap());
    ledger.push_transaction(nft_tx(1));

    let collector = Collector::default();
    let _subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(1).await;

    let Record::Nft(record) = &records[0] else {
        panic!("expected an NFT record, got {:?}", records[0]);
    };
    assert_eq!(record.body.meta, "");
    assert_eq!(record.body.owner_address, address(NFT_OWNER).to_string());
}

// ==================== Ordering Tests ====================

#[tokio::test]
async fn test_records_delivered_in_logical_time_order() {
    let ledger = Arc::new(ReplayLedger::new(0));
    for lt in (1..=30).rev() {
        ledger.push_transaction(native_tx(lt, &format!("tx-{lt}")));
    }

    let collector = Collector::default();
    let _subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(30).await;

    let lts: Vec<u64> = records.iter().map(Record::created_lt).collect();
    assert_eq!(lts, (1..=30).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_mixed_categories_keep_order() {
    let fixture = ReplayFixture {
        nft_items: vec![nft_item(None)],
        ..Default::default()
    };
    let ledger = Arc::new(ReplayLedger::from_fixture(&fixture).unwrap());
    ledger.push_transaction(native_tx(1, "first"));
    ledger.push_transaction(jetton_tx(2, 1, 10));
    ledger.push_transaction(nft_tx(3));
    ledger.push_transaction(native_tx(4, "last"));

    let collector = Collector::default();
    let _subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(4).await;

    let kinds: Vec<&str> = records.iter().map(|r| r.kind().name()).collect();
    assert_eq!(kinds, vec!["native", "jetton", "nft", "native"]);
}

#[tokio::test]
async fn test_only_transactions_after_last_lt_are_delivered() {
    let ledger = Arc::new(ReplayLedger::new(5));
    ledger.push_transaction(native_tx(3, "old"));
    ledger.push_transaction(native_tx(7, "new"));

    let collector = Collector::default();
    let subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(subscription.start_lt(), 5);
    assert_eq!(native_messages(&records), vec!["new"]);
    assert_eq!(collector.len(), 1);
}

#[tokio::test]
async fn test_live_transactions_follow_replayed_ones() {
    let ledger = Arc::new(ReplayLedger::new(0));
    ledger.push_transaction(native_tx(1, "replayed"));

    let collector = Collector::default();
    let _subscription = start(&ledger, &collector).await;
    collector.wait_for(1).await;

    ledger.push_transaction(native_tx(2, "live"));
    let records = collector.wait_for(2).await;
    assert_eq!(native_messages(&records), vec!["replayed", "live"]);
}

// ==================== Filtering Tests ====================

#[tokio::test]
async fn test_successful_bounce_is_not_reported() {
    let ledger = Arc::new(ReplayLedger::new(0));
    let mut bounced = native_tx(1, "reverted");
    bounced.description = TransactionDescription::Ordinary {
        aborted: true,
        bounce: Some(BouncePhase::Ok),
    };
    ledger.push_transaction(bounced);
    ledger.push_transaction(native_tx(2, "kept"));

    let collector = Collector::default();
    let _subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(native_messages(&records), vec!["kept"]);
    assert_eq!(collector.len(), 1);
}

#[tokio::test]
async fn test_unknown_opcode_and_malformed_body_are_dropped() {
    let ledger = Arc::new(ReplayLedger::new(0));

    let mut unknown = CellBuilder::new();
    unknown.store_uint(0x0f8a_7ea5, 32).unwrap();
    ledger.push_transaction(RawTransaction::ordinary(1, message(1, SENDER, unknown.build())));

    // jetton notification cut off before the sender
    let mut truncated = CellBuilder::new();
    truncated
        .store_uint(u64::from(OP_JETTON_NOTIFY), 32)
        .unwrap()
        .store_uint(9, 64)
        .unwrap()
        .store_amount(U256::from(1u64))
        .unwrap();
    ledger.push_transaction(RawTransaction::ordinary(2, message(2, SENDER, truncated.build())));

    ledger.push_transaction(native_tx(3, "still running"));

    let collector = Collector::default();
    let subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(1).await;

    assert_eq!(native_messages(&records), vec!["still running"]);
    assert_eq!(subscription.restarts(), 0);
    assert_eq!(subscription.state(), LoopState::Listening);
}

#[tokio::test]
async fn test_transaction_without_inbound_message_is_skipped() {
    let ledger = Arc::new(ReplayLedger::new(0));
    ledger.push_transaction(RawTransaction {
        lt: 1,
        now: 0,
        in_msg: None,
        description: TransactionDescription::TickTock,
    });
    ledger.push_transaction(native_tx(2, "after tick"));

    let collector = Collector::default();
    let _subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(1).await;
    assert_eq!(native_messages(&records), vec!["after tick"]);
}

// ==================== Recovery Tests ====================

#[tokio::test]
async fn test_recovers_after_panicking_callback() {
    let ledger = Arc::new(ReplayLedger::new(0));
    ledger.push_transaction(native_tx(1, "before"));
    ledger.push_transaction(native_tx(2, "boom"));
    ledger.push_transaction(native_tx(3, "after"));

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let seen = delivered.clone();
    let mut registry = CallbackRegistry::new();
    registry.on_native(move |record| {
        if record.body.message == "boom" {
            panic!("callback failure");
        }
        seen.lock().unwrap().push(record.body.message);
    });

    let subscription = Subscription::start(&config(), &ledger, registry).await.unwrap();
    wait_until(|| delivered.lock().unwrap().len() >= 2).await;

    assert_eq!(*delivered.lock().unwrap(), vec!["before", "after"]);
    assert_eq!(subscription.restarts(), 1);
    wait_until(|| subscription.state() == LoopState::Listening).await;

    ledger.push_transaction(native_tx(4, "later"));
    wait_until(|| delivered.lock().unwrap().len() >= 3).await;
    assert_eq!(delivered.lock().unwrap()[2], "later");
}

#[tokio::test]
async fn test_resubscribes_after_feed_interruption() {
    let ledger = Arc::new(ReplayLedger::new(0));
    ledger.push_transaction(native_tx(1, "one"));

    let collector = Collector::default();
    let subscription = start(&ledger, &collector).await;
    collector.wait_for(1).await;

    ledger.interrupt_feeds();
    ledger.push_transaction(native_tx(2, "two"));
    let records = collector.wait_for(2).await;

    assert_eq!(native_messages(&records), vec!["one", "two"]);
    assert_eq!(subscription.position(), 2);
}

#[tokio::test]
async fn test_handlers_registered_after_start() {
    let ledger = Arc::new(ReplayLedger::new(0));
    let subscription = Subscription::start(&config(), &ledger, CallbackRegistry::new())
        .await
        .unwrap();

    let collector = Collector::default();
    let records = collector.records.clone();
    subscription.on_native(move |r| records.lock().unwrap().push(Record::Native(r)));

    ledger.push_transaction(native_tx(1, "registered late"));
    let records = collector.wait_for(1).await;
    assert_eq!(native_messages(&records), vec!["registered late"]);
}

#[tokio::test]
async fn test_dropping_subscription_stops_delivery() {
    let ledger = Arc::new(ReplayLedger::new(0));
    let collector = Collector::default();
    let subscription = start(&ledger, &collector).await;

    ledger.push_transaction(native_tx(1, "delivered"));
    collector.wait_for(1).await;

    subscription.close();
    tokio::time::sleep(Duration::from_millis(20)).await;
    ledger.push_transaction(native_tx(2, "ignored"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(collector.len(), 1);
}

// ==================== Startup Failure Tests ====================

struct UnreachableNetwork;

#[async_trait]
impl SessionProvider for UnreachableNetwork {
    async fn connect(&self, _network: &NetworkConfigSource) -> Result<Session, LedgerError> {
        Err(LedgerError::ConnectionFailed("all liteservers timed out".to_string()))
    }
}

#[tokio::test]
async fn test_start_fails_for_invalid_address() {
    let ledger = Arc::new(ReplayLedger::new(0));
    let config = SubscriptionConfig::for_address("EQ-not-an-address");
    let result = Subscription::start(&config, &ledger, CallbackRegistry::new()).await;
    assert!(matches!(
        result,
        Err(SubscriptionError::InvalidConfig(ConfigError::InvalidAddress { .. }))
    ));
}

#[tokio::test]
async fn test_start_fails_when_network_unreachable() {
    let result = Subscription::start(&config(), &UnreachableNetwork, CallbackRegistry::new()).await;
    let Err(SubscriptionError::Connect(LedgerError::ConnectionFailed(reason))) = result else {
        panic!("expected a connection failure");
    };
    assert!(reason.contains("timed out"));
}

// ==================== Fixture File Tests ====================

#[tokio::test]
async fn test_subscription_from_fixture_file() {
    let fixture = ReplayFixture {
        last_lt: 0,
        seqno: 77,
        transactions: vec![
            FixtureTransaction::from_message(1, &inbound(native_tx(1, "from file"))).unwrap(),
            FixtureTransaction::from_message(2, &inbound(nft_tx(2))).unwrap(),
        ],
        nft_items: vec![nft_item(Some("ipfs://item-42"))],
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.json");
    std::fs::write(&path, fixture.to_json_pretty().unwrap()).unwrap();

    let ledger = Arc::new(ReplayLedger::load(&path).unwrap());
    let collector = Collector::default();
    let subscription = start(&ledger, &collector).await;
    let records = collector.wait_for(2).await;

    assert_eq!(subscription.block().seqno, 77);
    assert_eq!(native_messages(&records), vec!["from file"]);
    let Record::Nft(nft) = &records[1] else {
        panic!("expected an NFT record, got {:?}", records[1]);
    };
    assert_eq!(nft.body.meta, "ipfs://item-42");
}

// ==================== Publisher Tests ====================

/// Sink capturing published payloads in memory
#[derive(Clone, Default)]
struct CapturingSink {
    published: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl MessageSink for CapturingSink {
    async fn publish(&mut self, channel: &str, payload: String) -> Result<i64, PublishError> {
        self.published.lock().unwrap().push((channel.to_string(), payload));
        Ok(1)
    }
}

#[tokio::test]
async fn test_records_forwarded_to_publisher() {
    let ledger = Arc::new(ReplayLedger::new(0));
    ledger.push_transaction(native_tx(1, "to redis"));
    ledger.push_transaction(jetton_tx(2, 3, 500));

    let sink = CapturingSink::default();
    let forwarder = Publisher::with_default_channel(sink.clone()).spawn_forwarder(16);
    let subscription = Subscription::start(&config(), &ledger, forwarder.registry())
        .await
        .unwrap();

    wait_until(|| sink.published.lock().unwrap().len() >= 2).await;
    subscription.close();

    let published = sink.published.lock().unwrap().clone();
    assert_eq!(published[0].0, "tonwatch_records");
    let first: serde_json::Value = serde_json::from_str(&published[0].1).unwrap();
    let second: serde_json::Value = serde_json::from_str(&published[1].1).unwrap();
    assert_eq!(first["category"], "native");
    assert_eq!(first["record"]["body"]["message"], "to redis");
    assert_eq!(second["category"], "jetton");
    assert_eq!(second["record"]["body"]["amount"], "500");
}
