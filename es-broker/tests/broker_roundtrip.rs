use async_trait::async_trait;
use es_broker::{
    BrokerConfig, BrokerConsumer, BrokerPublisher, ConfirmBehavior, InMemoryBroker,
    transport::BrokerConnection, transport::MessageProperties,
};
use es_domain::entry::{AppendableStream, Entry, EntryBatch, EntryMetadata, Event, StreamId};
use es_domain::error::DomainResult;
use es_domain::eventing::{
    EntryBus, EntryDispatcher, EventHandler, EventPublisher, HandlerRegistry,
    ReconciliationConfig, ReconciliationJob,
};
use es_domain::persist::{
    InMemoryStagingStore, InMemoryStreamStore, StagingReader, StagingWriter, StreamWriter,
    WriteResult,
};
use es_domain::serializer::EntrySerializer;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const CONTEXT: &str = "Booking";
const QUEUE: &str = "EventSourcing.Booking";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeatBooked {
    seat: u32,
}

impl Event for SeatBooked {
    const TYPE_ID: &'static str = "booking.seat_booked";
}

#[derive(Default)]
struct Recorder {
    seats: Mutex<Vec<u32>>,
    fail: bool,
}

impl Recorder {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn seats(&self) -> Vec<u32> {
        self.seats.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler<SeatBooked> for Arc<Recorder> {
    fn handler_name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, event: SeatBooked, _entry: &Entry) -> anyhow::Result<()> {
        self.seats.lock().unwrap().push(event.seat);
        if self.fail {
            anyhow::bail!("seat {} rejected", event.seat);
        }
        Ok(())
    }
}

/// 在收到通知前一直挂起的处理器
struct Stalling {
    started: Arc<Notify>,
}

#[async_trait]
impl EventHandler<SeatBooked> for Stalling {
    fn handler_name(&self) -> &str {
        "stalling"
    }

    async fn handle(&self, _event: SeatBooked, _entry: &Entry) -> anyhow::Result<()> {
        self.started.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// 统计失败次数的总线包装
struct Observed {
    inner: Arc<BrokerPublisher>,
    failures: AtomicUsize,
}

#[async_trait]
impl EntryBus for Observed {
    async fn publish(&self, entry: &Entry) -> DomainResult<()> {
        let result = self.inner.publish(entry).await;
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

fn config() -> BrokerConfig {
    BrokerConfig {
        publish_timeout: Duration::from_secs(2),
        ..BrokerConfig::for_bounded_context(CONTEXT)
    }
}

fn batch(stream_id: StreamId, seats: &[u32], serializer: &EntrySerializer) -> EntryBatch {
    let mut stream = AppendableStream::new(stream_id);
    for seat in seats {
        stream.append(
            serializer.describe(&SeatBooked { seat: *seat }).unwrap(),
            EntryMetadata::default(),
        )
        .unwrap();
    }
    stream.take_batch().unwrap()
}

fn dispatcher_for(handler: impl EventHandler<SeatBooked> + 'static) -> Arc<EntryDispatcher> {
    let registry = HandlerRegistry::default()
        .with_event_handler::<SeatBooked, _>(handler, &EntrySerializer::default());
    Arc::new(EntryDispatcher::new(registry))
}

fn start_consumer(
    broker: &InMemoryBroker,
    dispatcher: Arc<EntryDispatcher>,
    concurrency: usize,
) -> (CancellationToken, tokio::task::JoinHandle<es_broker::BrokerResult<()>>) {
    let consumer = BrokerConsumer::builder()
        .connection(Arc::new(broker.clone()))
        .config(BrokerConfig {
            dispatch_concurrency: concurrency,
            ..config()
        })
        .build();
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run_with_dispatcher(dispatcher, cancel).await })
    };
    (cancel, task)
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn published_batch_reaches_handlers_in_stream_order() {
    let broker = InMemoryBroker::new();
    let serializer = EntrySerializer::default();
    let bus = Arc::new(
        BrokerPublisher::connect(Arc::new(broker.clone()), &config(), serializer.clone()).unwrap(),
    );
    let publisher = EventPublisher::builder()
        .staging(Arc::new(InMemoryStagingStore::new()))
        .stream(Arc::new(InMemoryStreamStore::new()))
        .bus(bus.clone())
        .build();

    let recorder = Arc::new(Recorder::default());
    let (cancel, consumer) = start_consumer(&broker, dispatcher_for(recorder.clone()), 1);

    publisher
        .publish(&batch(StreamId::new(), &[1, 2, 3], &serializer))
        .await
        .unwrap();

    wait_until(|| recorder.seats().len() == 3).await;
    assert_eq!(recorder.seats(), vec![1, 2, 3]);

    cancel.cancel();
    consumer.await.unwrap().unwrap();
    bus.shutdown().await;
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn failed_dispatch_is_acknowledged_not_retried() {
    let broker = InMemoryBroker::new();
    let serializer = EntrySerializer::default();
    let bus = BrokerPublisher::connect(Arc::new(broker.clone()), &config(), serializer.clone())
        .unwrap();

    let recorder = Arc::new(Recorder::failing());
    let (cancel, consumer) = start_consumer(&broker, dispatcher_for(recorder.clone()), 4);

    let entries = batch(StreamId::new(), &[7], &serializer).into_entries();
    bus.publish_all_with(&entries, &CancellationToken::new())
        .await
        .unwrap();
    wait_until(|| recorder.seats().len() == 1).await;

    cancel.cancel();
    consumer.await.unwrap().unwrap();

    // 已确认的消息不会再次投递
    let second = Arc::new(Recorder::default());
    let (cancel, consumer) = start_consumer(&broker, dispatcher_for(second.clone()), 4);
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    consumer.await.unwrap().unwrap();
    assert!(second.seats().is_empty());
}

#[tokio::test]
async fn cancelled_dispatch_is_redelivered_to_next_consumer() {
    let broker = InMemoryBroker::new();
    let serializer = EntrySerializer::default();
    let bus = BrokerPublisher::connect(Arc::new(broker.clone()), &config(), serializer.clone())
        .unwrap();

    let started = Arc::new(Notify::new());
    let (cancel, consumer) = start_consumer(
        &broker,
        dispatcher_for(Stalling {
            started: started.clone(),
        }),
        4,
    );

    let entries = batch(StreamId::new(), &[42], &serializer).into_entries();
    bus.publish_all_with(&entries, &CancellationToken::new())
        .await
        .unwrap();
    started.notified().await;

    cancel.cancel();
    consumer.await.unwrap().unwrap();

    let recorder = Arc::new(Recorder::default());
    let (cancel, consumer) = start_consumer(&broker, dispatcher_for(recorder.clone()), 4);
    wait_until(|| recorder.seats() == vec![42]).await;
    cancel.cancel();
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn undecodable_delivery_is_rejected_without_requeue() {
    let broker = InMemoryBroker::new();
    let serializer = EntrySerializer::default();
    let topology = config().topology();

    let mut raw = broker.create_channel().await.unwrap();
    topology.declare(raw.as_mut()).await.unwrap();
    raw.basic_publish(
        topology.exchange(),
        topology.routing_key(),
        MessageProperties::persistent("text/plain"),
        b"not an entry".to_vec(),
    )
    .await
    .unwrap();

    let bus = BrokerPublisher::connect(Arc::new(broker.clone()), &config(), serializer.clone())
        .unwrap();
    let entries = batch(StreamId::new(), &[5], &serializer).into_entries();
    bus.publish_all_with(&entries, &CancellationToken::new())
        .await
        .unwrap();

    let recorder = Arc::new(Recorder::default());
    let (cancel, consumer) = start_consumer(&broker, dispatcher_for(recorder.clone()), 1);
    wait_until(|| recorder.seats() == vec![5]).await;

    cancel.cancel();
    consumer.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn consumer_reports_unexpected_channel_loss() {
    let broker = InMemoryBroker::new();
    let (_cancel, consumer) =
        start_consumer(&broker, dispatcher_for(Arc::new(Recorder::default())), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.disconnect();

    let result = tokio::time::timeout(Duration::from_secs(2), consumer)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(es_broker::BrokerError::ChannelClosed { .. })
    ));
}

fn reconciler(
    staging: &Arc<InMemoryStagingStore>,
    stream: &Arc<InMemoryStreamStore>,
    bus: Arc<dyn EntryBus>,
) -> ReconciliationJob {
    ReconciliationJob::builder()
        .staging(staging.clone())
        .stream(stream.clone())
        .bus(bus)
        .config(ReconciliationConfig {
            grace_period: Duration::ZERO,
            ..Default::default()
        })
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batches_repaired_by_reconciliation_reach_the_consumer() {
    let broker = InMemoryBroker::new();
    let serializer = EntrySerializer::default();
    let bus = Arc::new(
        BrokerPublisher::connect(Arc::new(broker.clone()), &config(), serializer.clone()).unwrap(),
    );
    let staging = Arc::new(InMemoryStagingStore::new());
    let stream = Arc::new(InMemoryStreamStore::new());
    let publisher = EventPublisher::builder()
        .staging(staging.clone())
        .stream(stream.clone())
        .bus(bus.clone())
        .build();

    let recorder = Arc::new(Recorder::default());
    let (cancel, consumer) = start_consumer(&broker, dispatcher_for(recorder.clone()), 1);

    // 追加遇到未知失败，批次留在暂存区
    stream.fail_next_appends(1);
    publisher
        .publish(&batch(StreamId::new(), &[1, 2, 3], &serializer))
        .await
        .unwrap_err();

    // 追加成功后、标记之前崩溃
    let crashed = batch(StreamId::new(), &[4], &serializer);
    staging.write(&crashed).await.unwrap();
    assert_eq!(stream.append(&crashed).await, WriteResult::Success);

    let report = reconciler(&staging, &stream, bus.clone())
        .run_once()
        .await
        .unwrap();
    assert_eq!(report.reappended, 1);
    assert_eq!(report.published, 1);
    assert_eq!(report.forwarded, 2);

    wait_until(|| recorder.seats().len() == 4).await;
    let mut seats = recorder.seats();
    seats.sort_unstable();
    assert_eq!(seats, vec![1, 2, 3, 4]);
    assert!(staging.read_unforwarded().await.unwrap().is_empty());

    cancel.cancel();
    consumer.await.unwrap().unwrap();
    bus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nacked_forward_is_delivered_after_reconciliation() {
    let broker = InMemoryBroker::new();
    let serializer = EntrySerializer::default();
    let broker_bus = Arc::new(
        BrokerPublisher::connect(Arc::new(broker.clone()), &config(), serializer.clone()).unwrap(),
    );
    let bus = Arc::new(Observed {
        inner: broker_bus.clone(),
        failures: AtomicUsize::new(0),
    });
    let staging = Arc::new(InMemoryStagingStore::new());
    let stream = Arc::new(InMemoryStreamStore::new());
    let publisher = EventPublisher::builder()
        .staging(staging.clone())
        .stream(stream.clone())
        .bus(bus.clone())
        .build();

    let recorder = Arc::new(Recorder::default());
    let (cancel, consumer) = start_consumer(&broker, dispatcher_for(recorder.clone()), 1);

    broker.set_confirm_behavior(ConfirmBehavior::Nack);
    publisher
        .publish(&batch(StreamId::new(), &[7, 8], &serializer))
        .await
        .unwrap();
    wait_until(|| bus.failures.load(Ordering::SeqCst) > 0).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.seats().is_empty());
    assert_eq!(staging.read_unforwarded().await.unwrap().len(), 1);

    broker.set_confirm_behavior(ConfirmBehavior::Ack);
    let report = reconciler(&staging, &stream, bus.clone())
        .run_once()
        .await
        .unwrap();
    assert_eq!(report.forwarded, 1);

    wait_until(|| recorder.seats() == vec![7, 8]).await;
    assert!(staging.read_unforwarded().await.unwrap().is_empty());

    cancel.cancel();
    consumer.await.unwrap().unwrap();
    broker_bus.shutdown().await;
}
