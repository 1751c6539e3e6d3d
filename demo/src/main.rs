use anyhow::Context;
use async_trait::async_trait;
use es_broker::{BrokerConfig, BrokerConsumer, BrokerPublisher, InMemoryBroker};
use es_domain::entry::{AppendableStream, Entry, EntryBatch, EntryMetadata, Event, StreamId};
use es_domain::eventing::{
    EntryDispatcher, EntryHandler, EventHandler, EventPublisher, HandledEventType,
    HandlerRegistry, ReconciliationConfig, ReconciliationJob,
};
use es_domain::persist::{
    InMemoryStagingStore, InMemoryStreamStore, StagingWriter, StreamReader, StreamWriter,
};
use es_domain::serializer::{EntrySerializer, SerializerOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DemoConfig {
    reconciliation: ReconciliationConfig,
    broker: BrokerConfig,
    serializer: SerializerOptions,
}

impl DemoConfig {
    /// 第一个命令行参数为可选的 TOML 配置文件
    fn load() -> anyhow::Result<Self> {
        let Some(path) = std::env::args().nth(1) else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        toml::from_str(&raw).with_context(|| format!("parsing {path}"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountOpened {
    owner: String,
    initial_balance: i64,
}

impl Event for AccountOpened {
    const TYPE_ID: &'static str = "account.opened";
}

#[derive(Debug, Serialize, Deserialize)]
struct Deposited {
    amount: i64,
}

impl Event for Deposited {
    const TYPE_ID: &'static str = "account.deposited";
}

#[derive(Debug, Serialize, Deserialize)]
struct Withdrawn {
    amount: i64,
}

impl Event for Withdrawn {
    const TYPE_ID: &'static str = "account.withdrawn";
}

/// 读模型：账户余额
#[derive(Default)]
struct Balances {
    by_account: Mutex<HashMap<StreamId, i64>>,
}

impl Balances {
    fn apply(&self, account: StreamId, delta: i64) {
        let mut map = self.by_account.lock().unwrap_or_else(|e| e.into_inner());
        *map.entry(account).or_default() += delta;
    }

    fn get(&self, account: StreamId) -> Option<i64> {
        let map = self.by_account.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&account).copied()
    }
}

#[async_trait]
impl EventHandler<AccountOpened> for Arc<Balances> {
    fn handler_name(&self) -> &str {
        "balances.opened"
    }

    async fn handle(&self, event: AccountOpened, entry: &Entry) -> anyhow::Result<()> {
        tracing::info!(owner = %event.owner, account = %entry.stream_id(), "account opened");
        self.apply(entry.stream_id(), event.initial_balance);
        Ok(())
    }
}

#[async_trait]
impl EventHandler<Deposited> for Arc<Balances> {
    fn handler_name(&self) -> &str {
        "balances.deposited"
    }

    async fn handle(&self, event: Deposited, entry: &Entry) -> anyhow::Result<()> {
        self.apply(entry.stream_id(), event.amount);
        Ok(())
    }
}

#[async_trait]
impl EventHandler<Withdrawn> for Arc<Balances> {
    fn handler_name(&self) -> &str {
        "balances.withdrawn"
    }

    async fn handle(&self, event: Withdrawn, entry: &Entry) -> anyhow::Result<()> {
        self.apply(entry.stream_id(), -event.amount);
        Ok(())
    }
}

/// 审计：接收全部条目
struct AuditLog;

#[async_trait]
impl EntryHandler for AuditLog {
    fn handler_name(&self) -> &str {
        "audit"
    }

    fn handled_event_type(&self) -> HandledEventType {
        HandledEventType::All
    }

    async fn handle(&self, entry: &Entry) -> anyhow::Result<()> {
        tracing::info!(
            stream_id = %entry.stream_id(),
            sequence = %entry.sequence(),
            event_type = entry.type_identifier(),
            "audit"
        );
        Ok(())
    }
}

fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

fn describe<E: Event>(
    serializer: &EntrySerializer,
    stream: &mut AppendableStream,
    event: &E,
) -> anyhow::Result<()> {
    let metadata = EntryMetadata::builder()
        .correlation_id(format!("demo-{}", stream.stream_id()))
        .build();
    stream.append(serializer.describe(event)?, metadata)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();
    let config = DemoConfig::load()?;
    let serializer = EntrySerializer::new(config.serializer.clone());

    let staging = Arc::new(InMemoryStagingStore::new());
    let stream = Arc::new(InMemoryStreamStore::new());
    let broker = InMemoryBroker::new();

    let bus = Arc::new(BrokerPublisher::connect(
        Arc::new(broker.clone()),
        &config.broker,
        serializer.clone(),
    )?);
    let publisher = EventPublisher::builder()
        .staging(staging.clone())
        .stream(stream.clone())
        .bus(bus.clone())
        .build();

    let reconciliation = Arc::new(
        ReconciliationJob::builder()
            .staging(staging.clone())
            .stream(stream.clone())
            .bus(bus.clone())
            .config(config.reconciliation)
            .build(),
    )
    .start();

    // 消费侧：余额读模型 + 审计
    let balances = Arc::new(Balances::default());
    let registry = HandlerRegistry::default()
        .with_event_handler::<AccountOpened, _>(balances.clone(), &serializer)
        .with_event_handler::<Deposited, _>(balances.clone(), &serializer)
        .with_event_handler::<Withdrawn, _>(balances.clone(), &serializer)
        .with_handler(Arc::new(AuditLog));
    let dispatcher = Arc::new(EntryDispatcher::new(registry));
    let consumer = BrokerConsumer::builder()
        .connection(Arc::new(broker.clone()))
        .serializer(serializer.clone())
        .config(config.broker.clone())
        .build();
    let stop = CancellationToken::new();
    let consuming = {
        let stop = stop.clone();
        tokio::spawn(async move { consumer.run_with_dispatcher(dispatcher, stop).await })
    };

    // 1. 新批次：开户、存款、取款
    let alice = StreamId::new();
    let mut writer = AppendableStream::new(alice);
    describe(
        &serializer,
        &mut writer,
        &AccountOpened {
            owner: "alice".to_string(),
            initial_balance: 100,
        },
    )?;
    describe(&serializer, &mut writer, &Deposited { amount: 50 })?;
    describe(&serializer, &mut writer, &Withdrawn { amount: 30 })?;
    publisher.publish(&writer.take_batch()?).await?;

    // 2. 过期的写入者：冲突后重新读取流再重试
    let mut stale = AppendableStream::new(alice);
    describe(&serializer, &mut stale, &Deposited { amount: 10 })?;
    match publisher.publish(&stale.take_batch()?).await {
        Err(err) if err.is_concurrency_conflict() => {
            tracing::info!(error = %err, "stale writer rejected, retrying from stream head");
            let mut retry = AppendableStream::from_existing(alice, stream.next_sequence(alice).await?);
            describe(&serializer, &mut retry, &Deposited { amount: 10 })?;
            publisher.publish(&retry.take_batch()?).await?;
        }
        other => other?,
    }

    // 3. 追加成功后进程崩溃：由对账修复暂存状态并补发到总线
    let bob = StreamId::new();
    let mut crashed = AppendableStream::new(bob);
    describe(
        &serializer,
        &mut crashed,
        &AccountOpened {
            owner: "bob".to_string(),
            initial_balance: 20,
        },
    )?;
    let crashed: EntryBatch = crashed.take_batch()?;
    let staging_id = staging.write(&crashed).await?;
    let appended = stream.append(&crashed).await;
    tracing::info!(%staging_id, ?appended, "simulated crash before marking");

    let repair = ReconciliationJob::builder()
        .staging(staging.clone())
        .stream(stream.clone())
        .bus(bus.clone())
        .config(ReconciliationConfig {
            grace_period: Duration::ZERO,
            ..config.reconciliation
        })
        .build();
    let report = repair.run_once().await?;
    tracing::info!(?report, outcome = ?staging.outcome(staging_id), "reconciliation sweep");

    // 等待读模型追上
    let expected = 100 + 50 - 30 + 10;
    let caught_up = tokio::time::timeout(Duration::from_secs(5), async {
        while balances.get(alice) != Some(expected) || balances.get(bob) != Some(20) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    match caught_up {
        Ok(()) => tracing::info!(
            account = %alice,
            balance = expected,
            repaired = %bob,
            "read model caught up"
        ),
        Err(_) => tracing::warn!(account = %alice, balance = ?balances.get(alice), "read model lagging"),
    }

    stop.cancel();
    consuming.await??;
    reconciliation.shutdown();
    reconciliation.join().await;
    bus.shutdown().await;
    tracing::info!(stored = stream.entries(alice).len(), "demo finished");
    Ok(())
}
