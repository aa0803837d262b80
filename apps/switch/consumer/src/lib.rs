//! Switch Consumer
//!
//! Reads pacs.008 credit transfers from a Redis stream, checks liquidity,
//! validates them and pushes every outcome to dashboard subscribers.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (switch:transactions)
//!   ↓ (Consumer Group: switch-consumers)
//! Pipeline<RedisStreamSource>  ── 5 workers
//!   ↓ check-and-reserve debtor, credit creditor
//! Liquidity service (gRPC, breaker + retry, fail-open)
//!   ↓
//! BroadcastHub ── /ws subscribers (transaction, metrics, balances, status)
//! ```

pub mod balances;
pub mod config;
pub mod directory;
pub mod liquidity;
pub mod pacs008;
pub mod source;

use crate::config::ConsumerConfig;
use crate::directory::BankDirectory;
use crate::liquidity::LiquidityClient;
use crate::pacs008::Pacs008Rules;
use crate::source::{RedisStreamSource, StreamSettings};
use core_config::FromEnv;
use core_config::tracing::{init_tracing, install_color_eyre};
use eyre::{Result, WrapErr};
use relay_worker::{
    BroadcastHub, HealthState, HubConfig, HubHandle, LiquidityGuard, LiquidityService,
    MetricsSnapshot, Pipeline, PipelineConfig, PipelineCounters, Readiness, RelayError, ShutdownSignal,
    StartupGate, health_router, init_metrics, metrics::report_loop, monitor_dependency, shutdown,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

const METRICS_BROADCAST_EVERY: Duration = Duration::from_secs(1);
const METRICS_LOG_EVERY: Duration = Duration::from_secs(10);
const DEPENDENCY_POLL_EVERY: Duration = Duration::from_secs(30);
const BALANCES_FIRST_AFTER: Duration = Duration::from_secs(5);
const BALANCES_EVERY: Duration = Duration::from_secs(5 * 60);

fn load_directory(path: &str) -> BankDirectory {
    match BankDirectory::from_file(path) {
        Ok(directory) => {
            info!(path = %path, banks = directory.len(), "Loaded bank directory");
            directory
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Bank directory unavailable, BICs pass through");
            BankDirectory::default()
        }
    }
}

/// Serve health, metrics and `/ws` until shutdown.
async fn serve_http(listener: TcpListener, state: HealthState, mut shutdown: ShutdownSignal) -> Result<()> {
    let app = health_router(state).layer(CorsLayer::permissive());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await
        .wrap_err("HTTP server failed")
}

/// Handles shared between startup and the consuming half of the process.
struct Services {
    directory: Arc<BankDirectory>,
    guard: Arc<LiquidityGuard>,
    liquidity: Option<Arc<LiquidityClient>>,
    hub: HubHandle,
    counters: Arc<PipelineCounters>,
    readiness: Arc<Readiness>,
}

/// Run the switch consumer
///
/// 1. Loads configuration and sets up tracing and metrics
/// 2. Starts the HTTP server so probes answer during startup
/// 3. Waits for Redis (required) and the liquidity service (optional)
/// 4. Runs the pipeline until SIGINT/SIGTERM or a fatal source error
/// 5. Stops the hub only after the pipeline has drained, so every drained
///    result is still broadcast
pub async fn run() -> Result<()> {
    install_color_eyre();

    let config = ConsumerConfig::from_env().wrap_err("Failed to load consumer configuration")?;
    init_tracing(&config.environment);
    init_metrics().wrap_err("Failed to initialize metrics")?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        environment = config.environment.as_str(),
        "Starting switch consumer"
    );

    let directory = Arc::new(load_directory(&config.network_config));
    let pipeline_config = config.pipeline();

    let (trigger, signal) = shutdown::channel();
    let trigger = Arc::new(trigger);
    {
        let trigger = Arc::clone(&trigger);
        tokio::spawn(async move { trigger.trigger_on_os_signal().await });
    }
    // The hub outlives the pipeline so results drained after shutdown still
    // reach subscribers.
    let (hub_trigger, hub_signal) = shutdown::channel();

    let liquidity = match &config.liquidity_url {
        Some(url) => {
            let mut client = LiquidityClient::new(url).wrap_err("Failed to build liquidity client")?;
            if let Some(health_url) = &config.liquidity_health_url {
                client = client.with_health_url(health_url.as_str());
            }
            info!(endpoint = %client.endpoint(), health = %client.health_url(), "Liquidity client configured");
            Some(Arc::new(client))
        }
        None => None,
    };
    let service = liquidity
        .as_ref()
        .map(|client| Arc::clone(client) as Arc<dyn LiquidityService>);
    let guard = Arc::new(LiquidityGuard::new(service, &pipeline_config));

    let (hub, hub_task) = BroadcastHub::spawn(&HubConfig::default(), hub_signal);
    let counters = Arc::new(PipelineCounters::new());
    let readiness = Arc::new(Readiness::default());

    let state = HealthState::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        Arc::clone(&counters),
        Arc::clone(&readiness),
        hub.clone(),
    )
    .with_breaker(Arc::clone(guard.breaker()));

    let addr = config.socket_addr().wrap_err("Invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind HTTP server to {addr}"))?;
    info!(%addr, "HTTP server listening");
    let server = tokio::spawn(serve_http(listener, state, signal.clone()));

    let services = Services {
        directory,
        guard,
        liquidity,
        hub,
        counters,
        readiness,
    };
    let outcome = consume(&config, pipeline_config, services, signal).await;

    // Stop everything else if the pipeline ended on its own, then let the
    // hub flush what the drain broadcast.
    trigger.trigger();
    hub_trigger.trigger();

    if let Err(e) = hub_task.await {
        error!(error = %e, "Hub task failed");
    }
    match server.await {
        Ok(Err(e)) => error!(error = %e, "HTTP server stopped with error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
        Ok(Ok(())) => {}
    }

    match outcome? {
        Some(snapshot) => info!(
            processed = snapshot.processed,
            accepted = snapshot.accepted,
            rejected = snapshot.rejected,
            "Switch consumer shut down gracefully"
        ),
        None => info!("Shutdown during startup, switch consumer stopped"),
    }
    Ok(())
}

/// Gate on the dependencies, then run the pipeline to completion.
///
/// `None` means shutdown arrived while still gating.
async fn consume(
    config: &ConsumerConfig,
    pipeline_config: PipelineConfig,
    services: Services,
    signal: ShutdownSignal,
) -> Result<Option<MetricsSnapshot>> {
    let Services {
        directory,
        guard,
        liquidity,
        hub,
        counters,
        readiness,
    } = services;

    let gate = StartupGate::default();
    let mut gate_signal = signal.clone();

    let redis = redis::Client::open(config.redis_url.as_str()).wrap_err("Invalid REDIS_URL")?;
    match gate
        .wait_for("redis", &mut gate_signal, || source::ping(&redis))
        .await
    {
        Ok(()) => {}
        Err(RelayError::Shutdown) => return Ok(None),
        Err(e) => return Err(e).wrap_err("Redis never became ready"),
    }

    let mut stream = RedisStreamSource::connect(
        redis,
        StreamSettings {
            stream_name: config.stream_name.clone(),
            consumer_group: config.consumer_group.clone(),
            consumer_name: config.consumer_name.clone(),
            block: config.block,
            batch_size: config.batch_size,
        },
    )
    .await
    .wrap_err("Failed to connect to Redis")?;
    stream
        .init_consumer_group()
        .await
        .wrap_err("Failed to create consumer group")?;
    readiness.set_source(true);

    if guard.is_configured() {
        let dependency = Arc::clone(&guard);
        match gate
            .wait_for("liquidity", &mut gate_signal, || {
                let dependency = Arc::clone(&dependency);
                async move { dependency.ready().await }
            })
            .await
        {
            Ok(()) => {
                readiness.set_dependency(true);
            }
            Err(RelayError::Shutdown) => return Ok(None),
            Err(e) => warn!(error = %e, "Liquidity service unavailable, continuing fail-open"),
        }
        tokio::spawn(monitor_dependency(
            Arc::clone(&guard),
            Arc::clone(&readiness),
            DEPENDENCY_POLL_EVERY,
            signal.clone(),
        ));
    } else {
        info!("LIQUIDITY_URL not set, liquidity checks disabled");
        readiness.set_dependency(true);
    }

    tokio::spawn(report_loop(
        Arc::clone(&counters),
        hub.clone(),
        METRICS_BROADCAST_EVERY,
        METRICS_LOG_EVERY,
        signal.clone(),
    ));
    if let Some(client) = liquidity {
        tokio::spawn(balances::balance_loop(
            client,
            Arc::clone(&directory),
            hub.clone(),
            BALANCES_FIRST_AFTER,
            BALANCES_EVERY,
            signal.clone(),
        ));
    }

    info!(
        stream = %config.stream_name,
        group = %config.consumer_group,
        consumer = %config.consumer_name,
        workers = pipeline_config.workers,
        "Consumer ready"
    );

    let snapshot = Pipeline::new(
        pipeline_config,
        stream,
        Arc::new(Pacs008Rules::new(directory)),
        guard,
    )
    .with_hub(hub)
    .with_counters(counters)
    .run(signal)
    .await
    .wrap_err("Pipeline stopped on a source failure")?;
    Ok(Some(snapshot))
}
