use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use tokio::signal;

use probe::config::{Config, ObjectStoreKind};
use probe::gateway::RequestGateway;
use probe::registry::EventRegistry;
use probe::router::router;
use probe::schema::client::SchemaRegistryClient;
use probe::schema::SerdeFactory;
use probe::storage::{MemoryObjectStore, ObjectStore, S3ObjectStore};
use probe::supervisor::{supervise_coordinator, ProbeChildSpawner, SupervisorOutcome};

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };
    tracing::info!("shutting down gracefully...");
}

async fn boot(config: Config) -> anyhow::Result<ExitCode> {
    let liveness = health::HealthRegistry::new("liveness");
    let server_liveness = liveness.register("http-server", time::Duration::seconds(60)).await;

    let store: Arc<dyn ObjectStore> = match config.object_store {
        ObjectStoreKind::S3 => Arc::new(S3ObjectStore::from_env().await),
        ObjectStoreKind::Memory => {
            tracing::warn!("using the in-memory object store, tests will not see real buckets");
            Arc::new(MemoryObjectStore::new())
        }
    };
    let schema_registry = Arc::new(SchemaRegistryClient::new(
        &config.schema_registry_url,
        Duration::from_secs(10),
    )?);
    let serde_factory = Arc::new(SerdeFactory::new(schema_registry));
    let event_registry = Arc::new(EventRegistry::new(config.timeouts.produce_ack.0));

    let spawner = Arc::new(ProbeChildSpawner::new(
        config.clone(),
        store,
        serde_factory,
        event_registry.clone(),
    )?);
    let (coordinator, supervision) =
        supervise_coordinator(event_registry, spawner, config.timeouts.clone());

    let gateway = Arc::new(RequestGateway::new(coordinator, &config.breaker));
    let app = router(gateway, liveness, config.export_prometheus);

    let listener = tokio::net::TcpListener::bind(config.address).await?;
    tracing::info!("listening on {}", config.address);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        loop {
            ticker.tick().await;
            server_liveness.beat().await;
        }
    });

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown())
            .await
    });

    tokio::select! {
        served = server => {
            served??;
            tracing::info!("http server stopped");
            Ok(ExitCode::SUCCESS)
        }
        outcome = supervision => {
            match outcome? {
                SupervisorOutcome::Finished => Ok(ExitCode::SUCCESS),
                SupervisorOutcome::RestartBudgetExceeded => {
                    tracing::error!("supervisor gave up on the queue coordinator");
                    Ok(ExitCode::from(2))
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    match boot(config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("startup failed: {e}");
            ExitCode::from(1)
        }
    }
}
