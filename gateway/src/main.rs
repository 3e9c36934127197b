use anyhow::Context;
use model_gateway::app::AppState;
use model_gateway::batch::BatchWorker;
use model_gateway::clock::SystemClock;
use model_gateway::config::GatewayConfig;
use model_gateway::counter::{CounterStore, InMemoryCounterStore, RedisCounterStore};
use model_gateway::files::InMemoryFileStore;
use model_gateway::handlers;
use model_gateway::providers::{AnthropicBackend, OpenAiBackend, ProviderRegistry};
use model_gateway::store::PgStore;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = Arc::new(GatewayConfig::from_env()?);
    let clock = Arc::new(SystemClock);

    let store = PgStore::connect(&config.database_url).await?;
    sqlx::migrate!("./migrations")
        .run(store.pool())
        .await
        .context("Failed to run migrations")?;
    let store: Arc<dyn model_gateway::store::Store> = Arc::new(store);

    let counter: Arc<dyn CounterStore> = match &config.redis_url {
        Some(url) => {
            info!("Using Redis counter store");
            Arc::new(RedisCounterStore::new(url, config.redis_prefix.clone()).await?)
        }
        None => {
            info!("REDIS_URL not set; using in-memory counter store");
            Arc::new(InMemoryCounterStore::new())
        }
    };

    let provider_client = Client::builder().timeout(config.provider_timeout).build()?;
    let registry = ProviderRegistry {
        openai: config.openai_api_key.as_ref().map(|key| {
            Arc::new(OpenAiBackend::new(
                provider_client.clone(),
                config.openai_base_url.clone(),
                key.clone(),
            ))
        }),
        anthropic: config.anthropic_api_key.as_ref().map(|key| {
            Arc::new(AnthropicBackend::new(
                provider_client.clone(),
                config.anthropic_base_url.clone(),
                key.clone(),
            ))
        }),
    };

    let files = Arc::new(InMemoryFileStore::new(clock.clone()));
    let state = AppState::assemble(
        config.clone(),
        store.clone(),
        files.clone(),
        counter,
        Arc::new(registry),
        clock.clone(),
    )
    .await?;
    state.spawn_catalog_refresh(Duration::from_secs(config.key_refresh_secs));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for worker in 0..config.batch_workers {
        let worker_loop = BatchWorker::new(
            store.clone(),
            files.clone(),
            state.executor.clone(),
            state.contexts.clone(),
            clock.clone(),
            config.batch_poll_interval,
            config.batch_error_backoff,
            shutdown_rx.clone(),
        );
        info!(worker, "Spawning batch worker");
        tokio::spawn(worker_loop.run());
    }

    let app = handlers::router(state).layer(CorsLayer::permissive());
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received; stopping batch workers");
    let _ = shutdown_tx.send(true);
}
