use std::{future::IntoFuture, pin::pin, process, sync::Arc};

use kvs::{
    application::{
        bus::InvalidationBus, consumers::InvalidationListener, error::AppError,
        repos::KeyValueStore, repository::KeyValueRepository,
    },
    cache::{CacheConfig, CacheStore},
    config::{self, Backend},
    domain::entities::NodeId,
    infra::{
        bus::{MemoryInvalidationBus, PostgresInvalidationBus},
        db::PostgresRepositories,
        error::InfraError,
        http::{self, ApiState},
        memory::MemoryKeyValueStore,
        telemetry,
    },
};
use sqlx::postgres::PgPool;
use tokio::{signal, sync::Notify};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let pool = connect_database(&settings).await?;
    info!(target: "kvs::migrate", "database migrations applied");
    pool.close().await;
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let node_id = NodeId::generate();
    let pool = if settings.requires_database() {
        Some(connect_database(&settings).await?)
    } else {
        None
    };

    let store = build_store(&settings, pool.as_ref())?;
    let bus = build_bus(&settings, pool.as_ref())?;
    let cache_config = CacheConfig::from(&settings.cache);
    let repository = Arc::new(KeyValueRepository::new(
        node_id,
        Arc::new(CacheStore::new()),
        store,
        Arc::clone(&bus),
        cache_config.clone(),
    ));

    info!(
        node_id = %node_id,
        store = ?settings.store.backend,
        bus = ?settings.bus.backend,
        "starting node"
    );

    // Subscribe before warming so nothing published meanwhile is missed.
    let listener = InvalidationListener::new(
        bus,
        Arc::clone(&repository),
        settings.bus.resubscribe_backoff,
    )
    .start()
    .await?;

    if cache_config.warm_on_startup {
        if let Err(err) = repository.warm().await {
            listener.abort();
            return Err(err.into());
        }
    }

    let result = serve_http(&settings, ApiState::new(repository)).await;

    listener.abort();
    let _ = listener.await;
    if let Some(pool) = pool {
        pool.close().await;
    }

    result
}

async fn connect_database(settings: &config::Settings) -> Result<PgPool, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| {
            InfraError::configuration(
                "database url is not configured (provide --database-url or set KVS__DATABASE__URL)",
            )
        })
        .map_err(AppError::from)?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::migration(err.to_string())))?;

    Ok(pool)
}

fn build_store(
    settings: &config::Settings,
    pool: Option<&PgPool>,
) -> Result<Arc<dyn KeyValueStore>, AppError> {
    match (settings.store.backend, pool) {
        (Backend::Postgres, Some(pool)) => Ok(Arc::new(PostgresRepositories::new(pool.clone()))),
        (Backend::Memory, _) => {
            warn!("using the in-memory store; data is lost on exit and not shared between nodes");
            Ok(Arc::new(MemoryKeyValueStore::new()))
        }
        (Backend::Postgres, None) => Err(AppError::from(InfraError::configuration(
            "postgres store selected without a database connection",
        ))),
    }
}

fn build_bus(
    settings: &config::Settings,
    pool: Option<&PgPool>,
) -> Result<Arc<dyn InvalidationBus>, AppError> {
    match (settings.bus.backend, pool) {
        (Backend::Postgres, Some(pool)) => Ok(Arc::new(PostgresInvalidationBus::new(pool.clone()))),
        (Backend::Memory, _) => Ok(Arc::new(MemoryInvalidationBus::new(settings.bus.capacity))),
        (Backend::Postgres, None) => Err(AppError::from(InfraError::configuration(
            "postgres bus selected without a database connection",
        ))),
    }
}

async fn serve_http(settings: &config::Settings, state: ApiState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "listening");

    let stopping = Arc::new(Notify::new());
    let trigger = Arc::clone(&stopping);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            trigger.notify_one();
        })
        .into_future();
    let mut server = pin!(server);

    tokio::select! {
        result = &mut server => {
            return result.map_err(|err| AppError::unexpected(format!("server error: {err}")));
        }
        _ = stopping.notified() => {}
    }

    let grace = settings.server.graceful_shutdown;
    match tokio::time::timeout(grace, server).await {
        Ok(result) => result.map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs(),
                "open connections did not drain in time, shutting down anyway"
            );
            Ok(())
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
