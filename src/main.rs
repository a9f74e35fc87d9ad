use anyhow::{Context, Result};
use api::{http, service::QueueServiceImpl, sweep};
use clap::Parser;
use config::Config;
use domain::{
    clock::SystemClock,
    event::EventTransport,
    repository::{EntryRepository, ServiceRepository},
};
use infrastructure::{
    memory::MemoryStore,
    nats::{LogEventTransport, NATSEventTransport},
    postgres::{PgEntryRepository, PgServiceRepository},
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

mod api;
mod config;
mod domain;
mod infrastructure;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    config::configure_tracing(&config.env);

    match (&config.database_url, &config.nats_url) {
        (Some(db), Some(nats)) => {
            let (entries, services) = connect_postgres(db).await?;
            let event = connect_nats(nats).await?;
            serve(&config, entries, services, event).await
        }
        (Some(db), None) => {
            let (entries, services) = connect_postgres(db).await?;
            serve(&config, entries, services, LogEventTransport).await
        }
        (None, nats) => {
            warn!("DATABASE_URL not set, queue state lives in memory");
            let store = MemoryStore::new();

            match nats {
                Some(nats) => {
                    let event = connect_nats(nats).await?;
                    serve(&config, store.clone(), store, event).await
                }
                None => serve(&config, store.clone(), store, LogEventTransport).await,
            }
        }
    }
}

async fn connect_postgres(url: &str) -> Result<(PgEntryRepository, PgServiceRepository)> {
    let pool = PgPoolOptions::new()
        .connect(url)
        .await
        .context("connect postgres")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("run migrations")?;

    Ok((
        PgEntryRepository::new(pool.clone()),
        PgServiceRepository::new(pool),
    ))
}

async fn connect_nats(url: &str) -> Result<NATSEventTransport> {
    let nc = async_nats::connect(url).await.context("connect nats")?;

    Ok(NATSEventTransport::new(nc, "queue".to_string()))
}

async fn serve<ER, SR, E>(config: &Config, entries: ER, services: SR, event: E) -> Result<()>
where
    ER: EntryRepository,
    SR: ServiceRepository,
    E: EventTransport,
{
    let service = QueueServiceImpl::new(entries, services, event, SystemClock, config.policy());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "Listening");

    tokio::select! {
        res = axum::serve(listener, http::router(service.clone())) => {
            if let Err(e) = res {
                error!("HTTP server exited: {:?}", e);
            }
        }
        _ = sweep::run(service, config.sweep_interval(), config.sweep_batch()) => {
            error!("Sweep exited");
        }
    }

    info!("Exiting");

    Ok(())
}
