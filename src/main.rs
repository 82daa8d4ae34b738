//! Vessel ingestion service

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

use ais_ingest::backoff::Backoff;
use ais_ingest::config::AppConfig;
use ais_ingest::database::Database;
use ais_ingest::errors::IngestError;
use ais_ingest::feed::MqttFeed;
use ais_ingest::filter::AdmissionFilter;
use ais_ingest::pool::PoolManager;
use ais_ingest::session::{
    Credential, FeedConnector, Session, SessionCommand, SubscriptionTarget,
};
use ais_ingest::stats::Stats;

/// How often the tracked vessel set is re-read from the store. External
/// collaborators add vessels out of band, so the pool has to follow.
const RETRACK_INTERVAL: Duration = Duration::from_secs(60);

/// Session id reserved for the discovery session
const DISCOVERY_SESSION_ID: usize = usize::MAX;

#[tokio::main]
async fn main() -> Result<(), IngestError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;

    let database = Database::from_url(&config.database.url).await?;
    let stats = Stats::new();
    let filter = AdmissionFilter::new(&config.filter);
    let connector = Arc::new(MqttFeed::new(&config.feed));

    let credentials: Vec<Credential> = config
        .feed
        .credentials
        .iter()
        .enumerate()
        .map(|(i, token)| Credential {
            label: format!("cred{i}"),
            token: token.clone(),
        })
        .collect();

    // An unfiltered discovery session feeds previously unseen vessels
    // into the store; the pool then picks them up on the next retrack.
    let mut discovery = None;
    if let Some(bbox) = config.feed.discovery {
        let credential = credentials
            .first()
            .cloned()
            .ok_or_else(|| IngestError::InsufficientCredentials {
                needed: 1,
                capacity: 0,
            })?;
        let (tx, rx) = mpsc::channel(8);
        let session = Session::new(
            DISCOVERY_SESSION_ID,
            Arc::clone(&connector),
            credential,
            SubscriptionTarget::BoundingBox {
                south: bbox.south,
                north: bbox.north,
                west: bbox.west,
                east: bbox.east,
            },
            config.pool.session_quota,
            filter.clone(),
            database.clone(),
            Arc::clone(&stats),
            config.stats.frame_interval,
            Backoff::new(&config.backoff),
            rx,
        );
        info!("starting discovery session over {:?}", bbox);
        discovery = Some((tx, tokio::spawn(session.run())));
    }

    let mut pool = PoolManager::new(
        connector,
        credentials,
        config.pool.clone(),
        config.backoff.clone(),
        &config.stats,
        filter,
        database.clone(),
        stats,
    );

    let shutdown_signal = signal::ctrl_c();

    tokio::select! {
        result = run_pool(&mut pool, &database) => {
            if let Err(e) = result {
                error!("ingestion pool failed: {}", e);
            }
        }
        _ = shutdown_signal => {
            info!("Received shutdown signal");
        }
    }

    pool.shutdown().await;
    if let Some((tx, handle)) = discovery {
        let _ = tx.send(SessionCommand::Close).await;
        let _ = handle.await;
    }

    Ok(())
}

/// Reconcile the pool against the stored vessel set, then keep it in
/// step as collaborators grow the set.
async fn run_pool<C>(pool: &mut PoolManager<C>, database: &Database) -> Result<(), IngestError>
where
    C: FeedConnector + 'static,
{
    let mut interval = tokio::time::interval(RETRACK_INTERVAL);

    loop {
        interval.tick().await;
        let tracked = database.tracked_vessels().await?;
        pool.retrack(&tracked).await?;
    }
}
