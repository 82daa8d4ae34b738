//! Session pool: partitions the tracked vessel set across credentials.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backoff::Backoff;
use crate::config::{BackoffConfig, PoolConfig, StatsConfig};
use crate::database::Database;
use crate::errors::IngestError;
use crate::filter::AdmissionFilter;
use crate::models::Mmsi;
use crate::session::{Credential, FeedConnector, Session, SessionCommand, SubscriptionTarget};
use crate::stats::SharedStats;

/// One session's share of the tracked set, bound to one credential.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub credential: Credential,
    pub vessels: BTreeSet<Mmsi>,
}

/// Pure partition of the tracked vessel set.
///
/// Sorted ids are chunked into `ceil(M / quota)` groups and the groups
/// are dealt round-robin across credentials. The chunking is stable: a
/// recomputation with an unchanged tracked set reproduces identical
/// assignments, and localized changes disturb only the chunks they
/// touch.
pub fn partition(
    credentials: &[Credential],
    tracked: &BTreeSet<Mmsi>,
    quota: usize,
    sessions_per_credential: usize,
) -> Result<Vec<Assignment>, IngestError> {
    let capacity = credentials.len() * sessions_per_credential;
    if quota == 0 || capacity == 0 {
        return Err(IngestError::InsufficientCredentials {
            needed: 1,
            capacity: 0,
        });
    }

    let ids: Vec<Mmsi> = tracked.iter().copied().collect();
    let groups: Vec<BTreeSet<Mmsi>> = ids
        .chunks(quota)
        .map(|chunk| chunk.iter().copied().collect())
        .collect();

    if groups.len() > capacity {
        return Err(IngestError::InsufficientCredentials {
            needed: groups.len(),
            capacity,
        });
    }

    Ok(groups
        .into_iter()
        .enumerate()
        .map(|(i, vessels)| Assignment {
            credential: credentials[i % credentials.len()].clone(),
            vessels,
        })
        .collect())
}

struct SessionSlot {
    assignment: Assignment,
    commands: mpsc::Sender<SessionCommand>,
    handle: JoinHandle<()>,
}

/// Owns the running sessions and reconciles them against the tracked
/// vessel set.
pub struct PoolManager<C: FeedConnector + 'static> {
    connector: Arc<C>,
    credentials: Vec<Credential>,
    pool_config: PoolConfig,
    backoff_config: BackoffConfig,
    filter: AdmissionFilter,
    database: Database,
    stats: SharedStats,
    stats_interval: u64,
    slots: Vec<SessionSlot>,
    next_session_id: usize,
}

impl<C: FeedConnector + 'static> PoolManager<C> {
    pub fn new(
        connector: Arc<C>,
        credentials: Vec<Credential>,
        pool_config: PoolConfig,
        backoff_config: BackoffConfig,
        stats_config: &StatsConfig,
        filter: AdmissionFilter,
        database: Database,
        stats: SharedStats,
    ) -> Self {
        Self {
            connector,
            credentials,
            pool_config,
            backoff_config,
            filter,
            database,
            stats,
            stats_interval: stats_config.frame_interval,
            slots: Vec::new(),
            next_session_id: 0,
        }
    }

    /// Reconcile running sessions with a new tracked vessel set.
    ///
    /// Sessions whose assigned subset is unchanged are left alone;
    /// changed subsets get a targeted resubscription; surplus sessions
    /// are closed and missing ones spawned.
    pub async fn retrack(&mut self, tracked: &BTreeSet<Mmsi>) -> Result<(), IngestError> {
        let assignments = partition(
            &self.credentials,
            tracked,
            self.pool_config.session_quota,
            self.pool_config.sessions_per_credential,
        )?;

        // close surplus sessions first to free their credentials
        while self.slots.len() > assignments.len() {
            let slot = self.slots.pop().expect("len checked");
            Self::close_slot(slot).await;
        }

        for (i, assignment) in assignments.into_iter().enumerate() {
            if i >= self.slots.len() {
                let slot = self.spawn_session(assignment);
                self.slots.push(slot);
                continue;
            }
            if self.slots[i].assignment == assignment {
                continue;
            }

            if self.slots[i].assignment.credential == assignment.credential {
                debug!(session_slot = i, "targeted resubscription");
                let sent = self.slots[i]
                    .commands
                    .send(SessionCommand::Resubscribe(assignment.vessels.clone()))
                    .await
                    .is_ok();
                if sent {
                    self.slots[i].assignment = assignment;
                    continue;
                }
                // session task is gone, fall through and replace it
            }

            // credential binding changed (or the session died), a
            // resubscription cannot carry the session over
            let slot = self.spawn_session(assignment);
            let old = std::mem::replace(&mut self.slots[i], slot);
            Self::close_slot(old).await;
        }

        info!(sessions = self.slots.len(), "pool reconciled");
        Ok(())
    }

    fn spawn_session(&mut self, assignment: Assignment) -> SessionSlot {
        let id = self.next_session_id;
        self.next_session_id += 1;

        let (tx, rx) = mpsc::channel(8);
        let session = Session::new(
            id,
            Arc::clone(&self.connector),
            assignment.credential.clone(),
            SubscriptionTarget::Vessels(assignment.vessels.clone()),
            self.pool_config.session_quota,
            self.filter.clone(),
            self.database.clone(),
            Arc::clone(&self.stats),
            self.stats_interval,
            Backoff::new(&self.backoff_config),
            rx,
        );

        info!(
            session = id,
            credential = %assignment.credential.label,
            vessels = assignment.vessels.len(),
            "starting session"
        );

        let handle = tokio::spawn(async move {
            match session.run().await {
                Ok(()) => debug!(session = id, "session finished"),
                // No blind respawn: a rejected credential or an oversized
                // assignment stays broken until the configuration changes.
                Err(e) => error!(session = id, "session stopped: {}", e),
            }
        });

        SessionSlot {
            assignment,
            commands: tx,
            handle,
        }
    }

    async fn close_slot(slot: SessionSlot) {
        let _ = slot.commands.send(SessionCommand::Close).await;
        let _ = slot.handle.await;
    }

    /// Close every session and wait for it to release its connection.
    pub async fn shutdown(&mut self) {
        info!(sessions = self.slots.len(), "pool shutting down");
        for slot in &self.slots {
            let _ = slot.commands.send(SessionCommand::Close).await;
        }
        for slot in self.slots.drain(..) {
            let _ = slot.handle.await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.slots.len()
    }

    pub fn assignments(&self) -> Vec<Assignment> {
        self.slots.iter().map(|s| s.assignment.clone()).collect()
    }
}
