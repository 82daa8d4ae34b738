//! One long-lived streaming session against the upstream feed.
//!
//! A session owns exactly one credential and at most a fixed quota of
//! vessel identifiers. It drives the state machine
//! `Connecting → Subscribed → Streaming → Closing → Closed`, with
//! `Faulted` reachable from the first three; reconnection after a fault
//! goes through the session's own [`Backoff`]. The transport is behind
//! the [`FeedConnector`]/[`FeedStream`] traits so the machine runs
//! against a scripted stream in tests.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::database::Database;
use crate::decode::{self, DecodedRecord, Frame, FrameKind};
use crate::filter::AdmissionFilter;
use crate::models::Mmsi;
use crate::stats::SharedStats;

/// Transport-level failure. Fatal to the session's current connection,
/// never to the pool.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The bound credential already backs its limit of concurrent
    /// sessions. Persistent configuration problem, not worth blind
    /// reconnects.
    #[error("credential concurrent-session limit reached")]
    QuotaExceeded,
}

/// Session startup/stream failure surfaced to the pool manager.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("assigned {assigned} vessel ids, session quota is {quota}")]
    VesselQuotaExceeded { assigned: usize, quota: usize },

    #[error("credential rejected: concurrent-session limit reached")]
    CredentialRejected,
}

/// One upstream credential, assigned to a session by the pool manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub label: String,
    pub token: String,
}

/// What a session subscribes to: an explicit vessel set, or a
/// geographic box for unfiltered discovery sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionTarget {
    Vessels(BTreeSet<Mmsi>),
    BoundingBox {
        south: f64,
        north: f64,
        west: f64,
        east: f64,
    },
}

/// Subscription issued once per `Connecting → Subscribed` transition,
/// and re-issued on a targeted vessel-set change.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub credential: Credential,
    pub kinds: Vec<FrameKind>,
    pub target: SubscriptionTarget,
}

/// Establishes streaming connections; shared by all sessions.
pub trait FeedConnector: Send + Sync {
    type Stream: FeedStream + 'static;

    fn connect(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;
}

/// One live streaming connection.
pub trait FeedStream: Send {
    fn subscribe(
        &mut self,
        request: &SubscriptionRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Blocks until the next inbound frame.
    fn next_frame(&mut self) -> impl Future<Output = Result<Frame, TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Subscribed,
    Streaming,
    Closing,
    Closed,
    Faulted,
}

/// Control messages from the pool manager.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Replace the subscribed vessel set without tearing the session down
    Resubscribe(BTreeSet<Mmsi>),
    Close,
}

pub struct Session<C: FeedConnector> {
    id: usize,
    connector: Arc<C>,
    credential: Credential,
    target: SubscriptionTarget,
    quota: usize,
    filter: AdmissionFilter,
    database: Database,
    stats: SharedStats,
    stats_interval: u64,
    backoff: Backoff,
    commands: mpsc::Receiver<SessionCommand>,
    state: SessionState,
}

enum StreamEnd {
    Closed,
    Faulted,
}

enum Event {
    Command(Option<SessionCommand>),
    Frame(Result<Frame, TransportError>),
}

#[allow(clippy::too_many_arguments)]
impl<C: FeedConnector> Session<C> {
    pub fn new(
        id: usize,
        connector: Arc<C>,
        credential: Credential,
        target: SubscriptionTarget,
        quota: usize,
        filter: AdmissionFilter,
        database: Database,
        stats: SharedStats,
        stats_interval: u64,
        backoff: Backoff,
        commands: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        Self {
            id,
            connector,
            credential,
            target,
            quota,
            filter,
            database,
            stats,
            stats_interval,
            backoff,
            commands,
            state: SessionState::Connecting,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(session = self.id, from = ?self.state, to = ?state, "state transition");
        self.state = state;
    }

    fn request(&self) -> SubscriptionRequest {
        SubscriptionRequest {
            credential: self.credential.clone(),
            kinds: vec![
                FrameKind::IdentityFull,
                FrameKind::IdentityCompact,
                FrameKind::Position,
            ],
            target: self.target.clone(),
        }
    }

    /// Quota is a property of the upstream service and is checked before
    /// any subscription request leaves the process.
    fn check_quota(&self) -> Result<(), SessionError> {
        if let SubscriptionTarget::Vessels(vessels) = &self.target {
            if vessels.len() > self.quota {
                return Err(SessionError::VesselQuotaExceeded {
                    assigned: vessels.len(),
                    quota: self.quota,
                });
            }
        }
        Ok(())
    }

    /// Drive the session until shutdown or an unrecoverable startup error.
    pub async fn run(mut self) -> Result<(), SessionError> {
        loop {
            self.check_quota()?;
            self.set_state(SessionState::Connecting);

            let mut stream = match self.connector.connect(&self.credential).await {
                Ok(stream) => stream,
                Err(TransportError::QuotaExceeded) => {
                    self.stats.quota_rejection();
                    return Err(SessionError::CredentialRejected);
                }
                Err(e) => {
                    warn!(session = self.id, "connect failed: {}", e);
                    self.set_state(SessionState::Faulted);
                    self.stats.transport_fault();
                    if !self.wait_backoff().await {
                        return Ok(());
                    }
                    continue;
                }
            };

            match stream.subscribe(&self.request()).await {
                Ok(()) => {}
                Err(TransportError::QuotaExceeded) => {
                    self.stats.quota_rejection();
                    stream.close().await;
                    return Err(SessionError::CredentialRejected);
                }
                Err(e) => {
                    warn!(session = self.id, "subscribe failed: {}", e);
                    stream.close().await;
                    self.set_state(SessionState::Faulted);
                    self.stats.transport_fault();
                    if !self.wait_backoff().await {
                        return Ok(());
                    }
                    continue;
                }
            }
            self.set_state(SessionState::Subscribed);

            match self.stream_frames(&mut stream).await? {
                StreamEnd::Closed => {
                    self.set_state(SessionState::Closing);
                    stream.close().await;
                    self.set_state(SessionState::Closed);
                    info!(session = self.id, "closed");
                    return Ok(());
                }
                StreamEnd::Faulted => {
                    stream.close().await;
                    self.set_state(SessionState::Faulted);
                    self.stats.transport_fault();
                    if !self.wait_backoff().await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Process frames and commands until the stream faults or a close is
    /// requested. Per-frame errors never leave this loop.
    async fn stream_frames<S: FeedStream>(
        &mut self,
        stream: &mut S,
    ) -> Result<StreamEnd, SessionError> {
        loop {
            let event = tokio::select! {
                cmd = self.commands.recv() => Event::Command(cmd),
                frame = stream.next_frame() => Event::Frame(frame),
            };

            match event {
                Event::Command(Some(SessionCommand::Resubscribe(vessels))) => {
                    self.target = SubscriptionTarget::Vessels(vessels);
                    self.check_quota()?;
                    match stream.subscribe(&self.request()).await {
                        Ok(()) => {
                            debug!(session = self.id, "resubscribed");
                        }
                        Err(TransportError::QuotaExceeded) => {
                            self.stats.quota_rejection();
                            return Err(SessionError::CredentialRejected);
                        }
                        Err(e) => {
                            warn!(session = self.id, "resubscribe failed: {}", e);
                            return Ok(StreamEnd::Faulted);
                        }
                    }
                }
                // A dropped command channel means the pool is gone
                Event::Command(Some(SessionCommand::Close)) | Event::Command(None) => {
                    return Ok(StreamEnd::Closed);
                }
                Event::Frame(Ok(frame)) => {
                    if self.state != SessionState::Streaming {
                        self.set_state(SessionState::Streaming);
                        self.backoff.reset();
                    }
                    self.handle_frame(frame).await;
                }
                Event::Frame(Err(e)) => {
                    warn!(session = self.id, "stream fault: {}", e);
                    return Ok(StreamEnd::Faulted);
                }
            }
        }
    }

    /// Decode, filter, persist. All failures here cost one frame.
    async fn handle_frame(&self, frame: Frame) {
        match decode::decode(&frame) {
            Ok(DecodedRecord::Identity(identity)) => {
                if !self.filter.admit(&identity) {
                    self.stats.filter_rejection();
                } else if let Err(e) = self.database.upsert_identity(&identity).await {
                    self.stats.storage_error();
                    warn!(session = self.id, mmsi = %identity.mmsi, "identity upsert failed: {}", e);
                }
            }
            Ok(DecodedRecord::Position(position)) => {
                if let Err(e) = self.database.append_position(&position).await {
                    self.stats.storage_error();
                    warn!(session = self.id, mmsi = %position.mmsi, "position append failed: {}", e);
                }
            }
            Err(e) => {
                self.stats.decode_error();
                warn!(session = self.id, mmsi = %frame.mmsi, "frame dropped: {}", e);
            }
        }

        if self.stats.frame_processed(self.stats_interval) {
            match self.database.summary().await {
                Ok(summary) => self.stats.emit(&summary),
                Err(e) => warn!("statistics summary query failed: {}", e),
            }
        }
    }

    /// Sleep out the backoff delay, unless a close request arrives first.
    /// Returns false when the session should stop reconnecting.
    async fn wait_backoff(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        info!(
            session = self.id,
            attempt = self.backoff.attempt(),
            ?delay,
            "reconnecting after backoff"
        );

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(delay) => None,
            cmd = self.commands.recv() => Some(cmd),
        };

        match interrupted {
            None => true,
            Some(Some(SessionCommand::Resubscribe(vessels))) => {
                // applied on the next connect
                self.target = SubscriptionTarget::Vessels(vessels);
                true
            }
            Some(Some(SessionCommand::Close)) | Some(None) => {
                self.set_state(SessionState::Closed);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, FilterConfig};
    use crate::test_support::{mmsi, mmsi_set, ScriptedConnector, StreamEvent};
    use std::time::Duration;

    async fn scratch_database() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let db = Database::from_url(&url).await.unwrap();
        (db, dir)
    }

    fn backoff() -> Backoff {
        Backoff::new(&BackoffConfig {
            base: Duration::from_millis(10),
            max: Duration::from_millis(100),
        })
    }

    fn session(
        connector: Arc<ScriptedConnector>,
        target: SubscriptionTarget,
        quota: usize,
        database: Database,
        stats: SharedStats,
        commands: mpsc::Receiver<SessionCommand>,
    ) -> Session<ScriptedConnector> {
        Session::new(
            7,
            connector,
            Credential {
                label: "cred0".into(),
                token: "secret".into(),
            },
            target,
            quota,
            AdmissionFilter::new(&FilterConfig::default()),
            database,
            stats,
            0,
            backoff(),
            commands,
        )
    }

    fn identity_frame(mmsi_value: u32) -> Frame {
        Frame {
            mmsi: mmsi(mmsi_value),
            kind: FrameKind::IdentityFull,
            payload: br#"{"name":"SUULA","type":80,"refA":50,"refB":100,"refC":12,"refD":13,"imo":9267560}"#
                .to_vec(),
        }
    }

    fn position_frame(mmsi_value: u32) -> Frame {
        Frame {
            mmsi: mmsi(mmsi_value),
            kind: FrameKind::Position,
            payload: br#"{"time":1734361116,"lat":61.8,"lon":28.9,"sog":10.7,"cog":120.0,"heading":119}"#
                .to_vec(),
        }
    }

    #[tokio::test]
    async fn frames_flow_to_the_store() {
        let (db, _dir) = scratch_database().await;
        let connector = ScriptedConnector::new(vec![vec![
            StreamEvent::Frame(identity_frame(235_010_926)),
            StreamEvent::Frame(position_frame(235_010_926)),
        ]]);
        let stats = crate::stats::Stats::new();
        let (tx, rx) = mpsc::channel(8);

        let target = SubscriptionTarget::Vessels(mmsi_set(&[235_010_926]));
        let handle = tokio::spawn(
            session(Arc::clone(&connector), target, 50, db.clone(), Arc::clone(&stats), rx).run(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(SessionCommand::Close).await.unwrap();
        handle.await.unwrap().unwrap();

        let stored = db.vessel(mmsi(235_010_926)).await.unwrap().unwrap();
        assert_eq!(stored.identity.length, Some(150));
        assert_eq!(stored.identity.beam, Some(25));
        let positions = db.recent_positions(mmsi(235_010_926), 10).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(stats.frames(), 2);
        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn decode_error_does_not_fault_the_session() {
        let (db, _dir) = scratch_database().await;
        let garbage = Frame {
            mmsi: mmsi(235_010_926),
            kind: FrameKind::Position,
            payload: b"not json".to_vec(),
        };
        let connector = ScriptedConnector::new(vec![vec![
            StreamEvent::Frame(garbage),
            StreamEvent::Frame(identity_frame(235_010_926)),
        ]]);
        let stats = crate::stats::Stats::new();
        let (tx, rx) = mpsc::channel(8);

        let target = SubscriptionTarget::Vessels(mmsi_set(&[235_010_926]));
        let handle = tokio::spawn(
            session(Arc::clone(&connector), target, 50, db.clone(), Arc::clone(&stats), rx).run(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(SessionCommand::Close).await.unwrap();
        handle.await.unwrap().unwrap();

        // bad frame dropped, good frame survived, no reconnect
        assert!(db.vessel(mmsi(235_010_926)).await.unwrap().is_some());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn fault_triggers_backoff_and_resubscribe() {
        let (db, _dir) = scratch_database().await;
        let connector = ScriptedConnector::new(vec![vec![StreamEvent::Fault], vec![]]);
        let stats = crate::stats::Stats::new();
        let (tx, rx) = mpsc::channel(8);

        let target = SubscriptionTarget::Vessels(mmsi_set(&[235_010_926]));
        let handle = tokio::spawn(
            session(Arc::clone(&connector), target, 50, db.clone(), Arc::clone(&stats), rx).run(),
        );

        // the test backoff base is 10 ms, so the reconnect lands well
        // within this window
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(SessionCommand::Close).await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.subscriptions().len(), 2);
    }

    #[tokio::test]
    async fn oversized_assignment_is_rejected_before_connect() {
        let (db, _dir) = scratch_database().await;
        let connector = ScriptedConnector::new(vec![]);
        let stats = crate::stats::Stats::new();
        let (_tx, rx) = mpsc::channel(8);

        let vessels: Vec<u32> = (0..51).map(|i| 230_000_000 + i).collect();
        let target = SubscriptionTarget::Vessels(mmsi_set(&vessels));
        let err = session(Arc::clone(&connector), target, 50, db, stats, rx)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SessionError::VesselQuotaExceeded {
                assigned: 51,
                quota: 50
            }
        ));
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn credential_rejection_surfaces_to_the_pool() {
        let (db, _dir) = scratch_database().await;
        let connector = ScriptedConnector::rejecting_subscribe();
        let stats = crate::stats::Stats::new();
        let (_tx, rx) = mpsc::channel(8);

        let target = SubscriptionTarget::Vessels(mmsi_set(&[235_010_926]));
        let err = session(Arc::clone(&connector), target, 50, db, Arc::clone(&stats), rx)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::CredentialRejected));
    }

    #[tokio::test]
    async fn resubscribe_reissues_the_request_in_place() {
        let (db, _dir) = scratch_database().await;
        let connector = ScriptedConnector::new(vec![vec![]]);
        let stats = crate::stats::Stats::new();
        let (tx, rx) = mpsc::channel(8);

        let target = SubscriptionTarget::Vessels(mmsi_set(&[235_010_926]));
        let handle = tokio::spawn(
            session(Arc::clone(&connector), target, 50, db, stats, rx).run(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(SessionCommand::Resubscribe(mmsi_set(&[235_010_926, 230_000_001])))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(SessionCommand::Close).await.unwrap();
        handle.await.unwrap().unwrap();

        let subs = connector.subscriptions();
        assert_eq!(subs.len(), 2);
        assert_eq!(connector.connects(), 1, "resubscription must not reconnect");
        match &subs[1].target {
            SubscriptionTarget::Vessels(v) => assert_eq!(v.len(), 2),
            other => panic!("unexpected target {other:?}"),
        }
    }
}
