//! Scripted feed transport for session and pool tests.

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::decode::Frame;
use crate::models::Mmsi;
use crate::session::{
    Credential, FeedConnector, FeedStream, SubscriptionRequest, TransportError,
};

pub fn mmsi(value: u32) -> Mmsi {
    Mmsi::try_from(value).unwrap()
}

pub fn mmsi_set(values: &[u32]) -> BTreeSet<Mmsi> {
    values.iter().copied().map(mmsi).collect()
}

/// One scripted event on a stream; an exhausted script blocks forever,
/// like a quiet but healthy connection.
pub enum StreamEvent {
    Frame(Frame),
    Fault,
}

#[derive(Default)]
struct ScriptState {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    connects: AtomicUsize,
    subscriptions: Mutex<Vec<SubscriptionRequest>>,
    reject_subscribe: bool,
}

/// Connector handing out one scripted stream per connect call.
pub struct ScriptedConnector {
    state: Arc<ScriptState>,
}

impl ScriptedConnector {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(ScriptState {
                scripts: Mutex::new(scripts.into_iter().collect()),
                ..ScriptState::default()
            }),
        })
    }

    /// A connector whose broker refuses every subscription with the
    /// per-credential session limit error.
    pub fn rejecting_subscribe() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(ScriptState {
                reject_subscribe: true,
                ..ScriptState::default()
            }),
        })
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionRequest> {
        self.state.subscriptions.lock().unwrap().clone()
    }
}

impl FeedConnector for ScriptedConnector {
    type Stream = ScriptedStream;

    fn connect(
        &self,
        _credential: &Credential,
    ) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.connects.fetch_add(1, Ordering::SeqCst);
            let events = state.scripts.lock().unwrap().pop_front().unwrap_or_default();
            Ok(ScriptedStream {
                events: events.into(),
                state,
            })
        }
    }
}

pub struct ScriptedStream {
    events: VecDeque<StreamEvent>,
    state: Arc<ScriptState>,
}

impl FeedStream for ScriptedStream {
    fn subscribe(
        &mut self,
        request: &SubscriptionRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let reject = self.state.reject_subscribe;
        self.state.subscriptions.lock().unwrap().push(request.clone());
        async move {
            if reject {
                Err(TransportError::QuotaExceeded)
            } else {
                Ok(())
            }
        }
    }

    fn next_frame(&mut self) -> impl Future<Output = Result<Frame, TransportError>> + Send {
        let event = self.events.pop_front();
        async move {
            match event {
                Some(StreamEvent::Frame(frame)) => Ok(frame),
                Some(StreamEvent::Fault) => {
                    Err(TransportError::Disconnected("scripted fault".into()))
                }
                None => std::future::pending().await,
            }
        }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
