//! MQTT implementation of the feed transport.
//!
//! One [`MqttFeedStream`] per session: its event loop is pumped by a
//! background task into a channel, and a transport-level failure ends
//! the stream rather than reconnecting here. Reconnecting is the
//! session supervisor's job, with its own backoff.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter,
    Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::FeedConfig;
use crate::decode::{Frame, FrameKind};
use crate::errors::IngestError;
use crate::session::{
    Credential, FeedConnector, FeedStream, SubscriptionRequest, SubscriptionTarget, TransportError,
};

/// Connector for the upstream MQTT-over-WSS feed.
pub struct MqttFeed {
    uri: String,
    port: u16,
    client_id: String,
}

impl MqttFeed {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            uri: config.uri.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
        }
    }

    /// Pump MQTT events into the frame channel until the connection dies.
    async fn pump_events(tx: mpsc::Sender<Result<Frame, TransportError>>, mut event_loop: EventLoop) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match parse_frame(&publish.topic, &publish.payload) {
                        Ok(frame) => {
                            if tx.send(Ok(frame)).await.is_err() {
                                // stream dropped, session is gone
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("unparseable publish on {}: {}", publish.topic, e);
                        }
                    }
                }
                Ok(_) => continue,
                Err(e) => {
                    let _ = tx
                        .send(Err(TransportError::Disconnected(e.to_string())))
                        .await;
                    break;
                }
            }
        }
    }
}

impl FeedConnector for MqttFeed {
    type Stream = MqttFeedStream;

    fn connect(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send {
        let mut options = MqttOptions::new(
            format!("{}-{}", self.client_id, credential.label),
            &self.uri,
            self.port,
        );
        options.set_transport(Transport::wss_with_default_config());
        options.set_keep_alive(Duration::from_secs(5));
        options.set_credentials(credential.label.clone(), credential.token.clone());

        async move {
            let (client, mut event_loop) = AsyncClient::new(options, 100);

            // Handshake: wait for the broker's CONNACK before handing the
            // stream out, so credential rejections surface at startup.
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => match ack.code {
                        ConnectReturnCode::Success => break,
                        // The broker signals its per-credential
                        // concurrent-session limit by refusing service.
                        ConnectReturnCode::ServiceUnavailable
                        | ConnectReturnCode::NotAuthorized => {
                            return Err(TransportError::QuotaExceeded)
                        }
                        code => {
                            return Err(TransportError::Handshake(format!(
                                "connection refused: {code:?}"
                            )))
                        }
                    },
                    Ok(_) => continue,
                    Err(e) => return Err(TransportError::Handshake(e.to_string())),
                }
            }
            info!("connected to MQTT broker");

            let (tx, rx) = mpsc::channel(100);
            let pump = tokio::spawn(Self::pump_events(tx, event_loop));

            Ok(MqttFeedStream {
                client,
                rx,
                pump,
                topics: BTreeSet::new(),
            })
        }
    }
}

pub struct MqttFeedStream {
    client: AsyncClient,
    rx: mpsc::Receiver<Result<Frame, TransportError>>,
    pump: JoinHandle<()>,
    topics: BTreeSet<String>,
}

impl FeedStream for MqttFeedStream {
    /// (Re)issue the subscription: unsubscribe topics no longer wanted,
    /// subscribe the new ones, leave the overlap alone.
    fn subscribe(
        &mut self,
        request: &SubscriptionRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let wanted = topics_for(request);
        let stale: Vec<String> = self.topics.difference(&wanted).cloned().collect();
        let fresh: Vec<String> = wanted.difference(&self.topics).cloned().collect();
        self.topics = wanted;

        async move {
            for topic in stale {
                self.client
                    .unsubscribe(topic)
                    .await
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
            }
            if !fresh.is_empty() {
                let filters = fresh
                    .into_iter()
                    .map(|topic| SubscribeFilter::new(topic, QoS::AtLeastOnce));
                self.client
                    .subscribe_many(filters)
                    .await
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
            }
            Ok(())
        }
    }

    fn next_frame(&mut self) -> impl Future<Output = Result<Frame, TransportError>> + Send {
        async move {
            match self.rx.recv().await {
                Some(result) => result,
                None => Err(TransportError::Disconnected("frame channel closed".into())),
            }
        }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            let _ = self.client.disconnect().await;
            self.pump.abort();
        }
    }
}

/// Topic set for a subscription request.
///
/// `vessels-v2/<mmsi>/<kind>` per tracked vessel; a bounding-box
/// discovery session subscribes the wildcard and relies on the broker's
/// regional scoping.
fn topics_for(request: &SubscriptionRequest) -> BTreeSet<String> {
    let mut topics = BTreeSet::new();
    match &request.target {
        SubscriptionTarget::Vessels(vessels) => {
            for mmsi in vessels {
                for kind in &request.kinds {
                    topics.insert(format!("vessels-v2/{}/{}", mmsi, kind.discriminant()));
                }
            }
        }
        SubscriptionTarget::BoundingBox { .. } => {
            for kind in &request.kinds {
                topics.insert(format!("vessels-v2/+/{}", kind.discriminant()));
            }
        }
    }
    topics
}

/// Parse one publish into a frame envelope based on its topic.
fn parse_frame(topic: &str, payload: &[u8]) -> Result<Frame, IngestError> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() < 3 || parts[0] != "vessels-v2" {
        return Err(IngestError::InvalidTopic(topic.to_string()));
    }

    let mmsi = parts[1].try_into()?;
    let kind = FrameKind::from_discriminant(parts[2])
        .map_err(|_| IngestError::InvalidTopic(topic.to_string()))?;

    Ok(Frame {
        mmsi,
        kind,
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mmsi, mmsi_set};

    #[test]
    fn parse_position_frame_envelope() {
        let frame = parse_frame("vessels-v2/123456/location", br#"{"time":1}"#).unwrap();
        assert_eq!(frame.mmsi, mmsi(123_456));
        assert_eq!(frame.kind, FrameKind::Position);
    }

    #[test]
    fn parse_identity_frame_envelopes() {
        let full = parse_frame("vessels-v2/123456/metadata", b"{}").unwrap();
        assert_eq!(full.kind, FrameKind::IdentityFull);

        let compact = parse_frame("vessels-v2/123456/metadata-compact", b"{}").unwrap();
        assert_eq!(compact.kind, FrameKind::IdentityCompact);
    }

    #[test]
    fn reject_foreign_topics() {
        assert!(parse_frame("weather/123456/metadata", b"{}").is_err());
        assert!(parse_frame("vessels-v2/123456", b"{}").is_err());
        assert!(parse_frame("vessels-v2/not-an-mmsi/location", b"{}").is_err());
        assert!(parse_frame("vessels-v2/123456/telemetry", b"{}").is_err());
    }

    #[test]
    fn vessel_topics_cover_every_kind() {
        let request = SubscriptionRequest {
            credential: Credential {
                label: "cred0".into(),
                token: "t".into(),
            },
            kinds: vec![
                FrameKind::IdentityFull,
                FrameKind::IdentityCompact,
                FrameKind::Position,
            ],
            target: SubscriptionTarget::Vessels(mmsi_set(&[235_010_926, 230_000_001])),
        };

        let topics = topics_for(&request);
        assert_eq!(topics.len(), 6);
        assert!(topics.contains("vessels-v2/235010926/location"));
        assert!(topics.contains("vessels-v2/230000001/metadata-compact"));
    }

    #[test]
    fn bounding_box_subscribes_wildcards() {
        let request = SubscriptionRequest {
            credential: Credential {
                label: "cred0".into(),
                token: "t".into(),
            },
            kinds: vec![FrameKind::Position],
            target: SubscriptionTarget::BoundingBox {
                south: 59.0,
                north: 66.0,
                west: 19.0,
                east: 32.0,
            },
        };

        let topics = topics_for(&request);
        assert_eq!(topics.len(), 1);
        assert!(topics.contains("vessels-v2/+/location"));
    }
}
