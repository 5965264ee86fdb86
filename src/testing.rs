//! In-memory collaborators for unit and scenario tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::{BusError, CallError, MediaError};
use crate::peer::connection::{PeerConnection, PeerConnectionFactory, TransportEvent, TransportSink};
use crate::peer::media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};
use crate::peer::types::{IceCandidate, PeerInfo, SdpKind, SessionDescription};
use crate::signaling::{IdentityProvider, InboundHandler, SignalBus};
use crate::utils::random_id;

// ---------------------------------------------------------------------------
// Bus

#[derive(Default)]
struct Hub {
    next_client: usize,
    subs: HashMap<(usize, String), Option<InboundHandler>>,
    subscribe_counts: HashMap<String, usize>,
    never_confirm: HashSet<String>,
    reject_next: HashSet<String>,
    published: HashMap<String, Vec<Value>>,
}

/// One client's view of a shared in-memory pub/sub hub.
pub struct MemoryBus {
    hub: Arc<Mutex<Hub>>,
    client: usize,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hub: Arc::new(Mutex::new(Hub {
                next_client: 1,
                ..Hub::default()
            })),
            client: 0,
        })
    }

    /// Another client on the same hub.
    pub fn connect(&self) -> Arc<Self> {
        let mut hub = self.hub.lock().unwrap();
        let client = hub.next_client;
        hub.next_client += 1;
        Arc::new(Self {
            hub: self.hub.clone(),
            client,
        })
    }

    pub fn collector() -> (InboundHandler, Arc<Mutex<Vec<Value>>>) {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = inbox.clone();
        let handler: InboundHandler = Arc::new(move |payload| sink.lock().unwrap().push(payload));
        (handler, inbox)
    }

    /// Subscriptions to `channel` hang forever.
    pub fn never_confirm(&self, channel: &str) {
        self.hub.lock().unwrap().never_confirm.insert(channel.to_string());
    }

    pub fn reject_next(&self, channel: &str) {
        self.hub.lock().unwrap().reject_next.insert(channel.to_string());
    }

    pub fn subscribe_count(&self, channel: &str) -> usize {
        self.hub
            .lock()
            .unwrap()
            .subscribe_counts
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.hub.lock().unwrap().subs.keys().any(|(_, c)| c == channel)
    }

    pub fn published(&self, channel: &str) -> Vec<Value> {
        self.hub
            .lock()
            .unwrap()
            .published
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Kinds (`"offer"`, `"ice-candidate"`, ...) published on `channel`, in order.
    pub fn published_kinds(&self, channel: &str) -> Vec<String> {
        self.published(channel)
            .iter()
            .filter_map(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl SignalBus for MemoryBus {
    async fn subscribe(
        &self,
        channel: &str,
        handler: Option<InboundHandler>,
    ) -> Result<(), BusError> {
        let hang = {
            let mut hub = self.hub.lock().unwrap();
            *hub.subscribe_counts.entry(channel.to_string()).or_default() += 1;
            if hub.reject_next.remove(channel) {
                return Err(BusError::SubscriptionRejected(channel.to_string()));
            }
            hub.never_confirm.contains(channel)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.hub
            .lock()
            .unwrap()
            .subs
            .insert((self.client, channel.to_string()), handler);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Value) -> Result<(), BusError> {
        let handlers: Vec<InboundHandler> = {
            let mut hub = self.hub.lock().unwrap();
            hub.published
                .entry(channel.to_string())
                .or_default()
                .push(payload.clone());
            hub.subs
                .iter()
                .filter(|((_, c), _)| c == channel)
                .filter_map(|(_, h)| h.clone())
                .collect()
        };
        for handler in handlers {
            handler(payload.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) {
        self.hub
            .lock()
            .unwrap()
            .subs
            .remove(&(self.client, channel.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Identity

pub struct FakeIdentity(Option<PeerInfo>);

impl FakeIdentity {
    pub fn new(id: &str, name: &str) -> Arc<Self> {
        Arc::new(Self(Some(PeerInfo::new(
            id,
            name,
            format!("https://avatars.example/{id}.png"),
        ))))
    }

    pub fn anonymous() -> Arc<Self> {
        Arc::new(Self(None))
    }
}

impl IdentityProvider for FakeIdentity {
    fn current_user(&self) -> Option<PeerInfo> {
        self.0.clone()
    }
}

// ---------------------------------------------------------------------------
// Media

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stops: AtomicUsize,
}

impl FakeTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: format!("{kind}-{}", random_id()),
            kind,
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeDevices {
    denied: AtomicBool,
    stalled: AtomicBool,
    requests: Mutex<Vec<MediaConstraints>>,
    issued: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    /// Leave every later request waiting on a permission prompt forever.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().unwrap().clone()
    }

    pub fn issued_tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        self.requests.lock().unwrap().push(constraints);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.denied.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(FakeTrack::new(TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(FakeTrack::new(TrackKind::Video));
        }
        self.issued.lock().unwrap().extend(tracks.iter().cloned());
        Ok(MediaStream::new(
            tracks
                .into_iter()
                .map(|t| t as Arc<dyn MediaTrack>)
                .collect(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Peer connection

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signaling {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug)]
struct PeerInner {
    signaling: Signaling,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    rejected: HashSet<String>,
    tracks: Vec<TrackKind>,
    closes: usize,
    fail_remote: bool,
}

/// Scripted peer connection that enforces offer/answer ordering and refuses
/// candidates before a remote description.
#[derive(Debug)]
pub struct FakePeer {
    label: String,
    inner: Mutex<PeerInner>,
}

impl FakePeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            label: random_id(),
            inner: Mutex::new(PeerInner {
                signaling: Signaling::Stable,
                local: None,
                remote: None,
                applied: Vec::new(),
                rejected: HashSet::new(),
                tracks: Vec::new(),
                closes: 0,
                fail_remote: false,
            }),
        })
    }

    pub fn as_dyn(&self) -> &dyn PeerConnection {
        self
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().unwrap().applied.clone()
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.inner
            .lock()
            .unwrap()
            .rejected
            .insert(candidate.to_string());
    }

    pub fn fail_set_remote(&self) {
        self.inner.lock().unwrap().fail_remote = true;
    }

    /// Pretend the offer/answer exchange already completed.
    pub fn force_stable(&self) {
        self.inner.lock().unwrap().signaling = Signaling::Stable;
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().unwrap().remote.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().unwrap().local.clone()
    }

    pub fn local_tracks(&self) -> Vec<TrackKind> {
        self.inner.lock().unwrap().tracks.clone()
    }

    pub fn close_count(&self) -> usize {
        self.inner.lock().unwrap().closes
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_track(
        &self,
        track: &dyn MediaTrack,
        _stream_id: &str,
    ) -> Result<(), CallError> {
        self.inner.lock().unwrap().tracks.push(track.kind());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        Ok(SessionDescription::offer(format!("offer-{}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let inner = self.inner.lock().unwrap();
        if inner.signaling != Signaling::HaveRemoteOffer {
            return Err(CallError::Negotiation("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(format!("answer-{}", self.label)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.signaling = match (desc.kind, inner.signaling) {
            (SdpKind::Offer, Signaling::Stable) => Signaling::HaveLocalOffer,
            (SdpKind::Answer, Signaling::HaveRemoteOffer) => Signaling::Stable,
            (kind, state) => {
                return Err(CallError::Negotiation(format!(
                    "cannot apply local {kind:?} in {state:?}"
                )))
            }
        };
        inner.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_remote {
            return Err(CallError::Negotiation("malformed remote sdp".to_string()));
        }
        inner.signaling = match (desc.kind, inner.signaling) {
            (SdpKind::Offer, Signaling::Stable) => Signaling::HaveRemoteOffer,
            (SdpKind::Answer, Signaling::HaveLocalOffer) => Signaling::Stable,
            (kind, state) => {
                return Err(CallError::Negotiation(format!(
                    "cannot apply remote {kind:?} in {state:?}"
                )))
            }
        };
        inner.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.remote.is_none() {
            return Err(CallError::Negotiation(
                "candidate before remote description".to_string(),
            ));
        }
        if inner.rejected.contains(&candidate.candidate) {
            return Err(CallError::Negotiation("unparseable candidate".to_string()));
        }
        inner.applied.push(candidate);
        Ok(())
    }

    fn is_stable(&self) -> bool {
        self.inner.lock().unwrap().signaling == Signaling::Stable
    }

    async fn close(&self) {
        self.inner.lock().unwrap().closes += 1;
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<(Arc<FakePeer>, TransportSink)>>,
    fail_next: AtomicBool,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.created.lock().unwrap().last().map(|(pc, _)| pc.clone())
    }

    /// Raise a transport event on the most recent connection.
    pub fn emit(&self, event: TransportEvent) {
        let sink = self.created.lock().unwrap().last().map(|(_, s)| s.clone());
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    /// Raise a transport event on the `index`-th connection ever created.
    pub fn emit_on(&self, index: usize, event: TransportEvent) {
        let sink = self.created.lock().unwrap().get(index).map(|(_, s)| s.clone());
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, sink: TransportSink) -> Result<Arc<dyn PeerConnection>, CallError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CallError::Negotiation("peer connection refused".to_string()));
        }
        let pc = FakePeer::new();
        self.created.lock().unwrap().push((pc.clone(), sink));
        Ok(pc as Arc<dyn PeerConnection>)
    }
}
