//! Call lifecycle state machine.
//!
//! One task owns the call. Facade commands, inbound bus payloads and
//! transport callbacks all arrive as [`Command`]s on a single mailbox and run
//! to completion one at a time, so handlers never observe half-applied state.
//! Because the bus gives no ordering or delivery guarantees, every handler
//! checks the current state first and treats anything out of place as stale.
//!
//! The mailbox never waits on the outside world. Device prompts and the
//! inbound subscription run as detached tasks that report back as commands
//! tagged with the call generation, and outbound signals go to per-peer send
//! queues. `end_call` and a peer's hangup are therefore handled promptly even
//! while a permission prompt is open or the bus is slow to confirm.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::CallConfig;
use crate::errors::{CallError, MediaError};
use crate::events::{AbortReason, CallEvent, EventEmitter};
use crate::logger::CandidateTally;
use crate::peer::connection::{
    LinkState, PeerConnection, PeerConnectionFactory, TransportEvent, TransportSink,
};
use crate::peer::ice::CandidateQueue;
use crate::peer::media::{MediaController, MediaDevices, MediaStream};
use crate::peer::types::{PeerInfo, SdpKind, SessionDescription, Signal, SignalKind, SignalMessage};
use crate::session::{CallSession, CallSnapshot, CallState};
use crate::signaling::{decode_inbound, ChannelManager, IdentityProvider, InboundHandler, SignalBus};

type Reply = oneshot::Sender<Result<(), CallError>>;

/// Messages handled by the state machine task.
#[derive(Debug)]
pub enum Command {
    /// Open the local user's inbound channel.
    Start {
        respond_to: Reply,
    },
    StartCall {
        peer: PeerInfo,
        is_video: bool,
        respond_to: Reply,
    },
    AnswerCall {
        respond_to: Reply,
    },
    EndCall {
        respond_to: oneshot::Sender<()>,
    },
    ToggleMute {
        respond_to: oneshot::Sender<bool>,
    },
    ToggleVideo {
        respond_to: oneshot::Sender<bool>,
    },
    /// Raw payload from the inbound bus channel.
    Inbound(Value),
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    /// The inbound subscription settled.
    Listening {
        result: Result<String, CallError>,
    },
    /// A capture request settled.
    MediaReady {
        generation: u64,
        result: Result<MediaStream, MediaError>,
    },
    /// Resolves once every earlier command has been handled and every signal
    /// queued so far has been handed to the bus.
    Ping {
        respond_to: oneshot::Sender<()>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// External collaborators the machine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub bus: Arc<dyn SignalBus>,
    pub identity: Arc<dyn IdentityProvider>,
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

pub struct Spawned {
    pub mailbox: mpsc::UnboundedSender<Command>,
    pub snapshot: watch::Receiver<CallSnapshot>,
    pub events: EventEmitter,
    pub task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Offer,
    Answer,
}

/// A facade command parked until local media arrives.
struct Pending {
    awaiting: Awaiting,
    respond_to: Reply,
}

pub struct SessionMachine {
    channels: ChannelManager,
    media: MediaController,
    peers: Arc<dyn PeerConnectionFactory>,
    candidates: CandidateQueue,
    session: Option<CallSession>,
    pc: Option<Arc<dyn PeerConnection>>,
    next_generation: u64,
    tally: CandidateTally,
    pending: Option<Pending>,
    media_task: Option<JoinHandle<()>>,
    listen_waiters: Vec<Reply>,
    mailbox: mpsc::WeakUnboundedSender<Command>,
    snapshot: watch::Sender<CallSnapshot>,
    events: EventEmitter,
}

impl SessionMachine {
    /// Spawn the machine task. Must be called within a tokio runtime.
    pub fn spawn(config: &CallConfig, deps: Collaborators) -> Spawned {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let events = EventEmitter::new(config.event_buffer);

        let machine = SessionMachine {
            channels: ChannelManager::new(deps.bus, deps.identity, config.subscribe_timeout),
            media: MediaController::new(deps.devices),
            peers: deps.peers,
            candidates: CandidateQueue::new(),
            session: None,
            pc: None,
            next_generation: 0,
            tally: CandidateTally::default(),
            pending: None,
            media_task: None,
            listen_waiters: Vec::new(),
            mailbox: tx.downgrade(),
            snapshot: snapshot_tx,
            events: events.clone(),
        };
        let task = tokio::spawn(machine.run(rx));

        Spawned {
            mailbox: tx,
            snapshot: snapshot_rx,
            events,
            task,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("Call machine started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Shutdown { respond_to } => {
                    self.shutdown().await;
                    self.reply(respond_to, ());
                    return;
                }
                cmd => {
                    self.dispatch(cmd).await;
                    self.publish_snapshot();
                }
            }
        }
        // Every handle dropped without an explicit stop.
        self.shutdown().await;
    }

    async fn dispatch(&mut self, cmd: Command) {
        match cmd {
            Command::Start { respond_to } => self.start_listening(respond_to),
            Command::StartCall {
                peer,
                is_video,
                respond_to,
            } => self.start_call(peer, is_video, respond_to),
            Command::AnswerCall { respond_to } => self.answer_call(respond_to),
            Command::EndCall { respond_to } => {
                self.teardown(true).await;
                self.reply(respond_to, ());
            }
            Command::ToggleMute { respond_to } => {
                let muted = self.media.toggle_mute();
                self.reply(respond_to, muted);
            }
            Command::ToggleVideo { respond_to } => {
                let enabled = self.media.toggle_video();
                self.reply(respond_to, enabled);
            }
            Command::Inbound(payload) => self.handle_inbound(payload).await,
            Command::Transport { generation, event } => {
                self.handle_transport(generation, event).await
            }
            Command::Listening { result } => self.on_listening(result),
            Command::MediaReady { generation, result } => self.on_media(generation, result).await,
            Command::Ping { respond_to } => {
                self.publish_snapshot();
                let flushed = self.channels.flushed();
                tokio::spawn(async move {
                    flushed.await;
                    let _ = respond_to.send(());
                });
            }
            Command::Shutdown { respond_to } => self.reply(respond_to, ()),
        }
    }

    /// Publish the snapshot before answering so callers read fresh state.
    fn reply<T>(&self, respond_to: oneshot::Sender<T>, value: T) {
        self.publish_snapshot();
        let _ = respond_to.send(value);
    }

    fn state(&self) -> CallState {
        self.session.as_ref().map_or(CallState::Idle, |s| s.state)
    }

    /// Install a fresh session and announce it.
    fn enter(&mut self, session: CallSession) {
        let to = session.state;
        info!(
            call_id = %session.call_id,
            peer_id = %session.peer.id,
            is_video = session.is_video,
            state = %to,
            "Call started"
        );
        self.session = Some(session);
        self.events.emit_state(CallState::Idle, to);
        self.publish_snapshot();
    }

    fn set_state(&mut self, to: CallState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let from = session.state;
        session.state = to;
        if from != to {
            info!(call_id = %session.call_id, %from, %to, "Call state changed");
        }
        self.events.emit_state(from, to);
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let queued_candidates = self.candidates.len();
        let snap = match &self.session {
            Some(s) => CallSnapshot {
                state: s.state,
                call_id: Some(s.call_id.clone()),
                is_video: s.is_video,
                peer: Some(s.peer.clone()),
                started_at: Some(s.started_at),
                local_stream: self.media.local_stream().cloned(),
                remote_stream: self.media.remote_stream().cloned(),
                muted: self.media.is_muted(),
                video_enabled: self.media.is_video_enabled(),
                queued_candidates,
            },
            None => CallSnapshot {
                queued_candidates,
                ..CallSnapshot::default()
            },
        };
        self.snapshot.send_replace(snap);
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    // -----------------------------------------------------------------------
    // Facade commands

    fn start_listening(&mut self, respond_to: Reply) {
        if self.channels.is_listening() {
            self.reply(respond_to, Ok(()));
            return;
        }
        self.listen_waiters.push(respond_to);
        if self.listen_waiters.len() > 1 {
            return;
        }

        let inbound_tx = self.mailbox.clone();
        let handler: InboundHandler = Arc::new(move |payload| {
            if let Some(tx) = inbound_tx.upgrade() {
                let _ = tx.send(Command::Inbound(payload));
            }
        });
        let subscription = match self.channels.subscription(handler) {
            Ok(subscription) => subscription,
            Err(e) => {
                self.on_listening(Err(e));
                return;
            }
        };

        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = subscription.confirm().await;
            let confirmed = result.is_ok();
            let delivered = mailbox
                .upgrade()
                .is_some_and(|tx| tx.send(Command::Listening { result }).is_ok());
            if confirmed && !delivered {
                subscription.cancel().await;
            }
        });
    }

    fn on_listening(&mut self, result: Result<String, CallError>) {
        let outcome = match result {
            Ok(channel) => {
                self.channels.listening(channel);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Inbound subscription failed");
                Err(e)
            }
        };
        self.publish_snapshot();
        for waiter in self.listen_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    #[instrument(skip_all, fields(peer_id = %peer.id, is_video = is_video))]
    fn start_call(&mut self, peer: PeerInfo, is_video: bool, respond_to: Reply) {
        if let Some(session) = &self.session {
            let err = CallError::Busy(session.state.to_string());
            self.reply(respond_to, Err(err));
            return;
        }
        let Some(me) = self.channels.local_user() else {
            self.reply(respond_to, Err(CallError::NotAuthenticated));
            return;
        };
        if me.id == peer.id {
            let err = CallError::InvalidState {
                action: "call yourself",
                state: CallState::Idle.to_string(),
            };
            self.reply(respond_to, Err(err));
            return;
        }

        let generation = self.next_generation();
        self.enter(CallSession::outgoing(peer, is_video, generation));
        self.pending = Some(Pending {
            awaiting: Awaiting::Offer,
            respond_to,
        });
        self.request_media(generation, is_video);
    }

    fn answer_call(&mut self, respond_to: Reply) {
        let state = self.state();
        let Some(session) = self
            .session
            .as_ref()
            .filter(|s| s.state == CallState::Incoming)
        else {
            let err = CallError::InvalidState {
                action: "answer",
                state: state.to_string(),
            };
            self.reply(respond_to, Err(err));
            return;
        };
        if self.pending.is_some() {
            let err = CallError::InvalidState {
                action: "answer twice",
                state: state.to_string(),
            };
            self.reply(respond_to, Err(err));
            return;
        }

        let (generation, is_video) = (session.generation, session.is_video);
        self.pending = Some(Pending {
            awaiting: Awaiting::Answer,
            respond_to,
        });
        self.request_media(generation, is_video);
    }

    /// Ask for local media off the mailbox; the result comes back as
    /// [`Command::MediaReady`].
    fn request_media(&mut self, generation: u64, video: bool) {
        if let Some(task) = self.media_task.take() {
            task.abort();
        }
        let request = self.media.request(video);
        let mailbox = self.mailbox.clone();
        self.media_task = Some(tokio::spawn(async move {
            let result = request.await;
            let Some(tx) = mailbox.upgrade() else {
                if let Ok(stream) = result {
                    stream.stop();
                }
                return;
            };
            if let Err(SendError(Command::MediaReady {
                result: Ok(stream), ..
            })) = tx.send(Command::MediaReady { generation, result })
            {
                stream.stop();
            }
        }));
    }

    async fn on_media(&mut self, generation: u64, result: Result<MediaStream, MediaError>) {
        let current = self
            .session
            .as_ref()
            .is_some_and(|s| s.generation == generation);
        let awaiting = self.pending.as_ref().map(|p| p.awaiting);
        let Some(awaiting) = awaiting.filter(|_| current) else {
            debug!(generation, "Capture finished for a call that is gone");
            if let Ok(stream) = result {
                stream.stop();
            }
            return;
        };
        self.media_task = None;

        let stream = match result {
            Ok(stream) => self.media.adopt(stream),
            Err(e) => {
                self.fail(e.into()).await;
                return;
            }
        };
        let outcome = match awaiting {
            Awaiting::Offer => self.place_offer(generation, stream).await,
            Awaiting::Answer => self.place_answer(stream).await,
        };
        match outcome {
            Ok(()) => {
                if let Some(pending) = self.pending.take() {
                    self.reply(pending.respond_to, Ok(()));
                }
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn place_offer(&mut self, generation: u64, stream: MediaStream) -> Result<(), CallError> {
        let pc = self.open_peer(generation).await?;
        for track in &stream.tracks {
            pc.add_local_track(track.as_ref(), &stream.id).await?;
        }
        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.peer_contacted = true;
        let peer_id = session.peer.id.clone();
        let is_video = session.is_video;
        self.signal(
            &peer_id,
            Signal::Offer {
                sdp: offer,
                is_video,
            },
        );
        Ok(())
    }

    async fn place_answer(&mut self, stream: MediaStream) -> Result<(), CallError> {
        let pc = self.pc.clone().ok_or_else(|| {
            CallError::Negotiation("no peer connection for incoming call".to_string())
        })?;
        let peer_id = self
            .session
            .as_ref()
            .map(|s| s.peer.id.clone())
            .unwrap_or_default();

        for track in &stream.tracks {
            pc.add_local_track(track.as_ref(), &stream.id).await?;
        }
        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        self.signal(&peer_id, Signal::Answer { sdp: answer });
        self.set_state(CallState::Connected);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound signals

    async fn handle_inbound(&mut self, payload: Value) {
        let Some(msg) = decode_inbound(payload) else {
            return;
        };
        let Some(me) = self.channels.local_user() else {
            warn!("Signal received without an authenticated user");
            return;
        };
        if msg.sender_id == me.id {
            debug!(kind = ?msg.kind, "Ignoring own signal");
            return;
        }

        match msg.kind {
            SignalKind::Offer => self.on_offer(msg).await,
            SignalKind::Answer => self.on_answer(msg).await,
            SignalKind::IceCandidate => self.on_candidate(msg).await,
            SignalKind::Hangup => self.on_hangup(msg).await,
        }
    }

    fn is_current_peer(&self, sender_id: &str) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.peer.id == sender_id)
    }

    async fn on_offer(&mut self, msg: SignalMessage) {
        if let Some(session) = &self.session {
            // No busy reply; the caller just never hears back.
            info!(
                from = %msg.sender_id,
                state = %session.state,
                "Offer dropped: already in a call"
            );
            return;
        }
        let Some(sdp) = msg.sdp.clone().filter(|d| d.kind == SdpKind::Offer) else {
            warn!(from = %msg.sender_id, "Offer without an offer description");
            return;
        };

        let is_video = msg.is_video.unwrap_or(false);
        let generation = self.next_generation();
        self.enter(CallSession::incoming(msg.sender(), is_video, generation));

        if let Err(e) = self.accept_offer(generation, sdp, &msg.sender_id).await {
            self.abort(&e).await;
        }
    }

    async fn accept_offer(
        &mut self,
        generation: u64,
        sdp: SessionDescription,
        from: &str,
    ) -> Result<(), CallError> {
        let pc = self.open_peer(generation).await?;
        pc.set_remote_description(sdp).await?;
        self.drain_candidates(pc.as_ref(), from).await;
        Ok(())
    }

    async fn on_answer(&mut self, msg: SignalMessage) {
        if self.state() != CallState::Outgoing || !self.is_current_peer(&msg.sender_id) {
            debug!(from = %msg.sender_id, state = %self.state(), "Stale answer ignored");
            return;
        }
        let Some(pc) = self.pc.clone() else {
            debug!("Answer before peer connection exists");
            return;
        };
        if pc.is_stable() {
            debug!("Duplicate answer on a stable connection");
            self.set_state(CallState::Connected);
            return;
        }
        let Some(sdp) = msg.sdp.filter(|d| d.kind == SdpKind::Answer) else {
            warn!(from = %msg.sender_id, "Answer without an answer description");
            return;
        };

        match pc.set_remote_description(sdp).await {
            Ok(()) => {
                self.drain_candidates(pc.as_ref(), &msg.sender_id).await;
                self.set_state(CallState::Connected);
            }
            Err(e) => self.abort(&e).await,
        }
    }

    async fn drain_candidates(&mut self, pc: &dyn PeerConnection, from: &str) {
        let report = self.candidates.drain(pc, from).await;
        if report.applied + report.failed + report.discarded > 0 {
            info!(
                from,
                applied = report.applied,
                failed = report.failed,
                discarded = report.discarded,
                "Queued candidates drained"
            );
        }
    }

    async fn on_candidate(&mut self, msg: SignalMessage) {
        let Some(candidate) = msg.candidate else {
            warn!(from = %msg.sender_id, "Candidate signal without a candidate");
            return;
        };
        match &self.session {
            // May have overtaken its offer.
            None => self.candidates.enqueue(&msg.sender_id, candidate),
            Some(s) if s.peer.id != msg.sender_id => {
                debug!(from = %msg.sender_id, "Candidate from a different peer ignored");
            }
            Some(_) => {
                let pc = self.pc.clone();
                let delivery = self
                    .candidates
                    .deliver(pc.as_deref(), &msg.sender_id, candidate)
                    .await;
                debug!(from = %msg.sender_id, ?delivery, "Remote candidate handled");
            }
        }
    }

    async fn on_hangup(&mut self, msg: SignalMessage) {
        if self.is_current_peer(&msg.sender_id) {
            info!(from = %msg.sender_id, "Peer hung up");
            self.teardown(false).await;
            return;
        }
        debug!(from = %msg.sender_id, state = %self.state(), "Stale hangup ignored");
        if self.session.is_none() {
            let dropped = self.candidates.discard_from(&msg.sender_id);
            if dropped > 0 {
                debug!(from = %msg.sender_id, dropped, "Early candidates discarded");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transport events

    async fn handle_transport(&mut self, generation: u64, event: TransportEvent) {
        let Some(session) = &self.session else {
            return;
        };
        if session.generation != generation {
            debug!(generation, current = session.generation, "Event from a closed connection");
            return;
        }
        let peer_id = session.peer.id.clone();
        let state = session.state;

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.tally.record(&candidate);
                self.signal(&peer_id, Signal::IceCandidate { candidate });
            }
            TransportEvent::GatheringComplete => self.tally.log_summary(),
            TransportEvent::ConnectionState(LinkState::Connected) => {
                if state == CallState::Ending {
                    return;
                }
                if state == CallState::Reconnecting {
                    self.events.emit(CallEvent::ConnectionRecovered);
                }
                self.set_state(CallState::Connected);
            }
            TransportEvent::ConnectionState(LinkState::Failed) => {
                if state == CallState::Connected {
                    warn!(peer_id = %peer_id, "Transport failed; waiting for recovery or hangup");
                    self.set_state(CallState::Reconnecting);
                    self.events.emit(CallEvent::ConnectionProblem);
                } else {
                    warn!(%state, "Transport failed before the call connected");
                }
            }
            TransportEvent::ConnectionState(link) => {
                debug!(?link, "Transport state");
            }
            TransportEvent::RemoteTrack(track) => {
                if self.media.attach_remote(track) {
                    self.events.emit(CallEvent::RemoteStreamChanged);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers

    async fn open_peer(&mut self, generation: u64) -> Result<Arc<dyn PeerConnection>, CallError> {
        let mailbox = self.mailbox.clone();
        let sink = TransportSink::new(
            generation,
            Arc::new(move |generation, event| {
                if let Some(tx) = mailbox.upgrade() {
                    let _ = tx.send(Command::Transport { generation, event });
                }
            }),
        );
        let pc = self.peers.create(sink).await?;
        self.pc = Some(pc.clone());
        self.tally = CandidateTally::default();
        Ok(pc)
    }

    /// Queue a signal for the peer. Delivery is best-effort and never awaited.
    fn signal(&mut self, peer_id: &str, signal: Signal) {
        let kind = signal.kind();
        if let Err(e) = self.channels.send_to(peer_id, signal) {
            warn!(peer_id, ?kind, error = %e, "Signal not queued");
        }
    }

    /// Abort the call and fail the parked facade command with `err`.
    async fn fail(&mut self, err: CallError) {
        let pending = self.pending.take();
        self.abort(&err).await;
        if let Some(pending) = pending {
            self.reply(pending.respond_to, Err(err));
        }
    }

    async fn abort(&mut self, err: &CallError) {
        warn!(error = %err, state = %self.state(), "Call aborted");
        if let Some(reason) = AbortReason::from_error(err) {
            self.events.emit(CallEvent::Aborted(reason));
        }
        self.teardown(true).await;
    }

    /// Return to idle. Safe from any state and on repeat.
    ///
    /// `notify` sends a hangup to the peer if the peer already knows about
    /// this call. A facade command still waiting on media fails with
    /// [`CallError::Cancelled`].
    async fn teardown(&mut self, notify: bool) {
        if let Some(task) = self.media_task.take() {
            task.abort();
        }
        let pending = self.pending.take();

        if let Some(session) = self.session.as_mut() {
            let from = session.state;
            session.state = CallState::Ending;
            let peer_id = session.peer.id.clone();
            let contacted = session.peer_contacted;
            let call_id = session.call_id.clone();
            self.events.emit_state(from, CallState::Ending);
            self.publish_snapshot();

            if notify && contacted {
                self.signal(&peer_id, Signal::Hangup);
            }
            if let Some(pc) = self.pc.take() {
                pc.close().await;
            }
            self.session = None;
            self.events.emit_state(CallState::Ending, CallState::Idle);
            info!(call_id = %call_id, "Call ended");
        }
        self.media.release();
        self.candidates.reset();
        self.publish_snapshot();

        if let Some(pending) = pending {
            self.reply(pending.respond_to, Err(CallError::Cancelled));
        }
    }

    async fn shutdown(&mut self) {
        self.teardown(true).await;
        self.channels.stop().await;
        self.publish_snapshot();
        debug!("Call machine stopped");
    }
}
