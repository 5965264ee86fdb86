use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::CallConfig;
use crate::errors::CallError;
use crate::events::{CallEvent, EventEmitter};
use crate::peer::connection::RtcPeerFactory;
use crate::peer::machine::{Collaborators, Command, SessionMachine};
use crate::peer::media::{MediaDevices, MediaStream, RemoteStream};
use crate::peer::types::PeerInfo;
use crate::session::{CallSnapshot, CallState};
use crate::signaling::{IdentityProvider, SignalBus};

/// Entry point for the presentation layer.
///
/// Commands go through the state machine's mailbox; reads come from the last
/// published [`CallSnapshot`], which is always current once a command returns.
pub struct CallFacade {
    mailbox: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: EventEmitter,
    task: JoinHandle<()>,
}

impl CallFacade {
    pub fn new(config: &CallConfig, deps: Collaborators) -> Self {
        let spawned = SessionMachine::spawn(config, deps);
        Self {
            mailbox: spawned.mailbox,
            snapshot: spawned.snapshot,
            events: spawned.events,
            task: spawned.task,
        }
    }

    /// Facade over real `webrtc` peer connections.
    pub fn with_webrtc(
        config: &CallConfig,
        bus: Arc<dyn SignalBus>,
        identity: Arc<dyn IdentityProvider>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self, CallError> {
        let peers = Arc::new(RtcPeerFactory::new(config)?);
        Ok(Self::new(
            config,
            Collaborators {
                bus,
                identity,
                devices,
                peers,
            },
        ))
    }

    /// Subscribe to the local user's signaling channel. Call after sign-in.
    pub async fn start(&self) -> Result<(), CallError> {
        self.request(|respond_to| Command::Start { respond_to })
            .await?
    }

    /// End any call, close every channel and stop the machine.
    pub async fn stop(self) {
        let (tx, rx) = oneshot::channel();
        if self.mailbox.send(Command::Shutdown { respond_to: tx }).is_ok() {
            let _ = rx.await;
        }
        drop(self.mailbox);
        if let Err(e) = self.task.await {
            debug!(error = %e, "Call machine task ended abnormally");
        }
    }

    pub async fn start_call(
        &self,
        peer_id: &str,
        name: &str,
        avatar: &str,
        is_video: bool,
    ) -> Result<(), CallError> {
        let peer = PeerInfo::new(peer_id, name, avatar);
        self.request(|respond_to| Command::StartCall {
            peer,
            is_video,
            respond_to,
        })
        .await?
    }

    pub async fn answer_call(&self) -> Result<(), CallError> {
        self.request(|respond_to| Command::AnswerCall { respond_to })
            .await?
    }

    /// Hang up. Safe to call in any state, any number of times.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|respond_to| Command::EndCall { respond_to })
            .await
    }

    /// Returns whether audio is now muted.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|respond_to| Command::ToggleMute { respond_to })
            .await
    }

    /// Returns whether video is now enabled.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|respond_to| Command::ToggleVideo { respond_to })
            .await
    }

    /// Wait until everything already queued for the machine has been handled.
    pub async fn settle(&self) -> Result<(), CallError> {
        self.request(|respond_to| Command::Ping { respond_to })
            .await
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn peer(&self) -> Option<PeerInfo> {
        self.snapshot.borrow().peer.clone()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.snapshot.borrow().local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.snapshot.borrow().remote_stream.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.snapshot.borrow().muted
    }

    pub fn is_video_enabled(&self) -> bool {
        self.snapshot.borrow().video_enabled
    }

    /// Snapshot stream for UIs that re-render on change.
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(make(tx))
            .map_err(|_| CallError::ControllerClosed)?;
        rx.await.map_err(|_| CallError::ControllerClosed)
    }
}
