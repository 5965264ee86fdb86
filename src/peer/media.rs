//! Local capture and remote stream bookkeeping.
//!
//! Capture devices are platform collaborators behind [`MediaDevices`]. The
//! controller only owns references: it stops tracks on release and flips their
//! `enabled` flag for mute/video toggles without renegotiating.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::MediaError;
use crate::utils::random_id;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// A local capture track owned by the platform.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn enabled(&self) -> bool;
    /// Release the capture device behind this track.
    fn stop(&self);
}

/// Local stream handle: the tracks returned by one capture request.
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: random_id(),
            tracks,
        }
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    /// Stop every track in the stream.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open capture devices. May suspend on a user permission prompt.
    async fn get_user_media(&self, constraints: MediaConstraints)
        -> Result<MediaStream, MediaError>;
}

/// A track delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    /// Stream the transport grouped this track into, if any.
    pub stream_id: Option<String>,
}

/// Remote stream handle handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
    /// Built by us from ungrouped tracks.
    pub synthetic: bool,
}

impl RemoteStream {
    pub fn track(&self, kind: TrackKind) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

/// Local/remote media for the active call.
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    local: Option<MediaStream>,
    remote: Option<RemoteStream>,
    muted: bool,
    video_enabled: bool,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            local: None,
            remote: None,
            muted: false,
            video_enabled: false,
        }
    }

    /// Capture request for audio, plus video when `video` is set.
    ///
    /// The returned future borrows nothing from the controller, so the owner
    /// can drive it elsewhere while a permission prompt is open. Hand the
    /// stream back with [`MediaController::adopt`].
    pub fn request(
        &self,
        video: bool,
    ) -> impl Future<Output = Result<MediaStream, MediaError>> + Send + 'static {
        let devices = self.devices.clone();
        async move {
            let constraints = MediaConstraints { audio: true, video };
            match devices.get_user_media(constraints).await {
                Ok(stream) => Ok(stream),
                Err(MediaError::PermissionDenied) => {
                    warn!("Capture permission denied");
                    Err(MediaError::PermissionDenied)
                }
                Err(err) => {
                    warn!(error = %err, "Capture device unavailable");
                    Err(err)
                }
            }
        }
    }

    /// Take ownership of a captured stream, stopping any stream held before.
    pub fn adopt(&mut self, stream: MediaStream) -> MediaStream {
        self.stop_local();
        info!(
            stream_id = %stream.id,
            audio = stream.has(TrackKind::Audio),
            video = stream.has(TrackKind::Video),
            "Local media acquired"
        );
        self.muted = false;
        self.video_enabled = stream.has(TrackKind::Video);
        self.local = Some(stream.clone());
        stream
    }

    fn stop_local(&mut self) {
        if let Some(stream) = self.local.take() {
            stream.stop();
            debug!(stream_id = %stream.id, tracks = stream.tracks.len(), "Local media released");
        }
    }

    /// Stop every local track and forget both streams. Safe to repeat.
    pub fn release(&mut self) {
        self.stop_local();
        self.remote = None;
        self.muted = false;
        self.video_enabled = false;
    }

    /// Flip audio `enabled`. Returns the new muted flag.
    pub fn toggle_mute(&mut self) -> bool {
        let Some(stream) = &self.local else {
            return self.muted;
        };
        self.muted = !self.muted;
        for track in stream.tracks_of(TrackKind::Audio) {
            track.set_enabled(!self.muted);
        }
        self.muted
    }

    /// Flip video `enabled`. Returns the new video-enabled flag.
    pub fn toggle_video(&mut self) -> bool {
        let Some(stream) = &self.local else {
            return self.video_enabled;
        };
        if !stream.has(TrackKind::Video) {
            return self.video_enabled;
        }
        self.video_enabled = !self.video_enabled;
        for track in stream.tracks_of(TrackKind::Video) {
            track.set_enabled(self.video_enabled);
        }
        self.video_enabled
    }

    /// Attach a track delivered by the transport.
    ///
    /// Grouped tracks go into the stream the transport named. Ungrouped tracks
    /// are merged into a synthetic stream, replacing only a track of the same
    /// kind. Switching between a grouped and a synthetic stream keeps the
    /// tracks of other kinds already received. Returns whether the remote
    /// stream changed.
    pub fn attach_remote(&mut self, track: RemoteTrack) -> bool {
        let reuse = match (&self.remote, &track.stream_id) {
            (Some(existing), Some(id)) => existing.id == *id,
            (Some(existing), None) => existing.synthetic,
            (None, _) => false,
        };
        if !reuse {
            let synthetic = track.stream_id.is_none();
            let carried: Vec<RemoteTrack> = match self.remote.take() {
                Some(previous) if previous.synthetic || synthetic => previous
                    .tracks
                    .into_iter()
                    .filter(|t| t.kind != track.kind)
                    .collect(),
                _ => Vec::new(),
            };
            self.remote = Some(RemoteStream {
                id: track.stream_id.clone().unwrap_or_else(random_id),
                tracks: carried,
                synthetic,
            });
        }
        let Some(stream) = self.remote.as_mut() else {
            return false;
        };

        if stream.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        if stream.synthetic {
            stream.tracks.retain(|t| t.kind != track.kind);
        }
        debug!(stream_id = %stream.id, track_id = %track.id, kind = %track.kind, "Remote track attached");
        stream.tracks.push(track);
        true
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled
    }
}
