//! Local media capability boundary.
//!
//! The engine never talks to capture hardware. It consumes a [`LocalMedia`]
//! handle obtained through a [`MediaSource`], keeps it alive across
//! consecutive calls while the user stays in the queue, and is the only
//! place allowed to stop it.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Device/media failures are user-facing: matchmaking must not start until
/// the user resolves them. The device variants (`PermissionDenied`,
/// `DeviceNotFound`, `DeviceBusy`) come from device-backed [`MediaSource`]
/// implementations; [`StaticMediaSource`] itself only reports
/// `InsecureContext`.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("camera/microphone permission was denied")]
    PermissionDenied,
    #[error("no camera or microphone device was found")]
    DeviceNotFound,
    #[error("the capture device is busy (in use by another program)")]
    DeviceBusy,
    #[error("media capture requires a secure context (https or loopback)")]
    InsecureContext,
    #[error("media source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One capture track. Cloneable handle over shared liveness/enable flags so
/// the UI toggles and the lifecycle teardown observe the same state.
#[derive(Debug, Clone)]
pub struct Track {
    kind: TrackKind,
    live: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
}

impl Track {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            live: Arc::new(AtomicBool::new(true)),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flips the enabled flag and returns the new value.
    pub fn toggle_enabled(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
    }
}

/// The local audio+video pair handed to each new peer transport.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    audio: Track,
    video: Track,
}

impl LocalMedia {
    pub fn new() -> Self {
        Self {
            audio: Track::new(TrackKind::Audio),
            video: Track::new(TrackKind::Video),
        }
    }

    pub fn audio(&self) -> &Track {
        &self.audio
    }

    pub fn video(&self) -> &Track {
        &self.video
    }

    pub fn is_live(&self) -> bool {
        self.audio.is_live() || self.video.is_live()
    }

    pub fn stop(&self) {
        self.audio.stop();
        self.video.stop();
    }
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Returns a live local media handle, acquiring devices if needed.
    async fn acquire(&self) -> Result<LocalMedia, MediaError>;
}

/// Media source that owns one capture pair for the whole process. A handle
/// is reused while still live and re-created after it was stopped, which is
/// exactly the reuse rule for consecutive keep-matching calls.
pub struct StaticMediaSource {
    secure_context: bool,
    current: parking_lot::Mutex<Option<LocalMedia>>,
}

impl StaticMediaSource {
    pub fn new(secure_context: bool) -> Self {
        Self {
            secure_context,
            current: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        if !self.secure_context {
            return Err(MediaError::InsecureContext);
        }
        let mut current = self.current.lock();
        if let Some(media) = current.as_ref() {
            if media.is_live() {
                return Ok(media.clone());
            }
            // stale handle from a previous call, rebuild
            media.stop();
        }
        let media = LocalMedia::new();
        *current = Some(media.clone());
        Ok(media)
    }
}
