//! Process-wide audio route.  Playback is the resting mode; identification
//! switches to capture for the life of one fingerprint session.

use std::path::PathBuf;

use liveradio_proto::config::{CaptureSource, IdentifyConfig};
use liveradio_proto::platform;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    Playback,
    Capture,
}

#[derive(Debug, Error)]
pub enum AudioSessionError {
    #[error("{0} not found (install it or set {1})")]
    ToolMissing(&'static str, &'static str),
    #[error("no capture device configured")]
    NoDevice,
    #[error("audio session is already in capture mode")]
    AlreadyCapturing,
}

pub trait AudioSession: Send {
    /// Switch to capture mode.  Fails without side effects.
    fn enter_capture(&mut self) -> Result<(), AudioSessionError>;

    /// Return to playback mode.  Idempotent.
    fn restore_playback(&mut self);

    fn mode(&self) -> AudioMode;
}

/// Capture route backed by ffmpeg + vibra on the host.
pub struct CaptureRoute {
    mode: AudioMode,
    source: CaptureSource,
    device: String,
    ffmpeg: Option<PathBuf>,
    vibra: Option<PathBuf>,
}

impl CaptureRoute {
    pub fn new(config: &IdentifyConfig) -> Self {
        Self::with_tools(
            config,
            platform::find_ffmpeg_binary(),
            platform::find_vibra_binary(),
        )
    }

    pub fn with_tools(config: &IdentifyConfig, ffmpeg: Option<PathBuf>, vibra: Option<PathBuf>) -> Self {
        Self {
            mode: AudioMode::Playback,
            source: config.source,
            device: config.capture_device.clone(),
            ffmpeg,
            vibra,
        }
    }
}

impl AudioSession for CaptureRoute {
    fn enter_capture(&mut self) -> Result<(), AudioSessionError> {
        if self.mode == AudioMode::Capture {
            return Err(AudioSessionError::AlreadyCapturing);
        }
        if self.ffmpeg.is_none() {
            return Err(AudioSessionError::ToolMissing("ffmpeg", "FFMPEG_PATH"));
        }
        if self.vibra.is_none() {
            return Err(AudioSessionError::ToolMissing("vibra", "VIBRA_PATH"));
        }
        if self.source == CaptureSource::Microphone && self.device.trim().is_empty() {
            return Err(AudioSessionError::NoDevice);
        }
        info!("audio session: playback → capture ({:?})", self.source);
        self.mode = AudioMode::Capture;
        Ok(())
    }

    fn restore_playback(&mut self) {
        if self.mode == AudioMode::Capture {
            info!("audio session: capture → playback");
        } else {
            debug!("audio session: already in playback mode");
        }
        self.mode = AudioMode::Playback;
    }

    fn mode(&self) -> AudioMode {
        self.mode
    }
}
