//! Desktop media controls.
//!
//! - Linux: MPRIS over D-Bus
//! - Windows: System Media Transport Controls
//! - macOS: Now Playing / remote command center
//!
//! `souvlaki` handles are not `Send` on every platform, so the handle lives
//! on its own thread.  Snapshots reach it over a channel; transport buttons
//! come back as `SessionEvent::Remote`.

use std::sync::mpsc as std_mpsc;

use liveradio_proto::protocol::{NowPlaying, RemoteIntent};
use souvlaki::{MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, PlatformConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::SessionEvent;
use crate::now_playing::NowPlayingPublisher;

const DBUS_NAME: &str = "liveradio";
const DISPLAY_NAME: &str = "Live Radio";

/// Map an OS transport button to the session's remote intent.
pub fn intent_for(event: &MediaControlEvent) -> Option<RemoteIntent> {
    match event {
        MediaControlEvent::Play => Some(RemoteIntent::Play),
        MediaControlEvent::Pause | MediaControlEvent::Stop => Some(RemoteIntent::Pause),
        MediaControlEvent::Toggle => Some(RemoteIntent::TogglePlayPause),
        MediaControlEvent::Next => Some(RemoteIntent::Next),
        MediaControlEvent::Previous => Some(RemoteIntent::Previous),
        // Live streams cannot seek.
        _ => None,
    }
}

pub fn playback_for(info: &NowPlaying) -> MediaPlayback {
    if info.playback_rate > 0.0 {
        MediaPlayback::Playing { progress: None }
    } else if info.title.is_empty() {
        MediaPlayback::Stopped
    } else {
        MediaPlayback::Paused { progress: None }
    }
}

/// Publisher feeding the platform media controls.
pub struct MediaControlsPublisher {
    tx: std_mpsc::Sender<NowPlaying>,
}

impl MediaControlsPublisher {
    /// Spawn the controls thread.  Registration failures (no session bus,
    /// missing window handle) are logged there and the publisher goes inert.
    pub fn start(event_tx: mpsc::Sender<SessionEvent>) -> anyhow::Result<Self> {
        let (tx, rx) = std_mpsc::channel::<NowPlaying>();
        std::thread::Builder::new()
            .name("media-controls".into())
            .spawn(move || run_controls(rx, event_tx))?;
        Ok(Self { tx })
    }
}

impl NowPlayingPublisher for MediaControlsPublisher {
    fn publish(&mut self, info: NowPlaying) {
        if self.tx.send(info).is_err() {
            debug!("media-controls: thread gone, dropping snapshot");
        }
    }
}

fn run_controls(rx: std_mpsc::Receiver<NowPlaying>, event_tx: mpsc::Sender<SessionEvent>) {
    let config = PlatformConfig {
        dbus_name: DBUS_NAME,
        display_name: DISPLAY_NAME,
        hwnd: None,
    };
    let mut controls = match MediaControls::new(config) {
        Ok(c) => c,
        Err(e) => {
            warn!("media-controls: unavailable: {:?}", e);
            return;
        }
    };
    let attached = controls.attach(move |event: MediaControlEvent| {
        let Some(intent) = intent_for(&event) else {
            debug!("media-controls: ignoring {:?}", event);
            return;
        };
        if let Err(e) = event_tx.try_send(SessionEvent::Remote(intent)) {
            warn!("media-controls: dropped {:?}: {}", intent, e);
        }
    });
    if let Err(e) = attached {
        warn!("media-controls: cannot attach handler: {:?}", e);
        return;
    }
    info!("media-controls: registered as {}", DBUS_NAME);

    let mut last: Option<NowPlaying> = None;
    while let Ok(info) = rx.recv() {
        if last.as_ref() == Some(&info) {
            continue;
        }
        let metadata = MediaMetadata {
            title: (!info.title.is_empty()).then_some(info.title.as_str()),
            artist: (!info.subtitle.is_empty()).then_some(info.subtitle.as_str()),
            ..MediaMetadata::default()
        };
        if let Err(e) = controls.set_metadata(metadata) {
            warn!("media-controls: set_metadata failed: {:?}", e);
        }
        if let Err(e) = controls.set_playback(playback_for(&info)) {
            warn!("media-controls: set_playback failed: {:?}", e);
        }
        last = Some(info);
    }
    debug!("media-controls: publisher dropped, exiting");
}
