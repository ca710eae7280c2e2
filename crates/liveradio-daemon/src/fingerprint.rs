//! Track identification.
//!
//! A fingerprint session records short windows of audio with ffmpeg and hands
//! each one to `vibra --recognize`, which queries the matching service and
//! prints JSON.  Every window yields exactly one report for the attempt that
//! started it; the controller owns the timeout and decides when to give up.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use liveradio_proto::platform;
use liveradio_proto::protocol::Track;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::core::SessionEvent;

const SAMPLE_RATE: u32 = 44100;
const CHANNELS: u32 = 2;
const BITS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintOutcome {
    Matched(Track),
    NotMatched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintReport {
    pub attempt: u64,
    pub outcome: FingerprintOutcome,
}

/// Where captured audio comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioTap {
    /// An input device, opened through ffmpeg's `-f <format> -i <device>`.
    Device { format: String, device: String },
    /// The station stream itself.
    Stream { url: String },
}

impl AudioTap {
    fn ffmpeg_input_args(&self) -> Vec<String> {
        match self {
            AudioTap::Device { format, device } => {
                vec!["-f".into(), format.clone(), "-i".into(), device.clone()]
            }
            AudioTap::Stream { url } => vec!["-i".into(), url.clone()],
        }
    }
}

pub trait Fingerprinter: Send {
    /// Begin listening.  Results are reported as [`FingerprintReport`]s
    /// tagged with `attempt`.
    fn start(&mut self, attempt: u64, tap: AudioTap);

    /// Tear down the capture.  Every process is signalled before this returns.
    fn stop(&mut self);
}

/// Processes of one session.  Once closed, late spawns are killed on arrival.
#[derive(Default)]
struct Running {
    capture: Option<Child>,
    recognizer: Option<Child>,
    closed: bool,
}

impl Running {
    fn kill_all(&mut self) {
        self.closed = true;
        for child in [self.capture.as_mut(), self.recognizer.as_mut()]
            .into_iter()
            .flatten()
        {
            let _ = child.start_kill();
        }
        self.capture = None;
        self.recognizer = None;
    }

    fn adopt(slot: &mut Option<Child>, closed: bool, mut child: Child) -> anyhow::Result<()> {
        if closed {
            let _ = child.start_kill();
            anyhow::bail!("session closed");
        }
        *slot = Some(child);
        Ok(())
    }
}

type Shared = Arc<Mutex<Running>>;

fn lock(running: &Shared) -> std::sync::MutexGuard<'_, Running> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct VibraFingerprinter {
    event_tx: mpsc::Sender<SessionEvent>,
    ffmpeg: Option<PathBuf>,
    vibra: Option<PathBuf>,
    window: Duration,
    running: Shared,
    task: Option<AbortHandle>,
}

impl VibraFingerprinter {
    pub fn new(event_tx: mpsc::Sender<SessionEvent>, window: Duration) -> Self {
        Self {
            event_tx,
            ffmpeg: platform::find_ffmpeg_binary(),
            vibra: platform::find_vibra_binary(),
            window,
            running: Shared::default(),
            task: None,
        }
    }
}

impl Fingerprinter for VibraFingerprinter {
    fn start(&mut self, attempt: u64, tap: AudioTap) {
        self.stop();
        let (Some(ffmpeg), Some(vibra)) = (self.ffmpeg.clone(), self.vibra.clone()) else {
            // The capture route refuses to enter capture without both tools,
            // so this only happens if they vanished in between.  The
            // controller's timeout turns the silence into a failure.
            warn!("fingerprint: ffmpeg or vibra missing, attempt {} will time out", attempt);
            return;
        };
        info!("fingerprint: attempt {} listening on {:?}", attempt, tap);
        let window = self.window;
        self.running = Shared::default();
        let running = self.running.clone();
        let tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                let outcome = match recognize_window(&ffmpeg, &vibra, &tap, window, &running).await {
                    Ok(Some(track)) => FingerprintOutcome::Matched(track),
                    Ok(None) => FingerprintOutcome::NotMatched,
                    Err(_) if lock(&running).closed => break,
                    Err(e) => {
                        warn!("fingerprint: window failed: {:#}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let matched = matches!(outcome, FingerprintOutcome::Matched(_));
                let report = FingerprintReport { attempt, outcome };
                if tx.send(SessionEvent::Fingerprint(report)).await.is_err() || matched {
                    break;
                }
            }
        });
        self.task = Some(handle.abort_handle());
    }

    fn stop(&mut self) {
        lock(&self.running).kill_all();
        if let Some(task) = self.task.take() {
            debug!("fingerprint: session stopped");
            task.abort();
        }
    }
}

impl Drop for VibraFingerprinter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Record one window and ask vibra about it.  `Ok(None)` means vibra ran but
/// found nothing.
async fn recognize_window(
    ffmpeg: &Path,
    vibra: &Path,
    tap: &AudioTap,
    window: Duration,
    running: &Shared,
) -> anyhow::Result<Option<Track>> {
    let pcm = capture_pcm(ffmpeg, tap, window, running).await?;
    if pcm.is_empty() {
        anyhow::bail!("ffmpeg produced no audio");
    }

    let mut child = Command::new(vibra)
        .args([
            "--recognize".to_string(),
            "--seconds".to_string(),
            window.as_secs().max(1).to_string(),
            "--rate".to_string(),
            SAMPLE_RATE.to_string(),
            "--channels".to_string(),
            CHANNELS.to_string(),
            "--bits".to_string(),
            BITS.to_string(),
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("vibra stdin unavailable"))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("vibra stdout unavailable"))?;
    {
        let mut guard = lock(running);
        let closed = guard.closed;
        Running::adopt(&mut guard.recognizer, closed, child)?;
    }

    stdin.write_all(&pcm).await?;
    drop(stdin);
    let mut output = String::new();
    stdout.read_to_string(&mut output).await?;
    lock(running).recognizer = None;

    let track = parse_vibra_output(&output);
    debug!("fingerprint: vibra answered {:?}", track);
    Ok(track)
}

async fn capture_pcm(
    ffmpeg: &Path,
    tap: &AudioTap,
    window: Duration,
    running: &Shared,
) -> anyhow::Result<Vec<u8>> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-nostdin".to_string(),
    ];
    args.extend(tap.ffmpeg_input_args());
    args.extend([
        "-t".to_string(),
        window.as_secs().max(1).to_string(),
        "-vn".to_string(),
        "-ac".to_string(),
        CHANNELS.to_string(),
        "-ar".to_string(),
        SAMPLE_RATE.to_string(),
        "-f".to_string(),
        "s16le".to_string(),
        "pipe:1".to_string(),
    ]);

    let mut child = Command::new(ffmpeg)
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("ffmpeg stdout unavailable"))?;
    {
        let mut guard = lock(running);
        let closed = guard.closed;
        Running::adopt(&mut guard.capture, closed, child)?;
    }

    let mut pcm = Vec::new();
    stdout.read_to_end(&mut pcm).await?;
    lock(running).capture = None;
    Ok(pcm)
}

#[derive(Deserialize)]
struct VibraResponse {
    #[serde(default)]
    track: Option<VibraTrack>,
}

#[derive(Deserialize)]
struct VibraTrack {
    #[serde(default)]
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Extract a track from vibra's JSON.  Anything without a titled `track`
/// object counts as no match.
pub fn parse_vibra_output(output: &str) -> Option<Track> {
    let response: VibraResponse = serde_json::from_str(output.trim()).ok()?;
    let track = response.track?;
    let title = track.title.trim();
    if title.is_empty() {
        return None;
    }
    let non_empty = |s: Option<String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    Some(Track {
        title: title.to_string(),
        artist: non_empty(track.subtitle),
        link: non_empty(track.url),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_match() {
        let json = r#"{
            "matches": [{"id": "1"}],
            "track": {
                "title": "So What",
                "subtitle": "Miles Davis",
                "url": "https://www.shazam.com/track/1/so-what"
            }
        }"#;
        assert_eq!(
            parse_vibra_output(json),
            Some(Track {
                title: "So What".into(),
                artist: Some("Miles Davis".into()),
                link: Some("https://www.shazam.com/track/1/so-what".into()),
            })
        );
    }

    #[test]
    fn test_parse_no_match() {
        assert_eq!(parse_vibra_output(r#"{"matches": [], "tagid": "x"}"#), None);
        assert_eq!(parse_vibra_output(r#"{"track": {"title": "  "}}"#), None);
        assert_eq!(parse_vibra_output("segmentation fault"), None);
        assert_eq!(parse_vibra_output(""), None);
    }

    #[test]
    fn test_parse_blank_subtitle_is_dropped() {
        let track = parse_vibra_output(r#"{"track": {"title": "Blue in Green", "subtitle": ""}}"#).unwrap();
        assert_eq!(track.artist, None);
        assert_eq!(track.link, None);
    }

    #[test]
    fn test_tap_input_args() {
        let mic = AudioTap::Device {
            format: "pulse".into(),
            device: "default".into(),
        };
        assert_eq!(mic.ffmpeg_input_args(), ["-f", "pulse", "-i", "default"]);
        let stream = AudioTap::Stream {
            url: "https://example.com/live".into(),
        };
        assert_eq!(stream.ffmpeg_input_args(), ["-i", "https://example.com/live"]);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_harmless() {
        let (tx, _rx) = mpsc::channel(4);
        let mut fp = VibraFingerprinter::new(tx, Duration::from_secs(5));
        fp.stop();
        fp.stop();
        assert!(fp.task.is_none());
    }
}
