//! Recording fakes for every collaborator of the session controller.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use liveradio_daemon::audio_session::{AudioMode, AudioSession, AudioSessionError};
use liveradio_daemon::core::{Collaborators, SessionController, SessionEvent};
use liveradio_daemon::engine::{StreamEngine, StreamReport};
use liveradio_daemon::fingerprint::{AudioTap, FingerprintOutcome, FingerprintReport, Fingerprinter};
use liveradio_daemon::now_playing::NowPlayingPublisher;
use liveradio_proto::catalog::Catalog;
use liveradio_proto::config::{IdentifyConfig, PlaybackSettings};
use liveradio_proto::protocol::{Category, NowPlaying, SessionSnapshot, Station, Track};
use reqwest::Url;
use tokio::sync::mpsc;

/// Shared call log.
#[derive(Clone)]
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    fn push(&self, item: T) {
        self.0.lock().unwrap().push(item);
    }

    pub fn all(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<T> {
        self.0.lock().unwrap().last().cloned()
    }

    /// Drain the log, returning what was recorded so far.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Attach { generation: u64, url: String },
    Play,
    Pause,
    Shutdown,
}

pub struct FakeEngine(Recorder<EngineCall>);

impl StreamEngine for FakeEngine {
    fn attach(&mut self, generation: u64, url: &Url) {
        self.0.push(EngineCall::Attach {
            generation,
            url: url.to_string(),
        });
    }

    fn play(&mut self) {
        self.0.push(EngineCall::Play);
    }

    fn pause(&mut self) {
        self.0.push(EngineCall::Pause);
    }

    fn shutdown(&mut self) {
        self.0.push(EngineCall::Shutdown);
    }
}

pub struct FakePublisher(Recorder<NowPlaying>);

impl NowPlayingPublisher for FakePublisher {
    fn publish(&mut self, info: NowPlaying) {
        self.0.push(info);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintCall {
    Start { attempt: u64, tap: AudioTap },
    Stop,
}

pub struct FakeFingerprinter(Recorder<FingerprintCall>);

impl Fingerprinter for FakeFingerprinter {
    fn start(&mut self, attempt: u64, tap: AudioTap) {
        self.0.push(FingerprintCall::Start { attempt, tap });
    }

    fn stop(&mut self) {
        self.0.push(FingerprintCall::Stop);
    }
}

/// Capture route whose mode and failure switch the test can see and flip.
#[derive(Clone)]
pub struct AudioRoute {
    mode: Arc<Mutex<AudioMode>>,
    refuse: Arc<Mutex<bool>>,
}

impl AudioRoute {
    fn new() -> Self {
        Self {
            mode: Arc::new(Mutex::new(AudioMode::Playback)),
            refuse: Arc::new(Mutex::new(false)),
        }
    }

    pub fn mode(&self) -> AudioMode {
        *self.mode.lock().unwrap()
    }

    pub fn refuse_capture(&self, refuse: bool) {
        *self.refuse.lock().unwrap() = refuse;
    }
}

pub struct FakeAudioSession(AudioRoute);

impl AudioSession for FakeAudioSession {
    fn enter_capture(&mut self) -> Result<(), AudioSessionError> {
        if *self.0.refuse.lock().unwrap() {
            return Err(AudioSessionError::NoDevice);
        }
        let mut mode = self.0.mode.lock().unwrap();
        if *mode == AudioMode::Capture {
            return Err(AudioSessionError::AlreadyCapturing);
        }
        *mode = AudioMode::Capture;
        Ok(())
    }

    fn restore_playback(&mut self) {
        *self.0.mode.lock().unwrap() = AudioMode::Playback;
    }

    fn mode(&self) -> AudioMode {
        self.0.mode()
    }
}

pub struct Harness {
    pub controller: SessionController,
    pub events: mpsc::Receiver<SessionEvent>,
    /// Sender half of the controller's own queue.
    pub event_tx: mpsc::Sender<SessionEvent>,
    pub engine: Recorder<EngineCall>,
    pub published: Recorder<NowPlaying>,
    pub fingerprinter: Recorder<FingerprintCall>,
    pub audio: AudioRoute,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_identify(IdentifyConfig::default())
    }

    pub fn with_identify(identify: IdentifyConfig) -> Self {
        let engine = Recorder::new();
        let published = Recorder::new();
        let fingerprinter = Recorder::new();
        let audio = AudioRoute::new();
        let (event_tx, events) = mpsc::channel(64);
        let collaborators = Collaborators {
            engine: Box::new(FakeEngine(engine.clone())),
            now_playing: Box::new(FakePublisher(published.clone())),
            fingerprinter: Box::new(FakeFingerprinter(fingerprinter.clone())),
            audio_session: Box::new(FakeAudioSession(audio.clone())),
        };
        Self {
            controller: SessionController::new(collaborators, identify, event_tx.clone()),
            events,
            event_tx,
            engine,
            published,
            fingerprinter,
            audio,
        }
    }

    /// A harness configured with [`jazz_catalog`] and the given shuffle policy.
    pub fn configured(shuffle: bool) -> Self {
        let mut h = Self::new();
        h.controller.configure(Box::new(jazz_catalog()), settings(shuffle));
        h
    }

    pub fn state(&self) -> SessionSnapshot {
        self.controller.snapshot()
    }

    pub fn station_id(&self) -> Option<String> {
        self.state().current_station.map(|s| s.id)
    }

    /// The most recent attach, as (generation, url).
    pub fn last_attach(&self) -> Option<(u64, String)> {
        self.engine.all().into_iter().rev().find_map(|c| match c {
            EngineCall::Attach { generation, url } => Some((generation, url)),
            _ => None,
        })
    }

    pub fn attach_count(&self) -> usize {
        self.engine
            .all()
            .iter()
            .filter(|c| matches!(c, EngineCall::Attach { .. }))
            .count()
    }

    pub fn ready(&mut self, generation: u64) {
        self.controller
            .handle_event(SessionEvent::Stream(StreamReport::ready(generation)));
    }

    pub fn failed(&mut self, generation: u64, reason: &str) {
        self.controller
            .handle_event(SessionEvent::Stream(StreamReport::failed(generation, reason)));
    }

    /// Report readiness for whatever was attached last.
    pub fn ready_current(&mut self) {
        let (generation, _) = self.last_attach().expect("nothing attached");
        self.ready(generation);
    }

    pub fn matched(&mut self, attempt: u64, track: Track) {
        self.controller.handle_event(SessionEvent::Fingerprint(FingerprintReport {
            attempt,
            outcome: FingerprintOutcome::Matched(track),
        }));
    }

    pub fn not_matched(&mut self, attempt: u64) {
        self.controller.handle_event(SessionEvent::Fingerprint(FingerprintReport {
            attempt,
            outcome: FingerprintOutcome::NotMatched,
        }));
    }
}

pub fn settings(shuffle: bool) -> PlaybackSettings {
    PlaybackSettings {
        default_category: "JAZZ".into(),
        shuffle_on_category_change: shuffle,
    }
}

pub fn station(id: &str, name: &str) -> Station {
    Station {
        id: id.into(),
        name: name.into(),
        description: format!("{} description", name),
        stream_url: format!("https://streams.example.com/{}", id),
        website_url: Some(format!("https://{}.example.com", id)),
        ..Station::default()
    }
}

pub fn category(id: &str, short_name: &str, stations: Vec<Station>) -> Category {
    Category {
        id: id.into(),
        name: short_name.to_lowercase(),
        short_name: short_name.into(),
        icon: String::new(),
        stations,
    }
}

/// NEWS [n1, n2], JAZZ [s1, s2, s3], QUIET [], CLAS [c1..c5].
pub fn jazz_catalog() -> Catalog {
    Catalog::new(vec![
        category("news", "NEWS", vec![station("n1", "News One"), station("n2", "News Two")]),
        category(
            "jazz",
            "JAZZ",
            vec![station("s1", "S1"), station("s2", "S2"), station("s3", "S3")],
        ),
        category("quiet", "QUIET", vec![]),
        category(
            "clas",
            "CLAS",
            (1..=5)
                .map(|i| station(&format!("c{}", i), &format!("Classical {}", i)))
                .collect(),
        ),
    ])
}

pub fn track(title: &str) -> Track {
    Track {
        title: title.into(),
        artist: Some("Miles Davis".into()),
        link: None,
    }
}
