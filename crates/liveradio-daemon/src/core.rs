/// SessionController: single-owner event loop for all session state.
///
/// Every source of change (client commands, remote intents, interruptions,
/// stream engine reports, fingerprint results, timers) sends a
/// `SessionEvent` into one mpsc queue.  The controller drains it on a single
/// task and is the only code that mutates `SessionState`, so transitions are
/// serialised without locks.
///
/// Asynchronous work is tagged so late results can be recognised:
///   - every `play` bumps `generation`; the stream engine echoes the
///     generation back with its report and stale reports are dropped.  `stop`
///     keeps the attached generation: a pending `Ready` is refused because
///     playback has left `Loading`, while a later transport failure of the
///     same stream still lands after `resume`.
///   - every `identify_track` bumps `identify_attempt`; fingerprint results
///     and the identification timeout carry the attempt they belong to.
///
/// After each transition the controller publishes a complete
/// `SessionSnapshot` on a `watch` channel with a fresh `rev`.
use liveradio_proto::catalog::{load_catalog, Catalog, CatalogAccessor};
use liveradio_proto::config::{CaptureSource, CatalogConfig, IdentifyConfig, PlaybackSettings};
use liveradio_proto::protocol::{
    Category, Command, Identification, Interruption, NowPlaying, PlaybackState, RemoteIntent,
    SessionSnapshot, Station,
};
use rand::Rng;
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::audio_session::AudioSession;
use crate::engine::{StreamEngine, StreamOutcome, StreamReport};
use crate::fingerprint::{AudioTap, FingerprintOutcome, FingerprintReport, Fingerprinter};
use crate::now_playing::NowPlayingPublisher;

pub const INVALID_URL: &str = "Invalid stream URL";
pub const PLAYBACK_FAILED: &str = "Playback failed";
pub const IDENTIFY_TIMED_OUT: &str = "Could not identify track";
pub const IDENTIFY_UNAVAILABLE: &str = "configuration error";

// ── SessionEvent ──────────────────────────────────────────────────────────────

/// All inputs into the SessionController loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// A command from a socket client or the HTTP API.
    Command(Command),
    /// Transport intent from the remote command surface.
    Remote(RemoteIntent),
    Interruption(Interruption),
    Stream(StreamReport),
    Fingerprint(FingerprintReport),
    IdentifyTimeout { attempt: u64 },
    /// A freshly loaded catalog (see `Command::ReloadCatalog`).
    CatalogLoaded(Catalog),
    Shutdown,
}

/// The controller's collaborators, handed over once at construction.
pub struct Collaborators {
    pub engine: Box<dyn StreamEngine>,
    pub now_playing: Box<dyn NowPlayingPublisher>,
    pub fingerprinter: Box<dyn Fingerprinter>,
    pub audio_session: Box<dyn AudioSession>,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    powered_on: bool,
    current_category_id: Option<String>,
    current_station: Option<Station>,
    current_station_index: usize,
    playback: PlaybackState,
    identification: Identification,
}

impl SessionState {
    fn snapshot(&self, rev: u64) -> SessionSnapshot {
        SessionSnapshot {
            rev,
            powered_on: self.powered_on,
            current_category_id: self.current_category_id.clone(),
            current_station: self.current_station.clone(),
            current_station_index: self.current_station_index,
            playback: self.playback.clone(),
            identification: self.identification.clone(),
        }
    }
}

// ── SessionController ─────────────────────────────────────────────────────────

pub struct SessionController {
    catalog: Option<Box<dyn CatalogAccessor>>,
    settings: PlaybackSettings,
    identify: IdentifyConfig,
    /// Where `ReloadCatalog` reads from.  `None` disables reloading.
    catalog_source: Option<CatalogConfig>,
    state: SessionState,
    generation: u64,
    identify_attempt: u64,
    identify_timer: Option<AbortHandle>,
    engine: Box<dyn StreamEngine>,
    now_playing: Box<dyn NowPlayingPublisher>,
    fingerprinter: Box<dyn Fingerprinter>,
    audio_session: Box<dyn AudioSession>,
    /// Own queue, for timers and background loads posting back.
    event_tx: mpsc::Sender<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    categories_tx: watch::Sender<Vec<Category>>,
    rev: u64,
}

impl SessionController {
    pub fn new(
        collaborators: Collaborators,
        identify: IdentifyConfig,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let state = SessionState::default();
        let (snapshot_tx, _) = watch::channel(state.snapshot(0));
        let (categories_tx, _) = watch::channel(Vec::new());
        Self {
            catalog: None,
            settings: PlaybackSettings::default(),
            identify,
            catalog_source: None,
            state,
            generation: 0,
            identify_attempt: 0,
            identify_timer: None,
            engine: collaborators.engine,
            now_playing: collaborators.now_playing,
            fingerprinter: collaborators.fingerprinter,
            audio_session: collaborators.audio_session,
            event_tx,
            snapshot_tx,
            categories_tx,
            rev: 0,
        }
    }

    pub fn set_catalog_source(&mut self, source: CatalogConfig) {
        self.catalog_source = Some(source);
    }

    /// Observer handle.  Every receiver sees whole snapshots only.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// The catalog as currently installed, for listing surfaces.
    pub fn subscribe_categories(&self) -> watch::Receiver<Vec<Category>> {
        self.categories_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identify_attempt(&self) -> u64 {
        self.identify_attempt
    }

    pub fn share_text(&self) -> String {
        liveradio_proto::protocol::share_text(self.state.current_station.as_ref())
    }

    pub fn share_link(&self) -> Option<Url> {
        liveradio_proto::protocol::share_link(self.state.current_station.as_ref())
    }

    /// Run the event loop until `Shutdown` arrives or every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<SessionEvent>) -> anyhow::Result<()> {
        info!("SessionController: starting event loop");
        loop {
            match event_rx.recv().await {
                None => {
                    info!("SessionController: event channel closed, shutting down");
                    break;
                }
                Some(SessionEvent::Shutdown) => {
                    info!("SessionController: shutdown requested");
                    break;
                }
                Some(evt) => self.handle_event(evt),
            }
        }
        self.shutdown();
        Ok(())
    }

    pub fn handle_event(&mut self, evt: SessionEvent) {
        match evt {
            SessionEvent::Command(cmd) => self.handle_command(cmd),
            SessionEvent::Remote(intent) => self.handle_remote(intent),
            SessionEvent::Interruption(event) => self.handle_interruption(event),
            SessionEvent::Stream(report) => self.handle_stream_report(report),
            SessionEvent::Fingerprint(report) => self.handle_fingerprint(report),
            SessionEvent::IdentifyTimeout { attempt } => self.handle_identify_timeout(attempt),
            SessionEvent::CatalogLoaded(catalog) => self.reload_catalog(Box::new(catalog)),
            SessionEvent::Shutdown => self.shutdown(),
        }
    }

    fn shutdown(&mut self) {
        self.stop_identifying();
        self.engine.shutdown();
    }

    // ── commands ──────────────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) {
        info!("SessionController: command {:?}", cmd);
        match cmd {
            Command::PowerOn => self.power_on(),
            Command::PowerOff => self.power_off(),
            Command::TogglePower => self.toggle_power(),
            Command::Play { station_id } => match self.lookup_station(&station_id) {
                Some(station) => self.play(station),
                None => warn!("SessionController: unknown station '{}'", station_id),
            },
            Command::Stop => self.stop(),
            Command::Resume => self.resume(),
            Command::Next => self.next_station(),
            Command::Prev => self.previous_station(),
            Command::NextCategory => self.next_category(),
            Command::PrevCategory => self.previous_category(),
            Command::SwitchCategory { category_id } => {
                let category = self
                    .catalog
                    .as_deref()
                    .and_then(|c| c.category(&category_id))
                    .cloned();
                match category {
                    Some(category) => self.switch_to_category(&category),
                    None => warn!("SessionController: unknown category '{}'", category_id),
                }
            }
            Command::Identify => self.identify_track(),
            Command::StopIdentifying => self.stop_identifying(),
            Command::ClearIdentified => self.clear_identified_track(),
            Command::Remote { intent } => self.handle_remote(intent),
            Command::Interruption { event } => self.handle_interruption(event),
            Command::ReloadCatalog => self.spawn_catalog_reload(),
            // Surfaces answer from the watch channel directly.
            Command::GetState => {}
        }
    }

    /// Current category first, then every category in catalog order.
    fn lookup_station(&self, station_id: &str) -> Option<Station> {
        let catalog = self.catalog.as_deref()?;
        let current = self
            .state
            .current_category_id
            .as_deref()
            .map(|id| catalog.stations(id))
            .unwrap_or(&[]);
        current
            .iter()
            .chain(catalog.categories().iter().flat_map(|c| c.stations.iter()))
            .find(|s| s.id == station_id)
            .cloned()
    }

    fn spawn_catalog_reload(&self) {
        let Some(source) = self.catalog_source.clone() else {
            warn!("SessionController: catalog reload requested but no source configured");
            return;
        };
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let catalog = load_catalog(&source).await;
            let _ = tx.send(SessionEvent::CatalogLoaded(catalog)).await;
        });
    }

    // ── configuration ─────────────────────────────────────────────────────────

    /// Install the catalog and settings, select the default category's first
    /// station and power on.  Only the first call with a non-empty catalog
    /// takes effect.
    pub fn configure(&mut self, catalog: Box<dyn CatalogAccessor>, settings: PlaybackSettings) {
        if self.catalog.is_some() {
            warn!("SessionController: already configured, ignoring");
            return;
        }
        let Some(category) = default_category(catalog.as_ref(), &settings) else {
            info!("SessionController: empty catalog, staying unconfigured");
            return;
        };
        let category_id = category.id.clone();
        let first = category.stations.first().cloned();
        info!(
            "SessionController: configured with {} categories, default '{}'",
            catalog.categories().len(),
            category_id
        );
        self.catalog = Some(catalog);
        self.settings = settings;
        self.publish_categories();
        self.state.current_category_id = Some(category_id);
        self.state.current_station = first;
        self.state.current_station_index = 0;
        self.publish_state();
        self.power_on();
    }

    /// Swap in a re-read catalog while keeping the selection where possible.
    pub fn reload_catalog(&mut self, catalog: Box<dyn CatalogAccessor>) {
        if catalog.categories().is_empty() {
            warn!("SessionController: reloaded catalog is empty, keeping the current one");
            return;
        }
        if self.catalog.is_none() {
            let settings = self.settings.clone();
            self.configure(catalog, settings);
            return;
        }
        info!(
            "SessionController: catalog reloaded ({} categories)",
            catalog.categories().len()
        );
        self.catalog = Some(catalog);
        self.publish_categories();

        let kept_category = self
            .state
            .current_category_id
            .clone()
            .filter(|id| self.catalog().category(id).is_some());
        let Some(category_id) = kept_category else {
            let fallback = default_category(self.catalog(), &self.settings)
                .map(|c| (c.id.clone(), c.stations.first().cloned()));
            if let Some((id, first)) = fallback {
                info!("SessionController: category gone, back to default '{}'", id);
                self.state.current_category_id = Some(id);
                self.state.current_station_index = 0;
                match first {
                    Some(station) => self.select(station),
                    None => self.clear_selection(),
                }
            }
            return;
        };

        let found = self.state.current_station.as_ref().and_then(|current| {
            self.catalog()
                .stations(&category_id)
                .iter()
                .enumerate()
                .find(|(_, s)| s.id == current.id)
                .map(|(i, s)| (i, s.clone()))
        });
        match found {
            Some((index, station)) => {
                self.state.current_station_index = index;
                self.state.current_station = Some(station);
                self.publish_state();
                self.publish_now_playing();
            }
            None => self.change_category(&category_id),
        }
    }

    fn catalog(&self) -> &dyn CatalogAccessor {
        match self.catalog.as_deref() {
            Some(c) => c,
            None => &EMPTY_CATALOG,
        }
    }

    fn current_stations(&self) -> &[Station] {
        match self.state.current_category_id.as_deref() {
            Some(id) => self.catalog().stations(id),
            None => &[],
        }
    }

    // ── power ─────────────────────────────────────────────────────────────────

    pub fn power_on(&mut self) {
        if self.state.powered_on {
            return;
        }
        info!("SessionController: power on");
        self.state.powered_on = true;
        self.publish_state();
        if let Some(station) = self.state.current_station.clone() {
            self.play(station);
        }
    }

    pub fn power_off(&mut self) {
        if !self.state.powered_on {
            return;
        }
        info!("SessionController: power off");
        self.state.powered_on = false;
        if self.state.identification == Identification::Listening {
            self.stop_identifying();
        }
        self.stop();
    }

    pub fn toggle_power(&mut self) {
        if self.state.powered_on {
            self.power_off();
        } else {
            self.power_on();
        }
    }

    // ── playback ──────────────────────────────────────────────────────────────

    pub fn play(&mut self, station: Station) {
        if !self.state.powered_on {
            debug!("SessionController: play '{}' ignored, powered off", station.name);
            return;
        }
        if let Some(index) = self.current_stations().iter().position(|s| s.id == station.id) {
            self.state.current_station_index = index;
        }
        self.generation += 1;
        let url = Url::parse(&station.stream_url);
        info!(
            "SessionController: play '{}' (generation {})",
            station.name, self.generation
        );
        self.state.current_station = Some(station);
        match url {
            Ok(url) => {
                self.set_playback(PlaybackState::Loading);
                self.engine.attach(self.generation, &url);
            }
            Err(e) => {
                warn!("SessionController: invalid stream URL: {}", e);
                self.set_playback(PlaybackState::Errored(INVALID_URL.to_string()));
            }
        }
        self.publish_state();
        self.publish_now_playing();
    }

    /// Silence output.  The stream stays attached for `resume`.
    pub fn stop(&mut self) {
        self.engine.pause();
        self.set_playback(PlaybackState::Stopped);
        self.publish_state();
        self.publish_now_playing();
    }

    /// Continue the attached stream.  Never re-attaches.
    pub fn resume(&mut self) {
        if !self.state.powered_on || self.state.current_station.is_none() {
            debug!("SessionController: resume ignored");
            return;
        }
        if matches!(
            self.state.playback,
            PlaybackState::Loading | PlaybackState::Playing
        ) {
            return;
        }
        self.engine.play();
        self.set_playback(PlaybackState::Playing);
        self.publish_state();
        self.publish_now_playing();
    }

    fn set_playback(&mut self, next: PlaybackState) {
        if self.state.playback != next {
            info!(
                "SessionController: playback {:?} → {:?}",
                self.state.playback, next
            );
            self.state.playback = next;
        }
    }

    fn handle_stream_report(&mut self, report: StreamReport) {
        if report.generation != self.generation {
            debug!(
                "SessionController: stale stream report (generation {} ≠ {})",
                report.generation, self.generation
            );
            return;
        }
        match report.outcome {
            StreamOutcome::Ready => {
                if self.state.playback != PlaybackState::Loading {
                    debug!("SessionController: ready while {:?}, ignored", self.state.playback);
                    return;
                }
                self.engine.play();
                self.set_playback(PlaybackState::Playing);
            }
            StreamOutcome::Failed(reason) => {
                if !matches!(
                    self.state.playback,
                    PlaybackState::Loading | PlaybackState::Playing
                ) {
                    debug!("SessionController: failure while {:?}, ignored", self.state.playback);
                    return;
                }
                let message = if reason.trim().is_empty() {
                    PLAYBACK_FAILED.to_string()
                } else {
                    reason
                };
                warn!("SessionController: stream failed: {}", message);
                self.set_playback(PlaybackState::Errored(message));
            }
        }
        self.publish_state();
        self.publish_now_playing();
    }

    // ── navigation ────────────────────────────────────────────────────────────

    pub fn next_station(&mut self) {
        self.step_station(true);
    }

    pub fn previous_station(&mut self) {
        self.step_station(false);
    }

    fn step_station(&mut self, forward: bool) {
        let (index, station) = {
            let stations = self.current_stations();
            if stations.is_empty() {
                return;
            }
            let count = stations.len();
            let current = self.state.current_station_index % count;
            let index = if forward {
                (current + 1) % count
            } else {
                (current + count - 1) % count
            };
            (index, stations[index].clone())
        };
        self.state.current_station_index = index;
        self.select(station);
    }

    /// Play `station` when powered, otherwise only select it.
    fn select(&mut self, station: Station) {
        if self.state.powered_on {
            self.play(station);
        } else {
            self.state.current_station = Some(station);
            self.publish_state();
            self.publish_now_playing();
        }
    }

    pub fn next_category(&mut self) {
        self.step_category(true);
    }

    pub fn previous_category(&mut self) {
        self.step_category(false);
    }

    fn step_category(&mut self, forward: bool) {
        let target = {
            let categories = self.catalog().categories();
            if categories.is_empty() {
                return;
            }
            let count = categories.len();
            let current = self
                .state
                .current_category_id
                .as_deref()
                .and_then(|id| categories.iter().position(|c| c.id == id))
                .unwrap_or(0);
            let index = if forward {
                (current + 1) % count
            } else {
                (current + count - 1) % count
            };
            categories[index].id.clone()
        };
        self.change_category(&target);
    }

    pub fn switch_to_category(&mut self, category: &Category) {
        self.change_category(&category.id);
    }

    /// Select a category and one of its stations: random when shuffling is
    /// on, otherwise the first.
    pub fn change_category(&mut self, category_id: &str) {
        if self.catalog().category(category_id).is_none() {
            debug!("SessionController: no category '{}'", category_id);
            return;
        }
        let pick = {
            let stations = self.catalog().stations(category_id);
            if stations.is_empty() {
                None
            } else {
                let index = if self.settings.shuffle_on_category_change {
                    rand::thread_rng().gen_range(0..stations.len())
                } else {
                    0
                };
                Some((index, stations[index].clone()))
            }
        };
        info!("SessionController: category → '{}'", category_id);
        self.state.current_category_id = Some(category_id.to_string());
        match pick {
            Some((index, station)) => {
                self.state.current_station_index = index;
                self.select(station);
            }
            None => self.clear_selection(),
        }
    }

    /// No station to select: forget the current one and go quiet.
    fn clear_selection(&mut self) {
        self.state.current_station = None;
        self.state.current_station_index = 0;
        if self.state.playback != PlaybackState::Stopped {
            self.engine.pause();
            self.set_playback(PlaybackState::Stopped);
        }
        self.publish_state();
        self.publish_now_playing();
    }

    // ── interruptions & remote intents ────────────────────────────────────────

    pub fn handle_interruption(&mut self, event: Interruption) {
        info!("SessionController: interruption {:?}", event);
        match event {
            Interruption::Began => self.stop(),
            Interruption::Ended { should_resume } => {
                if should_resume {
                    self.resume();
                }
            }
        }
    }

    pub fn handle_remote(&mut self, intent: RemoteIntent) {
        info!("SessionController: remote {:?}", intent);
        match intent {
            RemoteIntent::Play => self.resume(),
            RemoteIntent::Pause => self.stop(),
            RemoteIntent::TogglePlayPause => {
                if self.state.playback.is_playing() {
                    self.stop();
                } else {
                    self.resume();
                }
            }
            RemoteIntent::Next => self.next_station(),
            RemoteIntent::Previous => self.previous_station(),
        }
    }

    // ── identification ────────────────────────────────────────────────────────

    pub fn identify_track(&mut self) {
        if self.state.identification == Identification::Listening {
            debug!("SessionController: already listening");
            return;
        }
        self.identify_attempt += 1;
        let attempt = self.identify_attempt;
        info!("SessionController: identify attempt {}", attempt);
        self.state.identification = Identification::Listening;

        let Some(tap) = self.audio_tap() else {
            warn!("SessionController: no audio to capture for identification");
            self.state.identification = Identification::Failed(IDENTIFY_UNAVAILABLE.to_string());
            self.publish_state();
            return;
        };
        if let Err(e) = self.audio_session.enter_capture() {
            warn!("SessionController: cannot enter capture mode: {}", e);
            self.state.identification = Identification::Failed(IDENTIFY_UNAVAILABLE.to_string());
            self.publish_state();
            return;
        }
        self.fingerprinter.start(attempt, tap);
        self.arm_identify_timeout(attempt);
        self.publish_state();
    }

    pub fn stop_identifying(&mut self) {
        self.end_identify_session();
        if self.state.identification != Identification::Idle {
            self.state.identification = Identification::Idle;
            self.publish_state();
        }
    }

    pub fn clear_identified_track(&mut self) {
        if matches!(
            self.state.identification,
            Identification::Matched(_) | Identification::Failed(_)
        ) {
            self.state.identification = Identification::Idle;
            self.publish_state();
        }
    }

    fn audio_tap(&self) -> Option<AudioTap> {
        match self.identify.source {
            CaptureSource::Microphone => Some(AudioTap::Device {
                format: self.identify.capture_format.clone(),
                device: self.identify.capture_device.clone(),
            }),
            CaptureSource::Stream => self
                .state
                .current_station
                .as_ref()
                .map(|s| AudioTap::Stream {
                    url: s.stream_url.clone(),
                }),
        }
    }

    fn arm_identify_timeout(&mut self, attempt: u64) {
        self.cancel_identify_timeout();
        let tx = self.event_tx.clone();
        let timeout = self.identify.timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(SessionEvent::IdentifyTimeout { attempt }).await;
        });
        self.identify_timer = Some(handle.abort_handle());
    }

    fn cancel_identify_timeout(&mut self) {
        if let Some(timer) = self.identify_timer.take() {
            timer.abort();
        }
    }

    fn end_identify_session(&mut self) {
        self.cancel_identify_timeout();
        self.fingerprinter.stop();
        self.audio_session.restore_playback();
    }

    fn is_current_attempt(&self, attempt: u64) -> bool {
        attempt == self.identify_attempt && self.state.identification == Identification::Listening
    }

    fn handle_fingerprint(&mut self, report: FingerprintReport) {
        if !self.is_current_attempt(report.attempt) {
            debug!("SessionController: stale fingerprint report for attempt {}", report.attempt);
            return;
        }
        match report.outcome {
            FingerprintOutcome::Matched(track) => {
                info!("SessionController: identified {}", track.display());
                self.end_identify_session();
                self.state.identification = Identification::Matched(track);
                self.publish_state();
            }
            FingerprintOutcome::NotMatched => {
                debug!("SessionController: no match yet for attempt {}", report.attempt);
            }
        }
    }

    fn handle_identify_timeout(&mut self, attempt: u64) {
        if !self.is_current_attempt(attempt) {
            debug!("SessionController: stale identify timeout for attempt {}", attempt);
            return;
        }
        info!("SessionController: identify attempt {} timed out", attempt);
        self.identify_timer = None;
        self.end_identify_session();
        self.state.identification = Identification::Failed(IDENTIFY_TIMED_OUT.to_string());
        self.publish_state();
    }

    // ── publication ───────────────────────────────────────────────────────────

    fn publish_state(&mut self) {
        self.rev += 1;
        self.snapshot_tx.send_replace(self.state.snapshot(self.rev));
    }

    fn publish_categories(&self) {
        self.categories_tx
            .send_replace(self.catalog().categories().to_vec());
    }

    fn publish_now_playing(&mut self) {
        let info = NowPlaying::project(self.state.current_station.as_ref(), &self.state.playback);
        self.now_playing.publish(info);
    }
}

static EMPTY_CATALOG: Catalog = Catalog::empty();

fn default_category<'a>(
    catalog: &'a dyn CatalogAccessor,
    settings: &PlaybackSettings,
) -> Option<&'a Category> {
    let categories = catalog.categories();
    categories
        .iter()
        .find(|c| c.short_name.eq_ignore_ascii_case(&settings.default_category))
        .or_else(|| categories.first())
}
