/// mpv-backed stream engine.
///
/// Architecture:
///
/// ```text
///   MpvEngine (StreamEngine, called from the controller task)
///         │  EngineCommand via unbounded mpsc (never blocks the controller)
///         ▼
///   engine_task ── owns MpvDriver + MpvHandle, heartbeat liveness check
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event                     → engine_task
/// ```
///
/// Readiness and failures go back to the controller as
/// `SessionEvent::Stream` tagged with the generation of the attach they
/// belong to.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use liveradio_proto::platform;
use reqwest::Url;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::core::SessionEvent;
use crate::engine::{StreamEngine, StreamReport};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const HEARTBEAT: tokio::time::Duration = tokio::time::Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    pub fn playlist_entry_id(&self) -> Option<i64> {
        self.raw.get("playlist_entry_id")?.as_i64()
    }

    /// For `end-file`: the failure message, or `None` when the file ended
    /// because we replaced or stopped it.
    pub fn end_file_failure(&self) -> Option<String> {
        let reason = self.raw.get("reason").and_then(Value::as_str).unwrap_or("unknown");
        match reason {
            "stop" | "redirect" => None,
            "error" => Some(
                self.raw
                    .get("file_error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_default(),
            ),
            "eof" => Some("Stream ended".to_string()),
            other => Some(format!("mpv: {}", other)),
        }
    }
}

// ── IPC handle ────────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Replace the current file.  Returns mpv's playlist entry id for it.
    pub async fn load(&self, url: &str) -> anyhow::Result<Option<i64>> {
        let resp = self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(resp["data"]["playlist_entry_id"].as_i64())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }
}

// ── process driver ────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    volume: f32,
}

impl MpvDriver {
    pub fn new(volume: f32) -> Self {
        Self {
            socket_name: platform::mpv_socket_name(),
            process: None,
            volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    async fn spawn_process(&mut self) -> anyhow::Result<()> {
        self.kill().await;

        info!("mpv: spawning new process");
        let mpv_binary = platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--pause")
            .arg(platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process().await?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn_process().await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);
    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));
    MpvHandle { tx: cmd_tx }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register the reply channel before writing so the reader can match it.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── StreamEngine ──────────────────────────────────────────────────────────────

#[derive(Debug)]
enum EngineCommand {
    Attach { generation: u64, url: String },
    Play,
    Pause,
    Shutdown,
}

/// `StreamEngine` implementation driving one `mpv --idle` process.
pub struct MpvEngine {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
}

impl MpvEngine {
    /// Start the engine task.  mpv itself is spawned lazily on first attach.
    pub fn spawn(session_tx: mpsc::Sender<SessionEvent>, volume: f32) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = EngineWorker::new(session_tx, volume);
        tokio::spawn(worker.run(cmd_rx));
        Self { cmd_tx }
    }

    fn send(&self, cmd: EngineCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            warn!("mpv: engine task gone");
        }
    }
}

impl StreamEngine for MpvEngine {
    fn attach(&mut self, generation: u64, url: &Url) {
        self.send(EngineCommand::Attach {
            generation,
            url: url.to_string(),
        });
    }

    fn play(&mut self) {
        self.send(EngineCommand::Play);
    }

    fn pause(&mut self) {
        self.send(EngineCommand::Pause);
    }

    fn shutdown(&mut self) {
        self.send(EngineCommand::Shutdown);
    }
}

/// What is loaded in mpv right now.
#[derive(Debug, Clone, Copy)]
struct Attached {
    generation: u64,
    entry_id: Option<i64>,
    started: bool,
}

impl Attached {
    /// Events without an entry id (older mpv) are attributed to the current file.
    fn owns(&self, event: &MpvEvent) -> bool {
        match (self.entry_id, event.playlist_entry_id()) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

struct EngineWorker {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    session_tx: mpsc::Sender<SessionEvent>,
    mpv_event_tx: mpsc::Sender<MpvEvent>,
    mpv_event_rx: mpsc::Receiver<MpvEvent>,
    attached: Option<Attached>,
}

impl EngineWorker {
    fn new(session_tx: mpsc::Sender<SessionEvent>, volume: f32) -> Self {
        let (mpv_event_tx, mpv_event_rx) = mpsc::channel(256);
        Self {
            driver: MpvDriver::new(volume),
            handle: None,
            session_tx,
            mpv_event_tx,
            mpv_event_rx,
            attached: None,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(EngineCommand::Shutdown) => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(evt) = self.mpv_event_rx.recv() => self.handle_mpv_event(evt).await,
                _ = heartbeat.tick() => self.check_liveness().await,
            }
        }
        info!("mpv: engine shutting down");
        self.driver.kill().await;
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        debug!("mpv: engine command {:?}", cmd);
        match cmd {
            EngineCommand::Attach { generation, url } => self.attach(generation, &url).await,
            EngineCommand::Play => self.set_pause(false).await,
            EngineCommand::Pause => self.set_pause(true).await,
            EngineCommand::Shutdown => {}
        }
    }

    async fn ensure_handle(&mut self) -> Option<MpvHandle> {
        if self.handle.is_some() && !self.driver.process_alive() {
            self.handle = None;
        }
        if self.handle.is_none() {
            match self.driver.spawn_and_connect(self.mpv_event_tx.clone()).await {
                Ok(h) => self.handle = Some(h),
                Err(e) => warn!("mpv: failed to start: {:#}", e),
            }
        }
        self.handle.clone()
    }

    async fn attach(&mut self, generation: u64, url: &str) {
        self.attached = Some(Attached {
            generation,
            entry_id: None,
            started: false,
        });
        let Some(handle) = self.ensure_handle().await else {
            self.report(StreamReport::failed(generation, "mpv is not available")).await;
            return;
        };
        // Load paused; the controller unpauses once the stream is ready.
        if let Err(e) = handle.set_pause(true).await {
            debug!("mpv: pause before load failed: {}", e);
        }
        match handle.load(url).await {
            Ok(entry_id) => {
                info!("mpv: loading {} (generation {}, entry {:?})", url, generation, entry_id);
                if let Some(a) = self.attached.as_mut().filter(|a| a.generation == generation) {
                    a.entry_id = entry_id;
                }
            }
            Err(e) => {
                warn!("mpv: loadfile failed: {}", e);
                self.report(StreamReport::failed(generation, e.to_string())).await;
            }
        }
    }

    async fn set_pause(&mut self, paused: bool) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        if let Err(e) = handle.set_pause(paused).await {
            warn!("mpv: set pause={} failed: {}", paused, e);
        }
    }

    async fn handle_mpv_event(&mut self, evt: MpvEvent) {
        let Some(attached) = self.attached else {
            return;
        };
        match evt.event_name() {
            Some("start-file") if attached.owns(&evt) => {
                if let Some(a) = self.attached.as_mut() {
                    a.started = true;
                }
            }
            Some("file-loaded") if attached.started || attached.entry_id.is_none() => {
                info!("mpv: file-loaded (generation {})", attached.generation);
                self.report(StreamReport::ready(attached.generation)).await;
            }
            Some("end-file") if attached.owns(&evt) => {
                if let Some(reason) = evt.end_file_failure() {
                    warn!("mpv: stream ended: {:?}", reason);
                    self.attached = None;
                    self.report(StreamReport::failed(attached.generation, reason)).await;
                }
            }
            _ => {}
        }
    }

    async fn check_liveness(&mut self) {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("mpv: heartbeat: process died");
            self.handle = None;
            if let Some(attached) = self.attached.take() {
                self.report(StreamReport::failed(attached.generation, "mpv exited")).await;
            }
        }
    }

    async fn report(&self, report: StreamReport) {
        let _ = self.session_tx.send(SessionEvent::Stream(report)).await;
    }
}
