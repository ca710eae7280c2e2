use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use liveradio_proto::config::Config;
use liveradio_proto::protocol::{
    Broadcast, Command, Identification, Interruption, Message, PlaybackState, RemoteIntent,
    SessionSnapshot, PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(name = "liveradio")]
#[command(about = "Control the liveradio daemon")]
struct Cli {
    /// Daemon address, defaults to the configured bind address and port.
    #[arg(long)]
    address: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Print the current session.
    Status,
    /// Stream state changes, now-playing updates and daemon warnings.
    Watch,
    Power {
        #[arg(value_enum)]
        state: PowerArg,
    },
    /// Play a station by id.
    Play { station_id: String },
    Stop,
    Resume,
    Next,
    Prev,
    /// `next`, `prev`, or a category id.
    Category { target: String },
    /// Identify the playing track.
    Identify {
        /// Cancel a running identification.
        #[arg(long, conflicts_with = "clear")]
        cancel: bool,
        /// Dismiss the last result.
        #[arg(long)]
        clear: bool,
    },
    /// Send a transport intent (play, pause, toggle, next, prev).
    Remote { intent: RemoteIntent },
    /// Report an audio interruption.
    Interrupt {
        #[arg(value_enum)]
        phase: InterruptArg,
        /// With `ended`: do not resume playback.
        #[arg(long)]
        no_resume: bool,
    },
    /// Re-read the station catalog.
    Reload,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PowerArg {
    On,
    Off,
    Toggle,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum InterruptArg {
    Began,
    Ended,
}

impl Cmd {
    fn to_command(&self) -> Option<Command> {
        let cmd = match self {
            Cmd::Status | Cmd::Watch => return None,
            Cmd::Power { state } => match state {
                PowerArg::On => Command::PowerOn,
                PowerArg::Off => Command::PowerOff,
                PowerArg::Toggle => Command::TogglePower,
            },
            Cmd::Play { station_id } => Command::Play {
                station_id: station_id.clone(),
            },
            Cmd::Stop => Command::Stop,
            Cmd::Resume => Command::Resume,
            Cmd::Next => Command::Next,
            Cmd::Prev => Command::Prev,
            Cmd::Category { target } => match target.as_str() {
                "next" => Command::NextCategory,
                "prev" | "previous" => Command::PrevCategory,
                id => Command::SwitchCategory {
                    category_id: id.to_string(),
                },
            },
            Cmd::Identify { cancel: true, .. } => Command::StopIdentifying,
            Cmd::Identify { clear: true, .. } => Command::ClearIdentified,
            Cmd::Identify { .. } => Command::Identify,
            Cmd::Remote { intent } => Command::Remote { intent: *intent },
            Cmd::Interrupt { phase, no_resume } => Command::Interruption {
                event: match phase {
                    InterruptArg::Began => Interruption::Began,
                    InterruptArg::Ended => Interruption::Ended {
                        should_resume: !no_resume,
                    },
                },
            },
            Cmd::Reload => Command::ReloadCatalog,
        };
        Some(cmd)
    }
}

/// Framed connection to the daemon.
struct Connection {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Connection {
    async fn open(address: &str) -> anyhow::Result<(Self, SessionSnapshot)> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("cannot reach liveradiod at {}", address))?;
        let mut conn = Self {
            stream,
            buf: Vec::new(),
        };
        match conn.next_broadcast().await? {
            Broadcast::Hello {
                protocol_version,
                state,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        "daemon speaks protocol {}, this client {}",
                        protocol_version, PROTOCOL_VERSION
                    );
                }
                Ok((conn, state))
            }
            other => anyhow::bail!("expected hello, got {:?}", other),
        }
    }

    async fn send(&mut self, cmd: Command) -> anyhow::Result<()> {
        let frame = Message::Command(cmd).encode()?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn next_broadcast(&mut self) -> anyhow::Result<Broadcast> {
        let mut tmp = [0u8; 4096];
        loop {
            if let Ok((msg, consumed)) = Message::decode(&self.buf) {
                self.buf.drain(..consumed);
                if let Message::Broadcast(b) = msg {
                    return Ok(b);
                }
                continue;
            }
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                anyhow::bail!("daemon closed the connection");
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Wait for the first snapshot newer than `rev`.
    async fn next_state_after(&mut self, rev: u64) -> anyhow::Result<SessionSnapshot> {
        loop {
            if let Broadcast::State { data } = self.next_broadcast().await? {
                if data.rev > rev {
                    return Ok(data);
                }
            }
        }
    }
}

fn describe(snapshot: &SessionSnapshot) -> String {
    let power = if snapshot.powered_on { "on" } else { "off" };
    let station = snapshot
        .current_station
        .as_ref()
        .map(|s| format!("{} [{}]", s.name, s.id))
        .unwrap_or_else(|| "-".to_string());
    let category = snapshot.current_category_id.as_deref().unwrap_or("-");
    let playback = match &snapshot.playback {
        PlaybackState::Errored(msg) => format!("error: {}", msg),
        other => other.label().to_string(),
    };
    let mut out = format!(
        "power     {}\ncategory  {}\nstation   {}\nplayback  {}",
        power, category, station, playback
    );
    match &snapshot.identification {
        Identification::Idle => {}
        Identification::Listening => out.push_str("\nidentify  listening…"),
        Identification::Matched(track) => {
            out.push_str(&format!("\nidentify  {}", track.display()));
            if let Some(link) = &track.link {
                out.push_str(&format!("\n          {}", link));
            }
        }
        Identification::Failed(msg) => out.push_str(&format!("\nidentify  failed: {}", msg)),
    }
    out
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let address = match cli.address {
        Some(a) => a,
        None => Config::load()?.daemon_address(),
    };
    let (mut conn, hello) = Connection::open(&address).await?;

    match cli.command.to_command() {
        None if matches!(cli.command, Cmd::Watch) => {
            println!("{}\n", describe(&hello));
            loop {
                match conn.next_broadcast().await? {
                    Broadcast::State { data } => println!("{}\n", describe(&data)),
                    Broadcast::NowPlaying { info } => {
                        println!("now playing: {} - {}", info.title, info.subtitle)
                    }
                    Broadcast::Log { message } => eprintln!("{}", message),
                    Broadcast::Hello { .. } => {}
                }
            }
        }
        None => println!("{}", describe(&hello)),
        Some(cmd) => {
            conn.send(cmd).await?;
            match tokio::time::timeout(REPLY_TIMEOUT, conn.next_state_after(hello.rev)).await {
                Ok(state) => println!("{}", describe(&state?)),
                // Commands that change nothing produce no new snapshot.
                Err(_) => println!("{}", describe(&hello)),
            }
        }
    }
    Ok(())
}
