//! Interruption source.
//!
//! On unix an external session manager (or a shell script) reports that
//! another app took the audio device with `SIGUSR1` and that it was released
//! with `SIGUSR2`.  Clients can send the same events as
//! `Command::Interruption`.

use liveradio_proto::protocol::Interruption;
use tokio::sync::mpsc;

use crate::core::SessionEvent;

#[cfg(unix)]
pub fn start_signal_listener(event_tx: mpsc::Sender<SessionEvent>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::info;

    let mut began = signal(SignalKind::user_defined1())?;
    let mut ended = signal(SignalKind::user_defined2())?;
    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(()) = began.recv() => Interruption::Began,
                Some(()) = ended.recv() => Interruption::Ended { should_resume: true },
                else => break,
            };
            info!("interruption signal: {:?}", event);
            if event_tx.send(SessionEvent::Interruption(event)).await.is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn start_signal_listener(_event_tx: mpsc::Sender<SessionEvent>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    tracing::debug!("interruption signals are unix-only");
    Ok(tokio::spawn(async {}))
}
