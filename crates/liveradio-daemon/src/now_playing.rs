use std::path::PathBuf;

use liveradio_proto::protocol::NowPlaying;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::BroadcastMessage;

/// Write-only sink for the OS media-info surface.
pub trait NowPlayingPublisher: Send {
    fn publish(&mut self, info: NowPlaying);
}

/// Pushes now-playing snapshots to every connected client and, optionally,
/// mirrors them into a JSON file that status bars can poll.
pub struct BroadcastPublisher {
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    status_file: Option<PathBuf>,
    last: Option<NowPlaying>,
}

impl BroadcastPublisher {
    pub fn new(broadcast_tx: broadcast::Sender<BroadcastMessage>, status_file: Option<PathBuf>) -> Self {
        Self {
            broadcast_tx,
            status_file,
            last: None,
        }
    }

    fn mirror_to_file(&self, info: &NowPlaying) {
        let Some(path) = self.status_file.clone() else {
            return;
        };
        let json = match serde_json::to_vec_pretty(info) {
            Ok(j) => j,
            Err(e) => {
                warn!("now-playing: failed to serialise snapshot: {}", e);
                return;
            }
        };
        // Fire-and-forget: the controller never waits on the filesystem.
        tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            if let Err(e) = tokio::fs::write(&path, json).await {
                warn!("now-playing: failed to write {}: {}", path.display(), e);
            }
        });
    }
}

impl NowPlayingPublisher for BroadcastPublisher {
    fn publish(&mut self, info: NowPlaying) {
        debug!(
            "now-playing: title={:?} rate={} live={}",
            info.title, info.playback_rate, info.is_live_stream
        );
        // Re-sent even when unchanged so late subscribers converge.
        let _ = self.broadcast_tx.send(BroadcastMessage::NowPlaying(info.clone()));
        if self.last.as_ref() != Some(&info) {
            self.mirror_to_file(&info);
            self.last = Some(info);
        }
    }
}

/// Hands every snapshot to each sink in turn.
pub struct FanoutPublisher(Vec<Box<dyn NowPlayingPublisher>>);

impl FanoutPublisher {
    pub fn new(sinks: Vec<Box<dyn NowPlayingPublisher>>) -> Self {
        Self(sinks)
    }
}

impl NowPlayingPublisher for FanoutPublisher {
    fn publish(&mut self, info: NowPlaying) {
        for sink in &mut self.0 {
            sink.publish(info.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Sink(Arc<Mutex<Vec<NowPlaying>>>);

    impl NowPlayingPublisher for Sink {
        fn publish(&mut self, info: NowPlaying) {
            self.0.lock().unwrap().push(info);
        }
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));
        let mut fanout = FanoutPublisher::new(vec![Box::new(Sink(a.clone())), Box::new(Sink(b.clone()))]);
        let info = NowPlaying {
            title: "FIP Radio".into(),
            playback_rate: 1.0,
            ..NowPlaying::default()
        };
        fanout.publish(info.clone());
        assert_eq!(*a.lock().unwrap(), vec![info.clone()]);
        assert_eq!(*b.lock().unwrap(), vec![info]);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut publisher = BroadcastPublisher::new(tx, None);
        let info = NowPlaying {
            title: "Jazz24".into(),
            subtitle: "24/7 Jazz from KNKX".into(),
            is_live_stream: true,
            playback_rate: 1.0,
        };
        publisher.publish(info.clone());
        match rx.recv().await.unwrap() {
            BroadcastMessage::NowPlaying(got) => assert_eq!(got, info),
            other => panic!("unexpected broadcast {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_file_mirror() {
        let path = std::env::temp_dir().join(format!("liveradio-np-{}.json", std::process::id()));
        let (tx, _rx) = broadcast::channel(8);
        let mut publisher = BroadcastPublisher::new(tx, Some(path.clone()));
        publisher.publish(NowPlaying::default());

        let mut written = None;
        for _ in 0..50 {
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if let Ok(np) = serde_json::from_slice::<NowPlaying>(&bytes) {
                    written = Some(np);
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let _ = tokio::fs::remove_file(&path).await;
        assert_eq!(written, Some(NowPlaying::default()));
    }
}
