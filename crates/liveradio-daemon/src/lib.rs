pub mod audio_session;
pub mod core;
pub mod engine;
pub mod fingerprint;
pub mod http;
pub mod interruption;
pub mod logging;
pub mod media_controls;
pub mod mpv;
pub mod now_playing;
pub mod socket;

use liveradio_proto::protocol::NowPlaying;

/// Fan-out messages from the daemon to every connected client.  Session
/// snapshots travel on their own watch channel.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    NowPlaying(NowPlaying),
    Log(String),
}
