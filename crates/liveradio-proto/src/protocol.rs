use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames announcing a larger body are refused.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Fallback share text when nothing is selected.
pub const SHARE_FALLBACK: &str = "Live Radio";

/// Messages sent from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    PowerOn,
    PowerOff,
    TogglePower,
    /// Play a station by id.  The current category is searched first, then
    /// every other category.
    Play { station_id: String },
    Stop,
    Resume,
    Next,
    Prev,
    NextCategory,
    PrevCategory,
    SwitchCategory { category_id: String },
    Identify,
    StopIdentifying,
    ClearIdentified,
    /// Hardware / lock-screen style transport intent.
    Remote { intent: RemoteIntent },
    /// Audio-session interruption reported by an external session manager.
    Interruption { event: Interruption },
    /// Re-read the catalog source.
    ReloadCatalog,
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full snapshot.
    Hello {
        protocol_version: u32,
        state: SessionSnapshot,
    },
    State {
        data: SessionSnapshot,
    },
    NowPlaying {
        info: NowPlaying,
    },
    Log {
        message: String,
    },
}

/// Discrete transport intents from the remote command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteIntent {
    Play,
    Pause,
    TogglePlayPause,
    Next,
    Previous,
}

impl std::str::FromStr for RemoteIntent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "play" => Ok(Self::Play),
            "pause" => Ok(Self::Pause),
            "toggle" | "toggle_play_pause" => Ok(Self::TogglePlayPause),
            "next" => Ok(Self::Next),
            "prev" | "previous" => Ok(Self::Previous),
            other => anyhow::bail!("unknown remote intent '{}'", other),
        }
    }
}

/// Audio-session interruption events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interruption {
    Began,
    Ended { should_resume: bool },
}

/// Playback status of the session.  Mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Loading,
    Playing,
    Errored(String),
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::Playing)
    }

    /// Short label for status lines.
    pub fn label(&self) -> &str {
        match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Loading => "loading",
            PlaybackState::Playing => "playing",
            PlaybackState::Errored(_) => "error",
        }
    }
}

/// A track reported by the fingerprint collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Track {
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
    /// Link to the track on the matching service, when it provides one.
    #[serde(default)]
    pub link: Option<String>,
}

impl Track {
    /// "Artist – Title", or just the title.
    pub fn display(&self) -> String {
        match &self.artist {
            Some(artist) => format!("{} \u{2013} {}", artist, self.title),
            None => self.title.clone(),
        }
    }
}

/// Track identification sub-state.  Independent of [`PlaybackState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum Identification {
    #[default]
    Idle,
    Listening,
    Matched(Track),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Station {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub stream_url: String,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub short_name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub stations: Vec<Station>,
}

/// Read-only view of the session published after every transition.  `rev`
/// increases by one on each publish so clients can detect missed updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub powered_on: bool,
    pub current_category_id: Option<String>,
    pub current_station: Option<Station>,
    #[serde(default)]
    pub current_station_index: usize,
    pub playback: PlaybackState,
    pub identification: Identification,
}

impl SessionSnapshot {
    pub fn share_text(&self) -> String {
        share_text(self.current_station.as_ref())
    }

    pub fn share_link(&self) -> Option<reqwest::Url> {
        share_link(self.current_station.as_ref())
    }
}

/// Human-readable share line for the selected station.
pub fn share_text(station: Option<&Station>) -> String {
    match station {
        Some(s) => format!("Listening to {} on {}", s.name, SHARE_FALLBACK),
        None => SHARE_FALLBACK.to_string(),
    }
}

/// The selected station's website, if it has a parseable one.
pub fn share_link(station: Option<&Station>) -> Option<reqwest::Url> {
    station?
        .website_url
        .as_deref()
        .and_then(|u| reqwest::Url::parse(u).ok())
}

/// Snapshot pushed to the OS-level media-info surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NowPlaying {
    pub title: String,
    pub subtitle: String,
    pub is_live_stream: bool,
    pub playback_rate: f32,
}

impl NowPlaying {
    /// Project the selection and playback status into a now-playing snapshot.
    /// With no station the snapshot is blank, which clears stale metadata.
    pub fn project(station: Option<&Station>, playback: &PlaybackState) -> Self {
        let rate = if playback.is_playing() { 1.0 } else { 0.0 };
        match station {
            Some(s) => Self {
                title: s.name.clone(),
                subtitle: s.description.clone(),
                is_live_stream: true,
                playback_rate: rate,
            },
            None => Self {
                playback_rate: rate,
                ..Self::default()
            },
        }
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }

    /// Body length announced by the header at the head of `data`.
    pub fn declared_len(data: &[u8]) -> Option<usize> {
        let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(header) as usize)
    }

    /// Size of the leading frame, header included, once all of it is buffered.
    pub fn complete_frame_len(data: &[u8]) -> Option<usize> {
        let total = 4 + Self::declared_len(data)?;
        (data.len() >= total).then_some(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station() -> Station {
        Station {
            id: "wbgo".into(),
            name: "WBGO Jazz 88.3".into(),
            description: "America's premier jazz station".into(),
            stream_url: "https://wbgo.streamguys1.com/wbgo128".into(),
            website_url: Some("https://www.wbgo.org".into()),
            ..Station::default()
        }
    }

    #[test]
    fn test_command_frame_decodes_from_partial_buffer() {
        let msg = Message::Command(Command::Play {
            station_id: "wbgo".into(),
        });
        let encoded = msg.encode().unwrap();
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());

        let mut buf = encoded.clone();
        buf.extend_from_slice(&Message::Command(Command::Stop).encode().unwrap());
        let (decoded, len) = Message::decode(&buf).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Play { station_id }) => assert_eq!(station_id, "wbgo"),
            other => panic!("Wrong message type: {:?}", other),
        }
        let (next, _) = Message::decode(&buf[len..]).unwrap();
        assert!(matches!(next, Message::Command(Command::Stop)));
    }

    #[test]
    fn test_complete_frame_len_ignores_body_validity() {
        let mut frame = 5u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"{oops");
        assert!(Message::decode(&frame).is_err());
        assert_eq!(Message::complete_frame_len(&frame[..6]), None);
        assert_eq!(Message::complete_frame_len(&frame), Some(9));
        assert_eq!(Message::declared_len(&frame[..3]), None);
    }

    #[test]
    fn test_hello_carries_snapshot() {
        let state = SessionSnapshot {
            rev: 42,
            powered_on: true,
            current_station: Some(station()),
            playback: PlaybackState::Errored("timeout".into()),
            identification: Identification::Matched(Track {
                title: "So What".into(),
                artist: Some("Miles Davis".into()),
                link: None,
            }),
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            state: state.clone(),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                state: decoded_state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(decoded_state, state);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_remote_intent_parsing() {
        assert_eq!("toggle".parse::<RemoteIntent>().unwrap(), RemoteIntent::TogglePlayPause);
        assert_eq!("Previous".parse::<RemoteIntent>().unwrap(), RemoteIntent::Previous);
        assert_eq!(
            "toggle-play-pause".parse::<RemoteIntent>().unwrap(),
            RemoteIntent::TogglePlayPause
        );
        assert!("rewind".parse::<RemoteIntent>().is_err());
    }

    #[test]
    fn test_now_playing_projection() {
        let s = station();
        let playing = NowPlaying::project(Some(&s), &PlaybackState::Playing);
        assert_eq!(playing.title, "WBGO Jazz 88.3");
        assert_eq!(playing.subtitle, "America's premier jazz station");
        assert!(playing.is_live_stream);
        assert_eq!(playing.playback_rate, 1.0);

        let loading = NowPlaying::project(Some(&s), &PlaybackState::Loading);
        assert_eq!(loading.playback_rate, 0.0);
        assert!(loading.is_live_stream);

        let empty = NowPlaying::project(None, &PlaybackState::Stopped);
        assert_eq!(empty, NowPlaying::default());
    }

    #[test]
    fn test_share_projections() {
        assert_eq!(share_text(None), "Live Radio");
        assert!(share_link(None).is_none());

        let s = station();
        assert_eq!(share_text(Some(&s)), "Listening to WBGO Jazz 88.3 on Live Radio");
        assert_eq!(
            share_link(Some(&s)).map(|u| u.to_string()),
            Some("https://www.wbgo.org/".to_string())
        );

        let no_site = Station {
            website_url: Some("not a url".into()),
            ..station()
        };
        assert!(share_link(Some(&no_site)).is_none());
    }
}
