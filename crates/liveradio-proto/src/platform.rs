use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9877;

const APP_DIR: &str = "liveradio";

#[cfg(unix)]
pub fn mpv_socket_name() -> String {
    format!("{}/liveradio-mpv.sock", std::env::temp_dir().display())
}

#[cfg(windows)]
pub fn mpv_socket_name() -> String {
    "liveradio-mpv".to_string()
}

#[cfg(unix)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server={}", mpv_socket_name())
}

#[cfg(windows)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name())
}

pub fn data_dir() -> PathBuf {
    // ~/.local/share/liveradio on every unix, including macOS
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

#[cfg(unix)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv"]
}

#[cfg(windows)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv.exe", "mpv"]
}

#[cfg(unix)]
fn vibra_binary_names() -> &'static [&'static str] {
    &["vibra"]
}

#[cfg(windows)]
fn vibra_binary_names() -> &'static [&'static str] {
    &["vibra.exe", "vibra"]
}

#[cfg(unix)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg"]
}

#[cfg(windows)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg.exe", "ffmpeg"]
}

/// A file next to the running executable, if it exists.
pub fn beside_exe(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let p = exe.parent()?.join(name);
    p.exists().then_some(p)
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|p| p.exists())
}

/// Look up a tool: explicit env override, beside the executable, then PATH.
fn find_tool(env_var: &str, names: &[&str]) -> Option<PathBuf> {
    if let Some(p) = std::env::var_os(env_var).map(PathBuf::from) {
        if p.exists() {
            return Some(p);
        }
    }
    names
        .iter()
        .find_map(|name| beside_exe(name))
        .or_else(|| find_on_path(names))
}

/// Find the mpv binary used as the stream engine.
pub fn find_mpv_binary() -> Option<PathBuf> {
    find_tool("MPV_PATH", mpv_binary_names())
}

/// Find the vibra binary (Shazam-compatible fingerprint CLI).
pub fn find_vibra_binary() -> Option<PathBuf> {
    find_tool("VIBRA_PATH", vibra_binary_names())
}

/// Find ffmpeg, used to capture audio for fingerprinting.
pub fn find_ffmpeg_binary() -> Option<PathBuf> {
    find_tool("FFMPEG_PATH", ffmpeg_binary_names())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_are_app_scoped() {
        assert!(config_dir().ends_with(APP_DIR));
        assert!(data_dir().ends_with(APP_DIR));
    }

    #[test]
    fn test_missing_tool_is_none() {
        assert!(find_tool("LIVERADIO_TEST_NO_SUCH_VAR", &["liveradio-no-such-binary"]).is_none());
    }
}
