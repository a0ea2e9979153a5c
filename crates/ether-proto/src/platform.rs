use std::path::{Path, PathBuf};

pub const DAEMON_TCP_PORT: u16 = 9876;

const DAEMON_TCP_HOST: &str = "127.0.0.1";

pub fn daemon_address() -> String {
    format!("{}:{}", DAEMON_TCP_HOST, DAEMON_TCP_PORT)
}

/// Every stream handle gets its own mpv process, so the IPC endpoint is
/// keyed by handle id and the daemon pid.
#[cfg(unix)]
pub fn mpv_socket_name(handle_id: u64) -> String {
    format!(
        "{}/ether-mpv-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        handle_id
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(handle_id: u64) -> String {
    format!("ether-mpv-{}-{}", std::process::id(), handle_id)
}

#[cfg(unix)]
pub fn mpv_socket_arg(handle_id: u64) -> String {
    format!("--input-ipc-server={}", mpv_socket_name(handle_id))
}

#[cfg(windows)]
pub fn mpv_socket_arg(handle_id: u64) -> String {
    format!(
        "--input-ipc-server=\\\\.\\pipe\\{}",
        mpv_socket_name(handle_id)
    )
}

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/ether/ (XDG standard)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("ether")
    }
    #[cfg(windows)]
    {
        // Portable data directory beside the executable wins
        if let Some(portable_data) = beside_exe("data") {
            return portable_data;
        }

        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ether")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Some(portable_config) = beside_exe("config.toml") {
            if let Some(dir) = portable_config.parent() {
                return dir.to_path_buf();
            }
        }
    }

    // On macOS and Linux, always use ~/.config/ether/
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("ether")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ether")
    }
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

/// Returns `<exe dir>/<name>` when it exists.
pub fn beside_exe(name: &str) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let p = current_exe.parent()?.join(name);
    p.exists().then_some(p)
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.exists())
}

/// Find the mpv binary used as the decoding backend.
///
/// Order: explicit override, beside the executable (also `external/`), PATH.
pub fn find_mpv_binary(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        if p.exists() {
            return Some(p.to_path_buf());
        }
    }

    let exe_name = mpv_binary_name();
    beside_exe(exe_name)
        .or_else(|| beside_exe(&format!("external/{}", exe_name)))
        .or_else(|| find_on_path(exe_name))
}
