//! IANA name of the local timezone, for the `connect` message.

use std::path::Path;

const FALLBACK: &str = "UTC";

/// Resolution order: `TZ`, `/etc/timezone`, the `/etc/localtime` symlink,
/// then `UTC`.
pub fn local_timezone() -> String {
    resolve(
        std::env::var("TZ").ok().as_deref(),
        Path::new("/etc/timezone"),
        Path::new("/etc/localtime"),
    )
}

fn resolve(tz_env: Option<&str>, timezone_file: &Path, localtime: &Path) -> String {
    if let Some(name) = tz_env.and_then(from_tz_env) {
        return name;
    }
    if let Some(name) = std::fs::read_to_string(timezone_file)
        .ok()
        .and_then(|s| non_empty(s.lines().next().unwrap_or_default()))
    {
        return name;
    }
    if let Some(name) = std::fs::read_link(localtime)
        .ok()
        .and_then(|target| zone_from_path(&target.to_string_lossy()))
    {
        return name;
    }
    FALLBACK.to_string()
}

// `TZ=:Europe/Berlin` and `TZ=/usr/share/zoneinfo/Europe/Berlin` are both valid.
fn from_tz_env(value: &str) -> Option<String> {
    let value = value.strip_prefix(':').unwrap_or(value);
    if value.starts_with('/') {
        return zone_from_path(value);
    }
    non_empty(value)
}

fn zone_from_path(path: &str) -> Option<String> {
    let (_, zone) = path.split_once("zoneinfo/")?;
    non_empty(zone.trim_start_matches("posix/").trim_start_matches("right/"))
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
