//! Persisted user settings: destination URL and VAD threshold.
//!
//! Stored as TOML at `~/.config/voicecall/settings.toml` by default. The file
//! is a partial overlay on top of the build-time defaults; a missing or
//! unreadable file just means defaults.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CallError, Result};

/// Get/set access to the values a call needs.
pub trait SettingsStore: Send + Sync {
    fn server_url(&self) -> String;
    fn set_server_url(&self, url: &str) -> Result<()>;
    /// Server-side end-of-speech silence threshold, in seconds
    fn vad_value(&self) -> f64;
    fn set_vad_value(&self, seconds: f64) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub server_url: String,
    pub vad_stop_secs: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            vad_stop_secs: 2.0,
        }
    }
}

/// On-disk schema; every field optional.
#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    server_url: Option<String>,
    vad_stop_secs: Option<f64>,
}

impl Settings {
    fn overlay(mut self, file: SettingsFile) -> Self {
        if let Some(url) = file.server_url {
            self.server_url = url;
        }
        if let Some(vad) = file.vad_stop_secs.filter(|v| validate_vad(*v).is_ok()) {
            self.vad_stop_secs = vad;
        }
        self
    }
}

pub fn validate_vad(seconds: f64) -> Result<()> {
    if seconds.is_finite() && seconds > 0.0 {
        Ok(())
    } else {
        Err(CallError::Settings(format!(
            "VAD threshold must be a positive number of seconds, got {}",
            seconds
        )))
    }
}

/// Return the settings path: `~/.config/voicecall/<file_name>`
pub fn default_path(file_name: &str) -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voicecall").join(file_name))
}

/// Settings backed by a TOML file; every change is written through.
pub struct FileSettings {
    path: PathBuf,
    current: Mutex<Settings>,
}

impl FileSettings {
    pub fn load(path: impl Into<PathBuf>, defaults: Settings) -> Self {
        let path = path.into();
        let current = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<SettingsFile>(&content) {
                Ok(file) => {
                    log::info!("Loaded settings from {}", path.display());
                    defaults.overlay(file)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}, using defaults: {}", path.display(), e);
                    defaults
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => defaults,
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                defaults
            }
        };
        Self {
            path,
            current: Mutex::new(current),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Settings {
        self.current.lock().clone()
    }

    fn update(&self, apply: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut current = self.current.lock();
        let mut next = current.clone();
        apply(&mut next);
        persist(&self.path, &next)?;
        *current = next;
        Ok(())
    }
}

/// Write via a sibling temp file and rename, so a crash never leaves a
/// truncated settings file behind.
fn persist(path: &Path, settings: &Settings) -> Result<()> {
    let fail = |what: &str, e: &dyn std::fmt::Display| {
        CallError::Settings(format!("{} {}: {}", what, path.display(), e))
    };

    let content = toml::to_string(settings).map_err(|e| fail("failed to encode", &e))?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| fail("failed to create directory for", &e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, content).map_err(|e| fail("failed to write", &e))?;
    std::fs::rename(&tmp, path).map_err(|e| fail("failed to replace", &e))?;
    log::debug!("Saved settings to {}", path.display());
    Ok(())
}

impl SettingsStore for FileSettings {
    fn server_url(&self) -> String {
        self.current.lock().server_url.clone()
    }

    fn set_server_url(&self, url: &str) -> Result<()> {
        let url = url.trim().to_string();
        self.update(|s| s.server_url = url)
    }

    fn vad_value(&self) -> f64 {
        self.current.lock().vad_stop_secs
    }

    fn set_vad_value(&self, seconds: f64) -> Result<()> {
        validate_vad(seconds)?;
        self.update(|s| s.vad_stop_secs = seconds)
    }
}

/// Settings that live only as long as the process.
#[derive(Default)]
pub struct MemorySettings(Mutex<Settings>);

impl MemorySettings {
    pub fn new(settings: Settings) -> Self {
        Self(Mutex::new(settings))
    }
}

impl SettingsStore for MemorySettings {
    fn server_url(&self) -> String {
        self.0.lock().server_url.clone()
    }

    fn set_server_url(&self, url: &str) -> Result<()> {
        self.0.lock().server_url = url.trim().to_string();
        Ok(())
    }

    fn vad_value(&self) -> f64 {
        self.0.lock().vad_stop_secs
    }

    fn set_vad_value(&self, seconds: f64) -> Result<()> {
        validate_vad(seconds)?;
        self.0.lock().vad_stop_secs = seconds;
        Ok(())
    }
}
