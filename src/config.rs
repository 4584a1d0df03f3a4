use std::time::Duration;

use crate::audio::AudioConfig;
use crate::net_link::{LinkConfig, TlsPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 音频配置
    pub capture_device: String,
    pub playback_device: String,
    pub sample_rate: u32,
    pub min_buffer_bytes: usize,
    pub idle_poll_ms: u64,
    pub join_timeout_ms: u64,

    // 网络配置
    pub server_url: String,
    pub connect_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub accept_invalid_certs: bool,

    // 通话配置
    pub vad_stop_secs: f64,
    pub settings_file: &'static str,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            capture_device: env!("CAPTURE_DEVICE").to_string(),
            playback_device: env!("PLAYBACK_DEVICE").to_string(),
            sample_rate: env!("SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse SAMPLE_RATE")?,
            min_buffer_bytes: env!("MIN_BUFFER_BYTES")
                .parse()
                .map_err(|_| "Failed to parse MIN_BUFFER_BYTES")?,
            idle_poll_ms: env!("IDLE_POLL_MS")
                .parse()
                .map_err(|_| "Failed to parse IDLE_POLL_MS")?,
            join_timeout_ms: env!("JOIN_TIMEOUT_MS")
                .parse()
                .map_err(|_| "Failed to parse JOIN_TIMEOUT_MS")?,

            server_url: env!("SERVER_URL").to_string(),
            connect_timeout_secs: env!("CONNECT_TIMEOUT_SECS")
                .parse()
                .map_err(|_| "Failed to parse CONNECT_TIMEOUT_SECS")?,
            write_timeout_secs: env!("WRITE_TIMEOUT_SECS")
                .parse()
                .map_err(|_| "Failed to parse WRITE_TIMEOUT_SECS")?,
            ping_interval_secs: env!("PING_INTERVAL_SECS")
                .parse()
                .map_err(|_| "Failed to parse PING_INTERVAL_SECS")?,
            accept_invalid_certs: env!("ACCEPT_INVALID_CERTS")
                .parse()
                .map_err(|_| "Failed to parse ACCEPT_INVALID_CERTS")?,

            vad_stop_secs: env!("VAD_STOP_SECS")
                .parse()
                .map_err(|_| "Failed to parse VAD_STOP_SECS")?,
            settings_file: env!("SETTINGS_FILE"),
        })
    }

    /// Audio parameters shared by the capture and playback streams.
    pub fn audio(&self) -> AudioConfig {
        AudioConfig {
            capture_device: self.capture_device.clone(),
            playback_device: self.playback_device.clone(),
            sample_rate: self.sample_rate,
            min_buffer_bytes: self.min_buffer_bytes,
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
        }
    }

    /// Connection parameters for the WebSocket link.
    pub fn link(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            tls: if self.accept_invalid_certs {
                TlsPolicy::AcceptInvalidCerts
            } else {
                TlsPolicy::Verify
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_time_config_matches_config_toml() {
        let config = Config::new().unwrap();
        assert_eq!(config.sample_rate, 16000);
        assert!(config.min_buffer_bytes >= 4096);
        assert_eq!(config.join_timeout_ms, 1000);
        assert_eq!(config.ping_interval_secs, 30);
    }

    #[test]
    fn derived_audio_and_link_configs_carry_durations() {
        let config = Config::new().unwrap();
        let audio = config.audio();
        assert_eq!(audio.idle_poll, Duration::from_millis(config.idle_poll_ms));
        assert_eq!(audio.join_timeout, Duration::from_secs(1));

        let link = config.link();
        assert_eq!(link.connect_timeout, Duration::from_secs(10));
        assert_eq!(link.write_timeout, Duration::from_secs(10));
    }
}
