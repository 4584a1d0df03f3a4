use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    audio: Audio,
    network: Network,
    call: Call,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    min_buffer_bytes: usize,
    idle_poll_ms: u64,
    join_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Network {
    server_url: String,
    connect_timeout_secs: u64,
    write_timeout_secs: u64,
    ping_interval_secs: u64,
    accept_invalid_certs: bool,
}

#[derive(Deserialize)]
struct Call {
    vad_stop_secs: f64,
    settings_file: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=MIN_BUFFER_BYTES={}", config.audio.min_buffer_bytes);
    println!("cargo:rustc-env=IDLE_POLL_MS={}", config.audio.idle_poll_ms);
    println!("cargo:rustc-env=JOIN_TIMEOUT_MS={}", config.audio.join_timeout_ms);

    // 网络配置
    println!("cargo:rustc-env=SERVER_URL={}", config.network.server_url);
    println!("cargo:rustc-env=CONNECT_TIMEOUT_SECS={}", config.network.connect_timeout_secs);
    println!("cargo:rustc-env=WRITE_TIMEOUT_SECS={}", config.network.write_timeout_secs);
    println!("cargo:rustc-env=PING_INTERVAL_SECS={}", config.network.ping_interval_secs);
    println!("cargo:rustc-env=ACCEPT_INVALID_CERTS={}", config.network.accept_invalid_certs);

    // 通话配置
    println!("cargo:rustc-env=VAD_STOP_SECS={}", config.call.vad_stop_secs);
    println!("cargo:rustc-env=SETTINGS_FILE={}", config.call.settings_file);
}
