use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;

use voicecall_linux_rs::audio::{AlsaBackend, AlsaMicPermission};
use voicecall_linux_rs::controller::{CallController, CallDeps, CallState, Transport};
use voicecall_linux_rs::gui_bridge::{CONSOLE_HELP, CallUi, ConsoleCommand, ConsoleUi, run_console_input};
use voicecall_linux_rs::net_link::NetLink;
use voicecall_linux_rs::settings::{FileSettings, Settings, SettingsStore};
use voicecall_linux_rs::{Config, timezone};

/// voicecall - talk to a voice agent over a WebSocket
#[derive(Parser)]
#[command(name = "voicecall", version, about)]
struct Cli {
    /// Agent WebSocket URL (ws:// or wss://); saved to the settings file
    #[arg(short, long, env = "VOICECALL_URL")]
    url: Option<String>,

    /// End-of-speech silence threshold in seconds; saved to the settings file
    #[arg(long)]
    vad: Option<f64>,

    /// ALSA capture device
    #[arg(long)]
    capture_device: Option<String>,

    /// ALSA playback device
    #[arg(long)]
    playback_device: Option<String>,

    /// Accept self-signed or otherwise invalid server certificates
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    accept_invalid_certs: Option<bool>,

    /// Settings file (default: ~/.config/voicecall/settings.toml)
    #[arg(long, env = "VOICECALL_SETTINGS")]
    settings: Option<PathBuf>,

    /// Place a call right away
    #[arg(long)]
    call: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    if let Some(device) = cli.capture_device {
        config.capture_device = device;
    }
    if let Some(device) = cli.playback_device {
        config.playback_device = device;
    }
    if let Some(accept) = cli.accept_invalid_certs {
        config.accept_invalid_certs = accept;
    }

    let settings_path = cli
        .settings
        .or_else(|| voicecall_linux_rs::settings::default_path(config.settings_file))
        .unwrap_or_else(|| PathBuf::from(config.settings_file));
    let settings = Arc::new(FileSettings::load(
        &settings_path,
        Settings {
            server_url: config.server_url.clone(),
            vad_stop_secs: config.vad_stop_secs,
        },
    ));
    if let Some(url) = &cli.url {
        settings.set_server_url(url)?;
    }
    if let Some(vad) = cli.vad {
        settings.set_vad_value(vad)?;
    }

    log::info!(
        "{} {} starting, settings: {}",
        config.app_name,
        config.app_version,
        settings_path.display()
    );
    if config.accept_invalid_certs {
        log::warn!("TLS certificate validation is disabled; the server is not authenticated");
    }

    let ui = Arc::new(ConsoleUi::default());
    let link_config = config.link();
    let runtime = tokio::runtime::Handle::current();
    let deps = CallDeps {
        audio: config.audio(),
        capture_backend: Arc::new(AlsaBackend),
        playback_backend: Arc::new(AlsaBackend),
        permission: Arc::new(AlsaMicPermission::new(config.capture_device.clone())),
        settings: settings.clone(),
        ui: ui.clone(),
        transport: Box::new(move || -> Box<dyn Transport> {
            Box::new(NetLink::new(link_config.clone(), runtime.clone()))
        }),
        timezone: timezone::local_timezone(),
    };

    let (controller, handle) = CallController::new(deps);
    let controller = tokio::spawn(controller.run());

    let (tx_console, mut rx_console) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = run_console_input(tx_console).await {
            log::error!("Console input error: {}", e);
        }
    });

    println!("{}", CONSOLE_HELP);
    ui.status("Ready");
    if cli.call {
        handle.start_call();
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }
            Some(command) = rx_console.recv() => match command {
                ConsoleCommand::Call => handle.start_call(),
                ConsoleCommand::Hangup => handle.hangup(),
                ConsoleCommand::Vad(seconds) => handle.update_vad(seconds),
                ConsoleCommand::Url(url) => {
                    if handle.state() != CallState::Idle {
                        println!("Hang up before changing the server URL");
                    } else if let Err(e) = settings.set_server_url(&url) {
                        println!("{}", e);
                    } else {
                        println!("Server URL set to {}", settings.server_url());
                    }
                }
                ConsoleCommand::Help => println!("{}", CONSOLE_HELP),
                ConsoleCommand::Quit => break,
            },
        }
    }

    handle.shutdown();
    if let Err(e) = controller.await {
        log::error!("Call controller task failed: {}", e);
    }
    Ok(())
}
