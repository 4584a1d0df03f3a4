//! UI collaborator: what the call shows to the user, and what the user asks
//! of the call.
//!
//! The orchestrator only talks to [`CallUi`]. The console implementation
//! prints to stdout and reads commands from stdin.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::protocol::SilenceReport;

pub trait CallUi: Send + Sync {
    /// One-line call status ("Ringing", "Listening", "Error: ...", "Ready")
    fn status(&self, text: &str);
    fn transcript(&self, entry: TranscriptEntry);
    /// The channel opened; start the call timer
    fn call_started(&self);
    fn call_ended(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    pub fn label(self) -> &'static str {
        match self {
            Speaker::User => "You",
            Speaker::Agent => "Agent",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub silence: Option<SilenceReport>,
}

impl TranscriptEntry {
    pub fn user(text: impl Into<String>, silence: Option<SilenceReport>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
            silence,
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Agent,
            text: text.into(),
            silence: None,
        }
    }

    /// Pause statistics line; only user utterances carry one.
    pub fn silence_summary(&self) -> Option<String> {
        match (&self.silence, self.speaker) {
            (Some(report), Speaker::User) => Some(format_silence(report)),
            _ => None,
        }
    }
}

/// `⏱ 3.2s · longest mid-pause: 0.8s · 2 pauses · end silence: 1.5s · transcribe: 0.4s`
pub fn format_silence(report: &SilenceReport) -> String {
    let mut parts = vec![format!("⏱ {}s", report.audio_duration)];

    if report.max_gap > 0.0 {
        parts.push(format!("longest mid-pause: {}s", report.max_gap));
        let plural = if report.gap_count == 1 { "" } else { "s" };
        parts.push(format!("{} pause{}", report.gap_count, plural));
    } else {
        parts.push("no mid-pauses".to_string());
    }

    if report.final_silence > 0.0 {
        parts.push(format!("end silence: {}s", report.final_silence));
    }
    if let Some(stt) = report.stt_time {
        parts.push(format!("transcribe: {}s", stt));
    }
    parts.join(" · ")
}

/// Call timer text, `MM:SS`. Minutes keep counting past 99.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Prints call progress to stdout.
#[derive(Default)]
pub struct ConsoleUi {
    call_started: Mutex<Option<Instant>>,
}

impl ConsoleUi {
    fn timer(&self) -> String {
        self.call_started
            .lock()
            .map(|at| format!("[{}] ", format_elapsed(at.elapsed())))
            .unwrap_or_default()
    }
}

impl CallUi for ConsoleUi {
    fn status(&self, text: &str) {
        println!("{}» {}", self.timer(), text);
    }

    fn transcript(&self, entry: TranscriptEntry) {
        println!("{}{}: {}", self.timer(), entry.speaker.label(), entry.text);
        if let Some(summary) = entry.silence_summary() {
            println!("        {}", summary);
        }
    }

    fn call_started(&self) {
        *self.call_started.lock() = Some(Instant::now());
    }

    fn call_ended(&self) {
        if let Some(at) = self.call_started.lock().take() {
            println!("Call ended after {}", format_elapsed(at.elapsed()));
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Call,
    Hangup,
    Vad(f64),
    Url(String),
    Help,
    Quit,
}

pub const CONSOLE_HELP: &str = "commands: call | hangup | vad <seconds> | url <ws(s)://...> | help | quit";

impl ConsoleCommand {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let arg = words.next();

        let command = match (verb.to_ascii_lowercase().as_str(), arg) {
            ("call" | "c", None) => ConsoleCommand::Call,
            ("hangup" | "h", None) => ConsoleCommand::Hangup,
            ("vad", Some(value)) => value
                .parse()
                .map(ConsoleCommand::Vad)
                .map_err(|_| format!("not a number: {}", value))?,
            ("vad", None) => return Err("usage: vad <seconds>".to_string()),
            ("url", Some(url)) => ConsoleCommand::Url(url.to_string()),
            ("url", None) => return Err("usage: url <ws(s)://host/path>".to_string()),
            ("help" | "?", None) => ConsoleCommand::Help,
            ("quit" | "exit" | "q", None) => ConsoleCommand::Quit,
            _ => return Err(format!("unknown command '{}'", line.trim())),
        };
        if words.next().is_some() {
            return Err(format!("unexpected arguments in '{}'", line.trim()));
        }
        Ok(Some(command))
    }
}

/// Reads console commands from stdin until EOF, which is reported as `Quit`.
pub async fn run_console_input(tx: mpsc::UnboundedSender<ConsoleCommand>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => {
                if tx.send(command).is_err() {
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(e) => eprintln!("{} ({})", e, CONSOLE_HELP),
        }
    }
    let _ = tx.send(ConsoleCommand::Quit);
    Ok(())
}
