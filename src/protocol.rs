//! Control messages exchanged with the agent over the text channel.
//!
//! Every message is a JSON object tagged by `type`. Binary frames carry raw
//! PCM and never pass through here.

use serde::{Deserialize, Serialize};

/// Client → server.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Sent once when the channel opens
    Connect { timezone: String },
    /// Live update of the server's end-of-speech silence threshold, in seconds
    VadStop { value: f64 },
    /// Ask the server to end the call gracefully
    Hangup,
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        // A tagged enum of strings and finite numbers always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server → client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected,
    /// UI status hint: listening, transcribing, thinking, speaking, ...
    State {
        #[serde(default)]
        state: String,
    },
    /// The user's utterance as transcribed by the server
    Transcript {
        #[serde(default)]
        text: String,
        #[serde(default)]
        silence: Option<SilenceReport>,
    },
    ResponseText {
        #[serde(default)]
        text: String,
    },
    /// Non-fatal server-side error
    Error {
        #[serde(default)]
        message: String,
    },
    Done,
    /// Any type this client does not know; ignored
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Pause statistics attached to a transcript. All values in seconds.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SilenceReport {
    pub audio_duration: f64,
    pub max_gap: f64,
    pub gap_count: u32,
    pub final_silence: f64,
    /// Only present when the server timed its speech-to-text pass
    pub stt_time: Option<f64>,
}
