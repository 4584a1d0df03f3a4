//! voicecall - full-duplex voice client for a remote conversational agent
//!
//! ```text
//! microphone → CaptureStream → [suppression gate] → NetLink → agent
//! speaker    ← PlaybackStream ← queue             ← NetLink ← agent
//!                     │                                ▲
//!                     └── is-speaking ─────────────────┘ (gate)
//! ```
//!
//! The [`controller::CallController`] owns the call lifecycle and is the
//! only place call state changes.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod gui_bridge;
pub mod net_link;
pub mod protocol;
pub mod settings;
pub mod timezone;

pub use config::Config;
pub use controller::{CallController, CallDeps, CallHandle, CallState};
pub use error::{CallError, Result};
