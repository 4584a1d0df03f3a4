//! Call orchestrator: owns the call state machine and wires microphone,
//! speaker and network link together for the lifetime of one call.
//!
//! `Idle → Connecting → Active → Ending → Idle`
//!
//! Everything that mutates call state runs on the controller task. Device
//! threads and the link task only ever post [`CallEvent`]s to it, and every
//! call gets a fresh event channel, so a late event from a torn-down call
//! can never reach the next one.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::audio::{
    AudioConfig, AudioFrame, CaptureBackend, CaptureStream, FaultHandler, MicPermission, PlaybackBackend,
    PlaybackStream,
};
use crate::error::{CallError, Result};
use crate::gui_bridge::{CallUi, TranscriptEntry};
use crate::net_link::{LinkCommands, LinkError, LinkSender, NetEvent, NetLink, link_channel, parse_destination};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::settings::SettingsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Active,
    Ending,
}

/// Everything the controller task reacts to during a call.
#[derive(Debug)]
pub enum CallEvent {
    Net(NetEvent),
    /// Steady-state capture or playback failure
    DeviceFault(String),
}

impl From<NetEvent> for CallEvent {
    fn from(event: NetEvent) -> Self {
        CallEvent::Net(event)
    }
}

/// The network side of a call, as the controller sees it.
pub trait Transport: Send {
    fn connect(&mut self, url: &str, commands: LinkCommands, events: mpsc::UnboundedSender<CallEvent>) -> Result<()>;
    fn close(&mut self);
}

impl Transport for NetLink {
    fn connect(&mut self, url: &str, commands: LinkCommands, events: mpsc::UnboundedSender<CallEvent>) -> Result<()> {
        NetLink::connect(self, url, commands, events)
    }

    fn close(&mut self) {
        NetLink::close(self);
    }
}

/// Builds a fresh transport for every call.
pub type TransportFactory = Box<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

/// Collaborators the controller needs. Devices are opened per call.
pub struct CallDeps {
    pub audio: AudioConfig,
    pub capture_backend: Arc<dyn CaptureBackend>,
    pub playback_backend: Arc<dyn PlaybackBackend>,
    pub permission: Arc<dyn MicPermission>,
    pub settings: Arc<dyn SettingsStore>,
    pub ui: Arc<dyn CallUi>,
    pub transport: TransportFactory,
    /// IANA zone sent in the `connect` message
    pub timezone: String,
}

#[derive(Debug)]
enum Command {
    StartCall,
    Hangup,
    UpdateVad(f64),
    Shutdown,
}

/// Cloneable remote control for a running [`CallController`].
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CallState>,
}

impl CallHandle {
    pub fn start_call(&self) {
        self.send(Command::StartCall);
    }

    pub fn hangup(&self) {
        self.send(Command::Hangup);
    }

    pub fn update_vad(&self, seconds: f64) {
        self.send(Command::UpdateVad(seconds));
    }

    /// End any call and stop the controller task.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Wait until the call reaches `state`. False if the controller is gone.
    pub async fn wait_for(&mut self, state: CallState) -> bool {
        self.state.wait_for(|s| *s == state).await.is_ok()
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            log::warn!("Call controller has stopped");
        }
    }
}

/// Resources of the call in progress, in acquisition order.
struct ActiveCall {
    playback: Arc<PlaybackStream>,
    capture: Arc<CaptureStream>,
    transport: Box<dyn Transport>,
    sender: LinkSender,
    events: mpsc::UnboundedReceiver<CallEvent>,
}

pub struct CallController {
    deps: CallDeps,
    state: CallState,
    state_tx: watch::Sender<CallState>,
    call: Option<ActiveCall>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl CallController {
    pub fn new(deps: CallDeps) -> (Self, CallHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(CallState::Idle);
        let controller = Self {
            deps,
            state: CallState::Idle,
            state_tx,
            call: None,
            commands,
        };
        (controller, CallHandle { tx, state })
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::StartCall) => self.start_call(),
                    Some(Command::Hangup) => self.hangup().await,
                    Some(Command::UpdateVad(seconds)) => self.update_vad(seconds),
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = next_event(&mut self.call) => self.handle_event(event).await,
            }
        }
        self.end_call(None).await;
        log::info!("Call controller stopped");
    }

    fn set_state(&mut self, next: CallState) {
        log::info!("Call state: {:?} -> {:?}", self.state, next);
        self.state = next;
        let _ = self.state_tx.send(next);
    }

    fn start_call(&mut self) {
        if self.state != CallState::Idle {
            log::warn!("Call already in progress ({:?}), ignoring start", self.state);
            return;
        }

        // Preconditions first: nothing is allocated for a call that cannot start.
        let url = self.deps.settings.server_url();
        if let Err(e) = parse_destination(&url) {
            self.report_error(&e);
            return;
        }
        if !self.deps.permission.is_granted() {
            self.report_error(&CallError::PermissionDenied);
            return;
        }

        self.set_state(CallState::Connecting);
        self.deps.ui.status("Connecting");

        match self.open_call(&url) {
            Ok(call) => self.call = Some(call),
            Err(e) => {
                self.set_state(CallState::Idle);
                self.report_error(&e);
            }
        }
    }

    /// Player, then capturer, then transport. Capture is created here but
    /// only started once the channel is open.
    fn open_call(&self, url: &str) -> Result<ActiveCall> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let on_fault: FaultHandler = {
            let events_tx = events_tx.clone();
            Arc::new(move |msg: String| {
                let _ = events_tx.send(CallEvent::DeviceFault(msg));
            })
        };

        let playback = Arc::new(
            PlaybackStream::new(self.deps.audio.clone(), self.deps.playback_backend.clone())
                .on_fault(on_fault.clone()),
        );
        playback.try_start()?;

        let (sender, commands) = link_channel();
        let capture = {
            let sender = sender.clone();
            CaptureStream::new(
                self.deps.audio.clone(),
                self.deps.capture_backend.clone(),
                self.deps.permission.clone(),
                Arc::new(move |frame: AudioFrame| sender.send_binary(frame)),
            )
            .on_fault(on_fault)
            .suppress_while(Arc::new(playback.activity()))
        };

        let mut transport = (self.deps.transport)();
        if let Err(e) = transport.connect(url, commands, events_tx) {
            playback.stop();
            return Err(e);
        }

        Ok(ActiveCall {
            playback,
            capture: Arc::new(capture),
            transport,
            sender,
            events,
        })
    }

    async fn handle_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::Net(NetEvent::Opened) => self.on_open().await,
            CallEvent::Net(NetEvent::Text(message)) => self.handle_control(message),
            CallEvent::Net(NetEvent::Binary(data)) => {
                if let (CallState::Active, Some(call)) = (self.state, &self.call) {
                    call.playback.queue_audio(AudioFrame::from_bytes(data));
                }
            }
            CallEvent::Net(NetEvent::Error(error @ LinkError::Malformed(_))) => {
                let e = CallError::from(error);
                log::warn!("{}", e);
                self.deps.ui.transcript(TranscriptEntry::agent(format!("⚠️ {}", e)));
            }
            CallEvent::Net(NetEvent::Error(error @ LinkError::Failed(_))) => {
                self.end_call(Some(error.into())).await;
            }
            CallEvent::Net(NetEvent::Closed) => {
                log::info!("Server closed the call");
                self.end_call(None).await;
            }
            CallEvent::DeviceFault(msg) => self.end_call(Some(CallError::Device(msg))).await,
        }
    }

    async fn on_open(&mut self) {
        if self.state != CallState::Connecting {
            return;
        }
        let Some(call) = &self.call else {
            return;
        };

        call.sender.send_text(&ClientMessage::Connect {
            timezone: self.deps.timezone.clone(),
        });
        call.sender.send_text(&ClientMessage::VadStop {
            value: self.deps.settings.vad_value(),
        });
        let started = call.capture.try_start();

        self.set_state(CallState::Active);
        self.deps.ui.status("Ringing");
        self.deps.ui.call_started();

        if let Err(e) = started {
            self.end_call(Some(e)).await;
        }
    }

    fn handle_control(&self, message: ServerMessage) {
        let ui = &self.deps.ui;
        match message {
            ServerMessage::Connected => ui.status("Ringing"),
            ServerMessage::State { state } => ui.status(&capitalize(&state)),
            ServerMessage::Transcript { text, silence } => ui.transcript(TranscriptEntry::user(text, silence)),
            ServerMessage::ResponseText { text } => ui.transcript(TranscriptEntry::agent(text)),
            ServerMessage::Error { message } => {
                log::warn!("Server error: {}", message);
                ui.transcript(TranscriptEntry::agent(format!("⚠️ {}", message)));
            }
            ServerMessage::Done => log::debug!("Response cycle complete"),
            ServerMessage::Unknown => log::debug!("Ignoring unknown control message"),
        }
    }

    async fn hangup(&mut self) {
        let Some(call) = &self.call else {
            return;
        };
        call.sender.send_text(&ClientMessage::Hangup);
        self.end_call(None).await;
    }

    /// Persist the new threshold, and push it live when a call is active.
    fn update_vad(&mut self, seconds: f64) {
        if let Err(e) = self.deps.settings.set_vad_value(seconds) {
            log::warn!("VAD update rejected: {}", e);
            self.deps.ui.status(&format!("Error: {}", e));
            return;
        }
        if let (CallState::Active, Some(call)) = (self.state, &self.call) {
            call.sender.send_text(&ClientMessage::VadStop { value: seconds });
        }
    }

    /// Tear the call down in reverse acquisition order. A no-op when there
    /// is no call, so racing hangup/close/error paths end it exactly once.
    async fn end_call(&mut self, error: Option<CallError>) {
        let Some(call) = self.call.take() else {
            return;
        };
        let was_active = self.state == CallState::Active;
        self.set_state(CallState::Ending);

        let ActiveCall {
            playback,
            capture,
            mut transport,
            sender: _,
            events,
        } = call;
        drop(events);
        transport.close();

        // Each stop may wait up to the join timeout on a stuck device thread.
        let stopped = tokio::task::spawn_blocking(move || {
            capture.stop();
            playback.stop();
        })
        .await;
        if let Err(e) = stopped {
            log::error!("Device teardown failed: {}", e);
        }

        // Pairs with `call_started`, which only an opened call has seen.
        if was_active {
            self.deps.ui.call_ended();
        }
        self.set_state(CallState::Idle);
        match error {
            Some(e) => self.report_error(&e),
            None => self.deps.ui.status("Ready"),
        }
    }

    fn report_error(&self, e: &CallError) {
        log::error!("Call error: {}", e);
        self.deps.ui.status(&format!("Error: {}", e));
    }
}

async fn next_event(call: &mut Option<ActiveCall>) -> Option<CallEvent> {
    match call {
        Some(call) => call.events.recv().await,
        None => std::future::pending().await,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
