//! WebSocket link to the agent.
//!
//! One tokio task per connection owns the socket. The owner talks to it
//! through a [`LinkSender`] (outgoing text/binary) and hears back through
//! [`NetEvent`]s on a channel of its choosing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{Connector, connect_async_tls_with_config};
use url::Url;

use crate::audio::AudioFrame;
use crate::error::{CallError, Result};
use crate::protocol::{ClientMessage, ServerMessage};

/// How long a closing link waits for the peer's close frame before the task
/// is abandoned.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// A text payload could not be parsed; the link stays open
    #[error("Parse error: {0}")]
    Malformed(String),
    /// The link is gone; a `Closed` event follows
    #[error("{0}")]
    Failed(String),
}

impl From<LinkError> for CallError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Malformed(msg) => CallError::MalformedMessage(msg),
            LinkError::Failed(msg) => CallError::Transport(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    Opened,
    Text(ServerMessage),
    Binary(Bytes),
    /// Emitted exactly once per connect, after any `Error(Failed)`
    Closed,
    Error(LinkError),
}

#[derive(Debug)]
pub enum NetCommand {
    SendText(String),
    SendBinary(Bytes),
}

/// Server certificate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Validate against the Mozilla root store
    Verify,
    /// Accept any certificate, including self-signed ones. The channel is
    /// still encrypted but the server is not authenticated.
    AcceptInvalidCerts,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Keepalive ping period; a ping left unanswered for a whole period
    /// fails the link
    pub ping_interval: Duration,
    pub tls: TlsPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            tls: TlsPolicy::Verify,
        }
    }
}

/// Create the outgoing queue of one connection: the cloneable sending half
/// and the half the link task drains.
pub fn link_channel() -> (LinkSender, LinkCommands) {
    let (tx, rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(false));
    (
        LinkSender {
            tx,
            open: open.clone(),
        },
        LinkCommands { rx, open },
    )
}

/// Best-effort sender. While the link is not open every send is dropped
/// silently.
#[derive(Clone)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<NetCommand>,
    open: Arc<AtomicBool>,
}

impl LinkSender {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn send_text(&self, message: &ClientMessage) {
        if self.is_open() {
            let _ = self.tx.send(NetCommand::SendText(message.to_json()));
        } else {
            log::debug!("Link not open, dropping {:?}", message);
        }
    }

    pub fn send_binary(&self, frame: AudioFrame) {
        if self.is_open() {
            let _ = self.tx.send(NetCommand::SendBinary(frame.into_bytes()));
        }
    }
}

/// Receiving half of [`link_channel`], consumed by the link task.
pub struct LinkCommands {
    rx: mpsc::UnboundedReceiver<NetCommand>,
    open: Arc<AtomicBool>,
}

impl LinkCommands {
    /// Mark the link open or closed for every [`LinkSender`] clone.
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub async fn recv(&mut self) -> Option<NetCommand> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<NetCommand> {
        self.rx.try_recv().ok()
    }
}

/// Validate a destination address. Only `ws://` and `wss://` with a host
/// are accepted.
pub fn parse_destination(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CallError::NotConfigured);
    }
    let invalid = |reason: String| CallError::InvalidDestination {
        url: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(invalid(format!("unsupported scheme '{}', expected ws or wss", url.scheme())));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

pub struct NetLink {
    config: LinkConfig,
    runtime: Handle,
    session: Option<LinkSession>,
}

struct LinkSession {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl NetLink {
    pub fn new(config: LinkConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            session: None,
        }
    }

    /// Start connecting in the background. Progress arrives as events:
    /// `Opened` on success, or `Error(Failed)` then `Closed`.
    ///
    /// Fails synchronously only for a bad destination or when this link is
    /// already in use.
    pub fn connect<E>(&mut self, url: &str, commands: LinkCommands, events: mpsc::UnboundedSender<E>) -> Result<()>
    where
        E: From<NetEvent> + Send + 'static,
    {
        if self.session.is_some() {
            return Err(CallError::AlreadyActive("network link"));
        }
        let url = parse_destination(url)?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = LinkTask {
            url,
            config: self.config.clone(),
            commands,
            shutdown: shutdown_rx,
            events,
        };
        let task = self.runtime.spawn(task.run());
        self.session = Some(LinkSession { shutdown, task });
        Ok(())
    }

    /// Start a graceful close and release the link. Returns immediately;
    /// the task is aborted if the peer does not finish the handshake in
    /// time. Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(LinkSession { shutdown, mut task }) = self.session.take() else {
            return;
        };
        let _ = shutdown.send(());
        self.runtime.spawn(async move {
            let grace = CLOSE_GRACE * 2;
            if timeout(grace, &mut task).await.is_err() {
                log::warn!("Link task did not finish within {:?}, aborting", grace);
                task.abort();
            }
        });
    }
}

impl Drop for NetLink {
    fn drop(&mut self) {
        self.close();
    }
}

struct LinkTask<E> {
    url: Url,
    config: LinkConfig,
    commands: LinkCommands,
    shutdown: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<E>,
}

impl<E: From<NetEvent>> LinkTask<E> {
    fn emit(&self, event: NetEvent) {
        let _ = self.events.send(E::from(event));
    }

    async fn run(mut self) {
        if let Err(e) = self.connect_and_loop().await {
            log::error!("Link to {} failed: {:#}", self.url, e);
            self.emit(NetEvent::Error(LinkError::Failed(format!("{:#}", e))));
        }
        self.commands.set_open(false);
        log::info!("Link to {} closed", self.url);
        self.emit(NetEvent::Closed);
    }

    async fn connect_and_loop(&mut self) -> anyhow::Result<()> {
        let connector = tls_connector(self.config.tls)?;
        log::info!("Connecting to {}...", self.url);

        let connecting = timeout(
            self.config.connect_timeout,
            connect_async_tls_with_config(self.url.as_str(), None, true, Some(connector)),
        );
        let ws_stream = tokio::select! {
            result = connecting => {
                let (ws_stream, _) = result
                    .map_err(|_| anyhow!("connect timed out after {:?}", self.config.connect_timeout))?
                    .with_context(|| format!("Failed to connect to {}", self.url))?;
                ws_stream
            }
            _ = &mut self.shutdown => {
                log::info!("Link closed while connecting");
                return Ok(());
            }
        };
        log::info!("Connected!");

        let (mut write, mut read) = ws_stream.split();
        self.commands.set_open(true);
        self.emit(NetEvent::Opened);

        let ping_period = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text) {
                        Ok(message) => {
                            log::debug!("Received: {:?}", message);
                            self.emit(NetEvent::Text(message));
                        }
                        Err(e) => {
                            log::warn!("Unparseable text message: {} ({})", e, text);
                            self.emit(NetEvent::Error(LinkError::Malformed(e.to_string())));
                        }
                    },
                    Some(Ok(Message::Binary(data))) => self.emit(NetEvent::Binary(data)),
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => bail!("connection dropped by peer"),
                },
                cmd = self.commands.recv() => match cmd {
                    Some(NetCommand::SendText(text)) => {
                        send_with_timeout(&mut write, Message::Text(text.into()), self.config.write_timeout).await?;
                    }
                    Some(NetCommand::SendBinary(data)) => {
                        send_with_timeout(&mut write, Message::Binary(data), self.config.write_timeout).await?;
                    }
                    // Every sender is gone: nobody can use this link any more.
                    None => break,
                },
                _ = ping.tick() => {
                    if awaiting_pong {
                        bail!("no pong from server within {:?}", ping_period);
                    }
                    send_with_timeout(&mut write, Message::Ping(Bytes::new()), self.config.write_timeout).await?;
                    awaiting_pong = true;
                }
                _ = &mut self.shutdown => break,
            }
        }

        // Local close: flush what was queued before the close, then send our
        // close frame and give the peer a moment to answer.
        self.commands.set_open(false);
        while let Some(cmd) = self.commands.try_recv() {
            let msg = match cmd {
                NetCommand::SendText(text) => Message::Text(text.into()),
                NetCommand::SendBinary(data) => Message::Binary(data),
            };
            if let Err(e) = send_with_timeout(&mut write, msg, self.config.write_timeout).await {
                log::debug!("Queued message not sent on close: {:#}", e);
                return Ok(());
            }
        }
        if let Err(e) = send_with_timeout(&mut write, Message::Close(None), CLOSE_GRACE).await {
            log::debug!("Close frame not sent: {:#}", e);
            return Ok(());
        }
        let _ = timeout(CLOSE_GRACE, async {
            while let Some(Ok(msg)) = read.next().await {
                if msg.is_close() {
                    break;
                }
            }
        })
        .await;
        Ok(())
    }
}

async fn send_with_timeout<S>(sink: &mut S, msg: Message, limit: Duration) -> anyhow::Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    timeout(limit, sink.send(msg))
        .await
        .map_err(|_| anyhow!("write timed out after {:?}", limit))??;
    Ok(())
}

fn tls_connector(policy: TlsPolicy) -> anyhow::Result<Connector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?;

    let config = match policy {
        TlsPolicy::Verify => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsPolicy::AcceptInvalidCerts => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth(),
    };
    Ok(Connector::Rustls(Arc::new(config)))
}

/// Skips chain and hostname validation. Handshake signatures are still
/// checked, so the peer must hold the key of the certificate it presents.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_must_be_configured() {
        assert!(matches!(parse_destination(""), Err(CallError::NotConfigured)));
        assert!(matches!(parse_destination("   "), Err(CallError::NotConfigured)));
    }

    #[test]
    fn destination_must_be_a_websocket_url() {
        assert!(matches!(
            parse_destination("https://example.com/ws"),
            Err(CallError::InvalidDestination { .. })
        ));
        assert!(matches!(
            parse_destination("not a url"),
            Err(CallError::InvalidDestination { .. })
        ));
        assert_eq!(
            parse_destination(" wss://agent.example.com:8443/call ").unwrap().as_str(),
            "wss://agent.example.com:8443/call"
        );
    }

    #[test]
    fn sender_drops_everything_until_open() {
        let (sender, mut commands) = link_channel();
        sender.send_text(&ClientMessage::Hangup);
        sender.send_binary(AudioFrame::from_samples(&[1, 2]));
        assert!(commands.try_recv().is_none());

        commands.set_open(true);
        sender.send_text(&ClientMessage::Hangup);
        sender.send_binary(AudioFrame::from_samples(&[1, 2]));
        assert!(matches!(commands.try_recv(), Some(NetCommand::SendText(t)) if t == r#"{"type":"hangup"}"#));
        assert!(matches!(commands.try_recv(), Some(NetCommand::SendBinary(b)) if b.len() == 4));

        commands.set_open(false);
        sender.send_text(&ClientMessage::Hangup);
        assert!(commands.try_recv().is_none());
    }

    #[test]
    fn both_tls_policies_build_a_connector() {
        assert!(tls_connector(TlsPolicy::Verify).is_ok());
        assert!(tls_connector(TlsPolicy::AcceptInvalidCerts).is_ok());
    }

    #[test]
    fn link_errors_map_onto_the_call_taxonomy() {
        let malformed: CallError = LinkError::Malformed("eof".into()).into();
        assert!(!malformed.is_fatal());
        let failed: CallError = LinkError::Failed("reset".into()).into();
        assert!(failed.is_fatal());
        assert_eq!(LinkError::Malformed("eof".into()).to_string(), "Parse error: eof");
    }
}
