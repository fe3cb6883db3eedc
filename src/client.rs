use rand::Rng;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::registry::ClientRegistry;
use crate::tunnel::{
    encode, method, Arg, CodecError, FrameDecoder, Message, ProxiedRequest, ProxiedResponse,
    ProxyKind, DEFAULT_MAX_FRAME_SIZE,
};

/// Length of generated identifiers
pub const ID_LENGTH: usize = 20;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz1234567890";

const READ_CHUNK: usize = 8 * 1024;

/// Generate a random subdomain identifier
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LENGTH)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Whether `label` can be routed as a subdomain
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("tunnel client disconnected")]
    Disconnected,

    #[error("tunnel client did not respond within {0:?}")]
    Timeout(Duration),
}

/// Registration and addressing policy shared by every tunnel client
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Hostname suffix clients are exposed under
    pub host: String,
    pub custom_ids: bool,
    /// Empty disables the password check
    pub password: String,
    pub tls: bool,
    /// Port advertised in `net/notify` URLs
    pub public_port: u16,
    pub max_frame_size: usize,
}

impl TunnelSettings {
    /// URL a client with identifier `id` is reachable at
    pub fn public_url(&self, id: &str) -> String {
        let (scheme, default_port) = if self.tls {
            ("https", 443)
        } else {
            ("http", 80)
        };
        if self.public_port == default_port {
            format!("{}://{}.{}", scheme, id, self.host)
        } else {
            format!("{}://{}.{}:{}", scheme, id, self.host, self.public_port)
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            host: "test.loc".to_string(),
            custom_ids: false,
            password: String::new(),
            tls: false,
            public_port: 4444,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Registry-side view of a registered tunnel client.
///
/// Carries the outbound request slot and the inbound response slot. Round
/// trips are serialized: the response receiver is held for the whole
/// exchange, so at most one request is in flight per client.
pub struct TunnelHandle {
    id: String,
    requests: mpsc::Sender<ProxiedRequest>,
    responses: Mutex<mpsc::Receiver<ProxiedResponse>>,
    registered_at: SystemTime,
}

impl TunnelHandle {
    fn new(
        id: String,
        requests: mpsc::Sender<ProxiedRequest>,
        responses: mpsc::Receiver<ProxiedResponse>,
    ) -> Self {
        Self {
            id,
            requests,
            responses: Mutex::new(responses),
            registered_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registered_at(&self) -> SystemTime {
        self.registered_at
    }

    /// Send one request to the remote peer and wait for its response.
    ///
    /// `timeout` of `None` waits until the client answers or disconnects.
    pub async fn exchange(
        &self,
        request: ProxiedRequest,
        timeout: Option<Duration>,
    ) -> Result<ProxiedResponse, ExchangeError> {
        let mut responses = self.responses.lock().await;

        // leftovers from an exchange that timed out
        while let Ok(stale) = responses.try_recv() {
            warn!(
                "Discarding stale {} response from {} ({} bytes)",
                stale.kind,
                self.id,
                stale.payload.len()
            );
        }

        let requests = self.requests.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            if requests.send(request).await.is_err() {
                debug!("Writer for {} is gone, request dropped", id);
            }
        });

        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, responses.recv())
                .await
                .map_err(|_| ExchangeError::Timeout(limit))?,
            None => responses.recv().await,
        };
        received.ok_or(ExchangeError::Disconnected)
    }

    #[cfg(test)]
    pub(crate) fn detached(id: &str) -> Self {
        let (requests, _) = mpsc::channel(1);
        let (_, responses) = mpsc::channel(1);
        Self::new(id.to_string(), requests, responses)
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

enum State<W> {
    /// Accepted, waiting for `net/register`. The reader still owns the
    /// write half so it can reject the peer.
    Connected { writer: W },
    Registered {
        handle: Arc<TunnelHandle>,
        responses: mpsc::Sender<ProxiedResponse>,
        close: oneshot::Sender<()>,
    },
    Closed,
}

/// One accepted control connection
pub struct TunnelClient<S> {
    id: String,
    stream: S,
    registry: ClientRegistry,
    settings: Arc<TunnelSettings>,
}

impl<S> TunnelClient<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, registry: ClientRegistry, settings: Arc<TunnelSettings>) -> Self {
        Self {
            id: generate_id(),
            stream,
            registry,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reader task. Runs until the connection drops or the peer fails
    /// authentication, then removes the client from the registry.
    pub async fn run(self) {
        let (mut reader, writer) = tokio::io::split(self.stream);
        let mut session = Session {
            id: self.id,
            registry: self.registry,
            settings: self.settings,
            state: State::Connected { writer },
        };
        info!("Reading task created for {}", session.id);

        let mut decoder = FrameDecoder::new(session.settings.max_frame_size);
        let mut buf = vec![0u8; READ_CHUNK];

        'read: loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    info!(
                        "Reading task for {} destroyed: connection closed",
                        session.id
                    );
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Reading task for {} destroyed: {}", session.id, e);
                    break;
                }
            };

            decoder.extend(&buf[..n]);
            while let Some(frame) = decoder.next_frame() {
                let message = match frame {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Dropping control frame from {}: {}", session.id, e);
                        continue;
                    }
                };
                if session.handle(message).await.is_break() {
                    break 'read;
                }
            }
        }

        session.close().await;
    }
}

struct Session<W> {
    id: String,
    registry: ClientRegistry,
    settings: Arc<TunnelSettings>,
    state: State<W>,
}

impl<W> Session<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn handle(&mut self, message: Message) -> ControlFlow<()> {
        debug!(
            "RPC {} from {} ({} args)",
            message.method,
            self.id,
            message.args.len()
        );

        if message.method == method::REGISTER {
            return self.register(message).await;
        }

        match ProxyKind::from_response_method(&message.method) {
            Some(kind) => self.deliver(kind, message).await,
            None => debug!("Ignoring {} from {}", message.method, self.id),
        }
        ControlFlow::Continue(())
    }

    async fn register(&mut self, message: Message) -> ControlFlow<()> {
        let mut writer = match std::mem::replace(&mut self.state, State::Closed) {
            State::Connected { writer } => writer,
            registered => {
                self.state = registered;
                warn!("Ignoring repeated registration from {}", self.id);
                return ControlFlow::Continue(());
            }
        };

        if !self.settings.password.is_empty() {
            let supplied = message.arg(1).map(Arg::as_bytes);
            if supplied != Some(self.settings.password.as_bytes()) {
                let reason = match supplied {
                    Some(_) => "Password mismatch",
                    None => "Password required",
                };
                warn!("Rejecting {}: {}", self.id, reason);
                if let Err(e) = reject(&mut writer, reason).await {
                    debug!("Failed to deliver rejection to {}: {}", self.id, e);
                }
                return ControlFlow::Break(());
            }
        }

        let requested = message.arg(0).and_then(Arg::as_str).unwrap_or_default();
        let custom = if requested.is_empty() {
            None
        } else if !self.settings.custom_ids {
            warn!(
                "Custom IDs are disabled, {} keeps its generated ID",
                self.id
            );
            None
        } else if !is_valid_label(requested) {
            warn!("Custom ID request rejected for {}: invalid label", self.id);
            None
        } else {
            Some(requested)
        };

        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (responses_tx, responses_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = oneshot::channel();

        let (id, handle) = self
            .registry
            .claim(custom, &self.id, move |id| {
                Arc::new(TunnelHandle::new(id.to_string(), requests_tx, responses_rx))
            })
            .await;
        self.id = id;
        info!("Registered a client: {}", self.id);

        let url = self.settings.public_url(&self.id);
        tokio::spawn(run_writer(
            self.id.clone(),
            url,
            writer,
            requests_rx,
            close_rx,
        ));

        self.state = State::Registered {
            handle,
            responses: responses_tx,
            close: close_tx,
        };
        ControlFlow::Continue(())
    }

    async fn deliver(&mut self, kind: ProxyKind, message: Message) {
        let State::Registered { responses, .. } = &self.state else {
            warn!("Ignoring {} response from unregistered {}", kind, self.id);
            return;
        };

        let payload = message
            .args
            .into_iter()
            .next()
            .map(Arg::into_bytes)
            .unwrap_or_default();
        debug!(
            "{} response from {} ({} bytes)",
            kind,
            self.id,
            payload.len()
        );

        // blocks until the dispatcher takes the slot
        let response = ProxiedResponse {
            kind,
            payload: payload.into(),
        };
        if responses.send(response).await.is_err() {
            debug!("No dispatcher waiting on {}, response dropped", self.id);
        }
    }

    async fn close(&mut self) {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Registered { handle, close, .. } => {
                if self.registry.remove_client(&self.id, &handle).await {
                    info!("Unregistered client {}", self.id);
                }
                let _ = close.send(());
            }
            State::Connected { mut writer } => {
                let _ = writer.shutdown().await;
            }
            State::Closed => {}
        }
    }
}

async fn send_message<W>(writer: &mut W, message: &Message) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn reject<W>(writer: &mut W, reason: &str) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin,
{
    send_message(writer, &Message::server(method::AUTH_REJECT, [reason])).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Writer task. Announces the identifier, then forwards requests until
/// the reader signals close.
async fn run_writer<W>(
    id: String,
    url: String,
    mut writer: W,
    mut requests: mpsc::Receiver<ProxiedRequest>,
    mut close: oneshot::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    info!("Writing task created for {}", id);

    let notify = Message::server(method::NOTIFY, [id.as_str(), url.as_str()]);
    match send_message(&mut writer, &notify).await {
        Ok(()) => info!("Notified {} of {}", id, url),
        Err(e) => warn!("Failed to notify {}: {}", id, e),
    }

    loop {
        tokio::select! {
            Some(request) = requests.recv() => {
                let kind = request.kind;
                let size = request.payload.len();
                match send_message(&mut writer, &request.into_message()).await {
                    Ok(()) => debug!("{} request to {} ({} bytes)", kind, id, size),
                    Err(e) => warn!("Failed to forward {} request to {}: {}", kind, id, e),
                }
            }
            _ = &mut close => break,
        }
    }

    let _ = writer.shutdown().await;
    info!("Writing task destroyed for {}", id);
}
