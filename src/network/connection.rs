//! One multiplexed connection to one broker.
//!
//! A [`Connection`] owns the socket through two background tasks. The
//! writer drains a queue of encoded frames, so concurrent senders never
//! interleave partial frames. The reader reassembles response frames and
//! completes the pending slot registered under the frame's correlation ID.
//!
//! Correlation IDs are assigned and frames are queued under the same lock,
//! which makes the order of IDs the order of bytes on the wire. Brokers
//! answer in request order, and the reader completes slots in the order
//! responses arrive.
//!
//! Any failure of the socket, or an explicit [`Connection::close`], moves
//! the connection into a terminal state and fails every outstanding
//! [`PendingResponse`] with [`Error::ConnectionClosed`]. A terminal
//! connection is never revived: callers open a new one.
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::instrument;

use crate::{
    codec::{self, FrameDecoder, ResponseFrame},
    config::{BrokerEndpoint, ClientConfig},
    error::{Error, NegotiationError, Result},
    protocol::{
        HeaderRequest, KafkaRequest, SaslAuthenticateRequest, SaslAuthenticateResponse,
        SaslHandshakeRequest, SaslHandshakeResponse,
    },
};

use super::sasl::{Negotiator, SaslTransport};
use super::{tcp, tls};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// SASL negotiation is running; only its own requests may be sent.
    Authenticating,
    Ready,
    /// The socket failed or the broker sent something undecodable.
    Failed,
    /// Closed by the application.
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

type Slot = oneshot::Sender<Result<Bytes>>;

struct Shared {
    state: ConnectionState,
    next_correlation_id: i32,
    pending: BTreeMap<i32, Slot>,
    /// IDs whose handle was dropped before the response arrived.
    abandoned: HashSet<i32>,
    writer: mpsc::UnboundedSender<Bytes>,
    shutdown: watch::Sender<bool>,
    session_deadline: Option<Instant>,
}

impl Shared {
    /// Next non-negative ID that no outstanding or abandoned request holds.
    fn allocate_correlation_id(&mut self) -> i32 {
        loop {
            let id = self.next_correlation_id;
            self.next_correlation_id = if id == i32::MAX { 0 } else { id + 1 };
            if !self.pending.contains_key(&id) && !self.abandoned.contains(&id) {
                return id;
            }
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Move into `state` and fail everything outstanding. No-op when already terminal.
fn teardown(shared: &Mutex<Shared>, state: ConnectionState) {
    let pending = {
        let mut shared = lock(shared);
        if shared.state.is_terminal() {
            return;
        }
        shared.state = state;
        shared.abandoned.clear();
        shared.session_deadline = None;
        shared.shutdown.send_replace(true);
        std::mem::take(&mut shared.pending)
    };
    tracing::debug!(
        "Connection now {:?}, failing {} pending requests",
        state,
        pending.len()
    );
    for (_, slot) in pending {
        let _ = slot.send(Err(Error::ConnectionClosed));
    }
}

/// Hand a response frame to the request waiting for it.
fn dispatch(shared: &Mutex<Shared>, frame: Bytes) -> Result<()> {
    let ResponseFrame {
        correlation_id,
        body,
    } = codec::decode_response(frame)?;
    let mut guard = lock(shared);
    if let Some(slot) = guard.pending.remove(&correlation_id) {
        drop(guard);
        tracing::trace!("Response for correlation id {}", correlation_id);
        // the handle may have been dropped just now
        let _ = slot.send(Ok(body));
        return Ok(());
    }
    if guard.abandoned.remove(&correlation_id) {
        tracing::debug!("Discarding late response for correlation id {}", correlation_id);
        return Ok(());
    }
    Err(Error::Framing(format!(
        "response for unknown correlation id {}",
        correlation_id
    )))
}

async fn read_frames<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    shared: &Mutex<Shared>,
) -> Result<()> {
    loop {
        while let Some(frame) = decoder.decode()? {
            dispatch(shared, frame)?;
        }
        decoder.buffer_mut().reserve(READ_CHUNK);
        if reader.read_buf(decoder.buffer_mut()).await? == 0 {
            decoder.finish()?;
            return Err(Error::ConnectionClosed);
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frames: &mut mpsc::UnboundedReceiver<Bytes>,
) -> Result<()> {
    while let Some(frame) = frames.recv().await {
        writer.write_all(&frame).await?;
        // coalesce whatever queued up meanwhile into one flush
        while let Ok(frame) = frames.try_recv() {
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
    }
    Ok(())
}

struct Inner {
    endpoint: BrokerEndpoint,
    client_id: String,
    max_frame_size: usize,
    request_timeout: Duration,
    shared: Arc<Mutex<Shared>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        teardown(&self.shared, ConnectionState::Closed);
    }
}

/// Cheaply cloneable handle to one broker connection.
///
/// The socket is released when [`close`](Connection::close) is called, when
/// it fails, or when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Connect, set up TLS when the endpoint uses `SASL_SSL`, then
    /// authenticate when it uses SASL.
    #[instrument(name = "connection-open", level = "debug", skip(config), fields(endpoint = %endpoint))]
    pub async fn open(endpoint: &BrokerEndpoint, config: &ClientConfig) -> Result<Connection> {
        let stream = tcp::connect_tcp(endpoint, config.connect_timeout).await?;
        if endpoint.security_protocol.uses_tls() {
            let stream = tls::connect_tls(stream, endpoint, &config.security.tls).await?;
            Self::establish(stream, endpoint.clone(), config).await
        } else {
            Self::establish(stream, endpoint.clone(), config).await
        }
    }

    /// Take over `stream` and run SASL on it if `endpoint` demands it.
    ///
    /// The connection is only returned once it is ready for application
    /// requests. On a negotiation failure the stream is closed.
    pub async fn establish<S>(
        stream: S,
        endpoint: BrokerEndpoint,
        config: &ClientConfig,
    ) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if !endpoint.security_protocol.uses_sasl() {
            return Ok(Self::from_stream(stream, endpoint, config));
        }

        let kerberos = config.security.kerberos.clone().ok_or_else(|| {
            Error::Config(format!(
                "{:?} requires Kerberos settings",
                endpoint.security_protocol
            ))
        })?;
        let connection = Self::spawn(stream, endpoint, config, ConnectionState::Authenticating);
        let mut negotiator = Negotiator::new(
            kerberos,
            config.security.provider(),
            &connection.inner.endpoint.host,
        )
        .with_max_rounds(config.sasl_max_rounds);

        let outcome = negotiator
            .run(&mut Handshaking {
                connection: &connection,
            })
            .await
            .and_then(|session| connection.authenticated(session.session_lifetime));
        match outcome {
            Ok(()) => Ok(connection),
            Err(err) => {
                teardown(&connection.inner.shared, ConnectionState::Failed);
                Err(err)
            }
        }
    }

    /// Take over an already usable stream without authenticating.
    pub fn from_stream<S>(stream: S, endpoint: BrokerEndpoint, config: &ClientConfig) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(stream, endpoint, config, ConnectionState::Ready)
    }

    fn spawn<S>(
        stream: S,
        endpoint: BrokerEndpoint,
        config: &ClientConfig,
        state: ConnectionState,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let mut shutdown_read = shutdown_tx.subscribe();
        let mut shutdown_write = shutdown_tx.subscribe();

        let shared = Arc::new(Mutex::new(Shared {
            state,
            next_correlation_id: 0,
            pending: BTreeMap::new(),
            abandoned: HashSet::new(),
            writer: frames_tx,
            shutdown: shutdown_tx,
            session_deadline: None,
        }));

        let read_shared = Arc::clone(&shared);
        let mut decoder = FrameDecoder::new(config.max_frame_size);
        let read_endpoint = endpoint.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = shutdown_read.changed() => Ok(()),
                outcome = read_frames(&mut reader, &mut decoder, &read_shared) => outcome,
            };
            match outcome {
                Ok(()) => {}
                Err(Error::ConnectionClosed) => {
                    tracing::debug!("{} closed the connection", read_endpoint)
                }
                Err(err) => tracing::error!("ERROR: Reading from {} {}", read_endpoint, err),
            }
            teardown(&read_shared, ConnectionState::Failed);
        });

        let write_shared = Arc::clone(&shared);
        let write_endpoint = endpoint.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = shutdown_write.changed() => Ok(()),
                outcome = write_frames(&mut writer, &mut frames_rx) => outcome,
            };
            if let Err(err) = outcome {
                tracing::error!("ERROR: Writing to {} {}", write_endpoint, err);
                teardown(&write_shared, ConnectionState::Failed);
            }
            let _ = writer.shutdown().await;
        });

        tracing::debug!("Connection to {} started in {:?}", endpoint, state);
        Connection {
            inner: Arc::new(Inner {
                endpoint,
                client_id: config.client_id.clone(),
                max_frame_size: config.max_frame_size,
                request_timeout: config.request_timeout,
                shared,
            }),
        }
    }

    fn authenticated(&self, session_lifetime: Option<Duration>) -> Result<()> {
        let mut shared = lock(&self.inner.shared);
        if shared.state != ConnectionState::Authenticating {
            return Err(Error::ConnectionClosed);
        }
        shared.state = ConnectionState::Ready;
        shared.session_deadline = session_lifetime.map(|lifetime| Instant::now() + lifetime);
        Ok(())
    }

    /// Encode `request`, assign it a correlation ID and queue it.
    fn submit<R: KafkaRequest>(
        &self,
        request: &R,
        during_handshake: bool,
        expect_reply: bool,
    ) -> Result<(i32, Option<oneshot::Receiver<Result<Bytes>>>)> {
        let header = HeaderRequest::for_request::<R>(0, &self.inner.client_id);
        let mut frame = codec::encode_request(&header, request, self.inner.max_frame_size)?;

        let mut shared = lock(&self.inner.shared);
        match shared.state {
            ConnectionState::Ready => {}
            ConnectionState::Authenticating if during_handshake => {}
            ConnectionState::Authenticating => {
                return Err(NegotiationError::NotAuthenticated.into())
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                return Err(Error::ConnectionClosed)
            }
        }

        let correlation_id = shared.allocate_correlation_id();
        codec::set_correlation_id(&mut frame, correlation_id)?;
        let receiver = if expect_reply {
            let (slot, receiver) = oneshot::channel();
            shared.pending.insert(correlation_id, slot);
            Some(receiver)
        } else {
            None
        };
        if shared.writer.send(frame.freeze()).is_err() {
            shared.pending.remove(&correlation_id);
            return Err(Error::ConnectionClosed);
        }
        tracing::trace!(
            "Queued {:?} v{} with correlation id {}",
            R::API_KEY,
            R::API_VERSION,
            correlation_id
        );
        Ok((correlation_id, receiver))
    }

    fn pending<T>(
        &self,
        correlation_id: i32,
        receiver: oneshot::Receiver<Result<Bytes>>,
    ) -> PendingResponse<T> {
        PendingResponse {
            correlation_id,
            receiver,
            shared: Arc::downgrade(&self.inner.shared),
            completed: false,
            _response: PhantomData,
        }
    }

    /// Queue `request` and return a handle to its response without waiting.
    pub fn send<R: KafkaRequest>(&self, request: &R) -> Result<PendingResponse<R::Response>> {
        match self.submit(request, false, true)? {
            (correlation_id, Some(receiver)) => Ok(self.pending(correlation_id, receiver)),
            (_, None) => Err(Error::ConnectionClosed),
        }
    }

    /// Queue a request the broker does not answer, such as a produce
    /// with `acks = 0`.
    pub fn send_no_reply<R: KafkaRequest>(&self, request: &R) -> Result<()> {
        self.submit(request, false, false).map(|_| ())
    }

    /// Send `request` and wait for its response, up to the request timeout.
    pub async fn request<R: KafkaRequest>(&self, request: &R) -> Result<R::Response> {
        self.send(request)?
            .response_timeout(self.inner.request_timeout)
            .await
    }

    async fn handshake_request<R: KafkaRequest>(&self, request: &R) -> Result<R::Response> {
        let (correlation_id, receiver) = self.submit(request, true, true)?;
        let receiver = receiver.ok_or(Error::ConnectionClosed)?;
        self.pending(correlation_id, receiver)
            .response_timeout(self.inner.request_timeout)
            .await
    }

    /// Close the socket and fail every outstanding request.
    pub fn close(&self) {
        teardown(&self.inner.shared, ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.shared).state
    }

    /// Ready, and not past the broker's re-authentication deadline.
    pub fn is_usable(&self) -> bool {
        let shared = lock(&self.inner.shared);
        shared.state == ConnectionState::Ready
            && shared
                .session_deadline
                .map_or(true, |deadline| Instant::now() < deadline)
    }

    /// Requests sent and not yet answered.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.shared).pending.len()
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.inner.endpoint
    }
}

/// The response side of a request sent with [`Connection::send`].
///
/// Dropping it before the response arrives releases its slot. The late
/// response is then discarded and its correlation ID is not handed out
/// again until it has been.
pub struct PendingResponse<T> {
    correlation_id: i32,
    receiver: oneshot::Receiver<Result<Bytes>>,
    shared: Weak<Mutex<Shared>>,
    completed: bool,
    _response: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for PendingResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("correlation_id", &self.correlation_id)
            .field("completed", &self.completed)
            .finish()
    }
}

impl<T> PendingResponse<T>
where
    T: TryFrom<Bytes, Error = Error>,
{
    pub fn correlation_id(&self) -> i32 {
        self.correlation_id
    }

    /// Wait for the response and parse it.
    pub async fn response(mut self) -> Result<T> {
        self.wait().await
    }

    /// Wait for the response without giving up the handle.
    ///
    /// Cancel safe: when the future is dropped early the request stays
    /// outstanding and a later call picks up its response.
    pub async fn wait(&mut self) -> Result<T> {
        if self.completed {
            return Err(Error::ConnectionClosed);
        }
        let outcome = (&mut self.receiver).await;
        self.completed = true;
        let body = outcome.map_err(|_| Error::ConnectionClosed)??;
        T::try_from(body)
    }

    /// Like [`response`](Self::response), giving up with [`Error::Timeout`]
    /// after `timeout`. The connection stays usable after a timeout.
    pub async fn response_timeout(self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.response()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout),
        }
    }
}

impl<T> Drop for PendingResponse<T> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            let mut shared = lock(&shared);
            if shared.pending.remove(&self.correlation_id).is_some() {
                shared.abandoned.insert(self.correlation_id);
            }
        }
    }
}

/// Carries the negotiator's requests while the connection is still
/// authenticating.
struct Handshaking<'a> {
    connection: &'a Connection,
}

#[async_trait]
impl<'a> SaslTransport for Handshaking<'a> {
    async fn handshake(&mut self, request: SaslHandshakeRequest) -> Result<SaslHandshakeResponse> {
        self.connection.handshake_request(&request).await
    }

    async fn authenticate(
        &mut self,
        request: SaslAuthenticateRequest,
    ) -> Result<SaslAuthenticateResponse> {
        self.connection.handshake_request(&request).await
    }
}
