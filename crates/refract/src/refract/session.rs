//! One client connection: both legs, their independent wire settings, and the lifecycle
//! that ties them together.
//!
//! The session owns the send side of both legs. Pump tasks hold only a `Weak` back
//! reference, so dropping the last `Arc` (or closing) tears everything down.

use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::{mpsc, watch},
    time,
};

use crate::refract::{
    auth::{AuthError, Identity},
    chat::ChatSession,
    hooks::PacketFilter,
    net,
    packets::{self, Phase, Transfer, relay_ids},
    telemetry::{self, SessionRegistry},
    transfer::{CookieJar, TransferCache},
    translate::{Direction, EngineSignal, TranslateContext, Translator},
    version::ProtocolVersion,
    wire::{FrameReader, FrameWriter, Packet, WireError},
};

const OUTBOUND_QUEUE: usize = 256;
const FLUSH_ON_CLOSE: Duration = Duration::from_secs(1);

pub const RECONNECT_HINT: &str =
    "The server wants to transfer you. Please reconnect to the proxy to continue.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Client,
    Backend,
}

impl Leg {
    pub fn other(self) -> Self {
        match self {
            Leg::Client => Leg::Backend,
            Leg::Backend => Leg::Client,
        }
    }

    /// Direction of packets read from this leg.
    pub fn direction(self) -> Direction {
        match self {
            Leg::Client => Direction::Serverbound,
            Leg::Backend => Direction::Clientbound,
        }
    }

    fn disconnected(self) -> CloseReason {
        match self {
            Leg::Client => CloseReason::ClientDisconnected,
            Leg::Backend => CloseReason::BackendDisconnected,
        }
    }
}

/// Session lifecycle. Only moves forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Handshake,
    Status,
    Login,
    Play,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    BackendDisconnected,
    Kicked(String),
    PendingOverflow,
    StatusDone,
    LegacyDone,
    Error(String),
    Shutdown,
}

impl CloseReason {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            CloseReason::ClientDisconnected => "client_disconnected",
            CloseReason::BackendDisconnected => "backend_disconnected",
            CloseReason::Kicked(_) => "kicked",
            CloseReason::PendingOverflow => "pending_overflow",
            CloseReason::StatusDone => "status_done",
            CloseReason::LegacyDone => "legacy_done",
            CloseReason::Error(_) => "error",
            CloseReason::Shutdown => "shutdown",
        }
    }

    fn is_error(&self) -> bool {
        matches!(self, CloseReason::Error(_) | CloseReason::PendingOverflow)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Kicked(m) => write!(f, "kicked: {m}"),
            CloseReason::Error(e) => write!(f, "error: {e}"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("{leg:?} leg buffered more than {limit} packets")]
    PendingOverflow { leg: Leg, limit: usize },
    #[error("session registry is full ({0} sessions)")]
    Capacity(usize),
    #[error("cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("backend leg needs the login state")]
    BackendBeforeLogin,
    #[error("packet handler failed: {0}")]
    Handler(String),
}

/// Failure taxonomy resolved at the session boundary.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("auth: {0}")]
    Auth(#[from] AuthError),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("transport closed")]
    TransportClosed,
    /// A deliberate disconnect with a player-facing message.
    #[error("kick: {0}")]
    Kick(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub const BACKEND_UNAVAILABLE_MESSAGE: &str = "Could not connect to the backend server!";

impl ProxyError {
    /// What the client is told; `None` when it is already gone.
    pub fn client_message(&self) -> Option<String> {
        match self {
            ProxyError::Protocol(_) => Some("Invalid packet received. Disconnected.".into()),
            ProxyError::Auth(e) => Some(e.user_reason().to_string()),
            ProxyError::BackendUnavailable(_) => Some(BACKEND_UNAVAILABLE_MESSAGE.into()),
            ProxyError::TransportClosed => None,
            ProxyError::Kick(m) => Some(m.clone()),
            ProxyError::Internal(_) => Some("An internal error occurred in the proxy.".into()),
        }
    }

    pub fn close_reason(&self) -> CloseReason {
        match self {
            ProxyError::TransportClosed => CloseReason::ClientDisconnected,
            ProxyError::Kick(m) => CloseReason::Kicked(m.clone()),
            ProxyError::Auth(e) => CloseReason::Kicked(e.user_reason().to_string()),
            other => CloseReason::Error(other.to_string()),
        }
    }
}

impl From<WireError> for ProxyError {
    fn from(e: WireError) -> Self {
        if e.is_disconnect() {
            ProxyError::TransportClosed
        } else {
            ProxyError::Protocol(e.to_string())
        }
    }
}

impl From<SessionError> for ProxyError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Closed => ProxyError::TransportClosed,
            SessionError::PendingOverflow { .. } => ProxyError::Protocol(e.to_string()),
            SessionError::Capacity(_) => ProxyError::Kick("The proxy is full.".into()),
            other => ProxyError::Internal(other.to_string()),
        }
    }
}

/// Commands for a leg's writer task.
#[derive(Debug)]
pub enum Outbound {
    Packet(Packet),
    SetCompression(Option<i32>),
}

/// Wire settings of one leg. Never copied to the other leg.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LegSettings {
    pub compression: Option<i32>,
    pub encrypted: bool,
}

struct LegSlot {
    tx: Option<mpsc::Sender<Outbound>>,
    pending: VecDeque<Packet>,
    settings: LegSettings,
    phase: Phase,
    filter: Option<Arc<dyn PacketFilter>>,
    reader_update: Option<Option<i32>>,
}

impl LegSlot {
    fn new() -> Self {
        Self {
            tx: None,
            pending: VecDeque::new(),
            settings: LegSettings::default(),
            phase: Phase::Handshake,
            filter: None,
            reader_update: None,
        }
    }
}

struct Inner {
    state: ConnectionState,
    client_version: ProtocolVersion,
    server_version: Option<ProtocolVersion>,
    identity: Option<Identity>,
    backend_addr: Option<String>,
    handshake: Option<(String, u16)>,
    legacy: bool,
    translator: Arc<dyn Translator>,
    client: LegSlot,
    backend: LegSlot,
    cookies: CookieJar,
    chat: Option<ChatSession>,
}

impl Inner {
    fn slot(&self, leg: Leg) -> &LegSlot {
        match leg {
            Leg::Client => &self.client,
            Leg::Backend => &self.backend,
        }
    }

    fn slot_mut(&mut self, leg: Leg) -> &mut LegSlot {
        match leg {
            Leg::Client => &mut self.client,
            Leg::Backend => &mut self.backend,
        }
    }
}

/// What a new session starts with.
pub struct SessionParams {
    pub client_version: ProtocolVersion,
    pub pending_limit: usize,
    pub translator: Arc<dyn Translator>,
    pub transfers: Arc<TransferCache>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub client: String,
    pub state: ConnectionState,
    pub identity: Option<Identity>,
    pub client_version: i32,
    pub server_version: Option<i32>,
    pub backend: Option<String>,
    pub legacy: bool,
    pub translator: String,
    pub client_leg: LegSettings,
    pub backend_leg: LegSettings,
    pub started_at_unix_ms: u64,
}

pub struct Session {
    id: String,
    client_addr: SocketAddr,
    started: Instant,
    started_at_unix_ms: u64,
    pending_limit: usize,
    transfers: Arc<TransferCache>,
    registry: Weak<SessionRegistry>,
    inner: Mutex<Inner>,
    // Held across a leg's sends so buffered and live packets keep their order.
    client_send: tokio::sync::Mutex<()>,
    backend_send: tokio::sync::Mutex<()>,
    closed: watch::Sender<bool>,
    readable: watch::Sender<bool>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client", &self.client_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates and registers a session for an accepted client.
    pub fn create(
        registry: &Arc<SessionRegistry>,
        client_addr: SocketAddr,
        params: SessionParams,
    ) -> Result<Arc<Self>, SessionError> {
        let session = Arc::new(Self {
            id: telemetry::new_session_id(),
            client_addr,
            started: Instant::now(),
            started_at_unix_ms: telemetry::now_unix_ms(),
            pending_limit: params.pending_limit.max(1),
            transfers: params.transfers,
            registry: Arc::downgrade(registry),
            inner: Mutex::new(Inner {
                state: ConnectionState::Handshake,
                client_version: params.client_version,
                server_version: None,
                identity: None,
                backend_addr: None,
                handshake: None,
                legacy: false,
                translator: params.translator,
                client: LegSlot::new(),
                backend: LegSlot::new(),
                cookies: CookieJar::new(),
                chat: None,
            }),
            client_send: tokio::sync::Mutex::new(()),
            backend_send: tokio::sync::Mutex::new(()),
            closed: watch::channel(false).0,
            readable: watch::channel(true).0,
        });
        registry.try_add(session.clone())?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(sid = %session.id, client = %client_addr, "session: created");
        }
        Ok(session)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_lock(&self, leg: Leg) -> &tokio::sync::Mutex<()> {
        match leg {
            Leg::Client => &self.client_send,
            Leg::Backend => &self.backend_send,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Moves the lifecycle forward. Regressions and the status->login jump are refused.
    pub fn advance(&self, to: ConnectionState) -> Result<(), SessionError> {
        let (from, identity) = {
            let mut inner = self.lock();
            let from = inner.state;
            if from == ConnectionState::Closed {
                return Err(SessionError::Closed);
            }
            if to == ConnectionState::Closed {
                drop(inner);
                self.close(CloseReason::Error("advance to closed".into()));
                return Ok(());
            }
            let side_branch = from == ConnectionState::Status && to > ConnectionState::Status;
            if to <= from || side_branch {
                return Err(SessionError::InvalidTransition { from, to });
            }
            inner.state = to;
            (from, inner.identity.clone())
        };
        tracing::info!(
            sid = %self.id,
            client = %self.client_addr,
            identity = %identity.map(|i| i.to_string()).unwrap_or_default(),
            from = ?from,
            state = ?to,
            "session: state changed"
        );
        Ok(())
    }

    pub fn client_version(&self) -> ProtocolVersion {
        self.lock().client_version
    }

    pub fn set_client_version(&self, v: ProtocolVersion) {
        self.lock().client_version = v;
    }

    pub fn server_version(&self) -> Option<ProtocolVersion> {
        self.lock().server_version
    }

    pub fn set_server_version(&self, v: ProtocolVersion) {
        self.lock().server_version = Some(v);
    }

    pub fn identity(&self) -> Option<Identity> {
        self.lock().identity.clone()
    }

    pub fn set_identity(&self, identity: Identity) {
        tracing::info!(sid = %self.id, client = %self.client_addr, identity = %identity, "session: identity resolved");
        self.lock().identity = Some(identity);
    }

    pub fn set_backend_addr(&self, addr: String) {
        self.lock().backend_addr = Some(addr);
    }

    /// Address and port the client typed, used to point transfers back at the proxy.
    pub fn set_handshake_address(&self, host: String, port: u16) {
        self.lock().handshake = Some((host, port));
    }

    pub fn set_legacy(&self) {
        self.lock().legacy = true;
    }

    pub fn set_translator(&self, translator: Arc<dyn Translator>) {
        self.lock().translator = translator;
    }

    pub fn set_filter(&self, leg: Leg, filter: Arc<dyn PacketFilter>) {
        self.lock().slot_mut(leg).filter = Some(filter);
    }

    pub fn settings(&self, leg: Leg) -> LegSettings {
        self.lock().slot(leg).settings
    }

    /// Records the compression threshold of one leg. A negative threshold disables it.
    pub fn set_compression(&self, leg: Leg, threshold: Option<i32>) {
        let threshold = threshold.filter(|t| *t >= 0);
        self.lock().slot_mut(leg).settings.compression = threshold;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(sid = %self.id, leg = ?leg, threshold = ?threshold, "session: compression set");
        }
    }

    pub fn mark_encrypted(&self, leg: Leg) {
        self.lock().slot_mut(leg).settings.encrypted = true;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(sid = %self.id, leg = ?leg, "session: encryption enabled");
        }
    }

    pub fn phase(&self, leg: Leg) -> Phase {
        self.lock().slot(leg).phase
    }

    pub fn set_phase(&self, leg: Leg, phase: Phase) {
        self.lock().slot_mut(leg).phase = phase;
    }

    pub fn pending_len(&self, leg: Leg) -> usize {
        self.lock().slot(leg).pending.len()
    }

    pub fn cookie(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().cookies.get(key).cloned()
    }

    pub fn merge_cookies(&self, jar: CookieJar) {
        self.lock().cookies.extend(jar);
    }

    pub fn set_chat(&self, chat: ChatSession) {
        self.lock().chat = Some(chat);
    }

    /// Stops the client pump from reading until [`resume_client_reads`](Self::resume_client_reads).
    pub fn pause_client_reads(&self) {
        self.readable.send_replace(false);
    }

    pub fn resume_client_reads(&self) {
        self.readable.send_replace(true);
    }

    pub async fn wait_readable(&self) {
        let mut rx = self.readable.subscribe();
        let _ = rx.wait_for(|r| *r).await;
    }

    pub async fn wait_closed(&self) {
        until_closed(&mut self.closed.subscribe()).await;
    }

    /// Connects a leg's writer. Packets buffered for this leg are flushed first, in order.
    pub async fn attach_leg(
        &self,
        leg: Leg,
        tx: mpsc::Sender<Outbound>,
    ) -> Result<(), SessionError> {
        let _order = self.send_lock(leg).lock().await;
        let pending = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return Err(SessionError::Closed);
            }
            if leg == Leg::Backend && inner.state < ConnectionState::Login {
                return Err(SessionError::BackendBeforeLogin);
            }
            let slot = inner.slot_mut(leg);
            slot.tx = Some(tx.clone());
            std::mem::take(&mut slot.pending)
        };
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(sid = %self.id, leg = ?leg, flushed = pending.len(), "session: leg attached");
        }
        for p in pending {
            tx.send(Outbound::Packet(p))
                .await
                .map_err(|_| SessionError::Closed)?;
        }
        Ok(())
    }

    /// Compression change the reader of `leg` must apply before its next frame.
    pub fn take_reader_update(&self, leg: Leg) -> Option<Option<i32>> {
        self.lock().slot_mut(leg).reader_update.take()
    }

    /// Relays a packet read from `from` to the other leg through the translator.
    /// Until the other leg is attached packets wait in a bounded queue; overflowing it
    /// closes the session.
    pub async fn forward(&self, from: Leg, packet: Packet) -> Result<(), SessionError> {
        let to = from.other();
        let _order = self.send_lock(to).lock().await;

        let mut control: Vec<(mpsc::Sender<Outbound>, Outbound)> = Vec::new();
        let mut kick_after: Option<String> = None;
        let (tx, deliveries) = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return Err(SessionError::Closed);
            }
            let dir = from.direction();

            let packet = match inner.slot(from).filter.clone() {
                Some(f) => match guarded(f.name(), || f.filter(dir, packet))? {
                    Some(p) => p,
                    None => return Ok(()),
                },
                None => packet,
            };

            let translator = inner.translator.clone();
            let translated = {
                let inner = &mut *inner;
                let mut ctx = TranslateContext {
                    client_version: inner.client_version,
                    server_version: inner.server_version.unwrap_or(inner.client_version),
                    phase: inner.slot(from).phase,
                    chat: inner.chat.as_mut(),
                };
                guarded(translator.name(), || translator.translate(&mut ctx, dir, packet))?
            };

            let mut deliveries = translated.packets;
            for signal in translated.signals {
                self.apply_signal(&mut inner, signal, &mut deliveries, &mut control, &mut kick_after);
            }

            let limit = self.pending_limit;
            let slot = inner.slot_mut(to);
            match slot.tx.clone() {
                Some(tx) => (Some(tx), deliveries),
                None => {
                    slot.pending.extend(deliveries);
                    if slot.pending.len() > limit {
                        drop(inner);
                        tracing::warn!(sid = %self.id, client = %self.client_addr, leg = ?to, limit, "session: pending queue overflow");
                        self.close(CloseReason::PendingOverflow);
                        return Err(SessionError::PendingOverflow { leg: to, limit });
                    }
                    (None, Vec::new())
                }
            }
        };

        for (ctl_tx, msg) in control {
            let _ = ctl_tx.send(msg).await;
        }
        if let Some(tx) = tx {
            for p in deliveries {
                tx.send(Outbound::Packet(p))
                    .await
                    .map_err(|_| SessionError::Closed)?;
            }
        }
        if let Some(msg) = kick_after {
            self.close(CloseReason::Kicked(msg));
        }
        Ok(())
    }

    fn apply_signal(
        &self,
        inner: &mut Inner,
        signal: EngineSignal,
        to_client: &mut Vec<Packet>,
        control: &mut Vec<(mpsc::Sender<Outbound>, Outbound)>,
        kick_after: &mut Option<String>,
    ) {
        match signal {
            EngineSignal::Transfer { host, port } => {
                let target = net::join_host_port(&host, port);
                self.transfers.insert_redirect(self.client_addr.ip(), target.clone());
                self.transfers
                    .insert_cookies(self.client_addr.ip(), inner.cookies.clone());
                metrics::counter!("refract_transfers_total").increment(1);
                tracing::info!(sid = %self.id, client = %self.client_addr, target = %target, "session: backend requested transfer");

                let phase = inner.client.phase;
                let v = inner.client_version;
                let id = match phase {
                    Phase::Configuration => relay_ids::config_transfer(v),
                    Phase::Play => relay_ids::play_transfer(v),
                    _ => None,
                };
                match (id, inner.handshake.clone()) {
                    (Some(id), Some((h, p))) => to_client.push(Transfer { host: h, port: p }.encode(id)),
                    _ => {
                        if let Some(p) = packets::disconnect_for(phase, v, RECONNECT_HINT) {
                            to_client.push(p);
                        }
                        *kick_after = Some(RECONNECT_HINT.to_string());
                    }
                }
            }
            EngineSignal::StoreCookie { key, payload } => {
                inner.cookies.insert(key, payload);
            }
            EngineSignal::Phase(phase) => {
                inner.client.phase = phase;
                inner.backend.phase = phase;
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(sid = %self.id, phase = ?phase, "session: phase changed");
                }
            }
            EngineSignal::Compression(threshold) => {
                let t = (threshold >= 0).then_some(threshold);
                inner.backend.settings.compression = t;
                inner.backend.reader_update = Some(t);
                if let Some(tx) = inner.backend.tx.clone() {
                    control.push((tx, Outbound::SetCompression(t)));
                }
            }
        }
    }

    /// Sends a packet the proxy itself produced to one leg, bypassing the translator.
    pub async fn send(&self, leg: Leg, packet: Packet) -> Result<(), SessionError> {
        let _order = self.send_lock(leg).lock().await;
        let tx = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return Err(SessionError::Closed);
            }
            let limit = self.pending_limit;
            let slot = inner.slot_mut(leg);
            match slot.tx.clone() {
                Some(tx) => tx,
                None => {
                    slot.pending.push_back(packet);
                    if slot.pending.len() > limit {
                        drop(inner);
                        self.close(CloseReason::PendingOverflow);
                        return Err(SessionError::PendingOverflow { leg, limit });
                    }
                    return Ok(());
                }
            }
        };
        tx.send(Outbound::Packet(packet))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Disconnects the client with a readable reason, formatted for its current phase.
    pub async fn kick(&self, message: &str) {
        let (tx, packet) = {
            let inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            (
                inner.client.tx.clone(),
                packets::disconnect_for(inner.client.phase, inner.client_version, message),
            )
        };
        if let (Some(tx), Some(p)) = (tx, packet) {
            let _order = self.client_send.lock().await;
            let _ = tx.send(Outbound::Packet(p)).await;
        }
        self.close(CloseReason::Kicked(message.to_string()));
    }

    /// Closes both legs and unregisters. Returns false if the session was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        let (identity, previous) = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return false;
            }
            let previous = inner.state;
            inner.state = ConnectionState::Closed;
            for leg in [Leg::Client, Leg::Backend] {
                let slot = inner.slot_mut(leg);
                slot.tx = None;
                slot.pending.clear();
            }
            inner.chat = None;
            (inner.identity.clone(), previous)
        };

        self.closed.send_replace(true);
        self.readable.send_replace(true);
        if let Some(reg) = self.registry.upgrade() {
            reg.remove(&self.id);
        }
        metrics::counter!("refract_sessions_closed_total", "reason" => reason.label()).increment(1);

        let identity = identity.map(|i| i.to_string()).unwrap_or_default();
        let lived = humantime::format_duration(Duration::from_millis(
            self.started.elapsed().as_millis() as u64,
        ));
        if reason.is_error() {
            tracing::warn!(sid = %self.id, client = %self.client_addr, identity = %identity, state = ?previous, reason = %reason, lived = %lived, "session: closed");
        } else {
            tracing::info!(sid = %self.id, client = %self.client_addr, identity = %identity, state = ?previous, reason = %reason, lived = %lived, "session: closed");
        }
        true
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.lock();
        SessionInfo {
            id: self.id.clone(),
            client: self.client_addr.to_string(),
            state: inner.state,
            identity: inner.identity.clone(),
            client_version: inner.client_version.raw(),
            server_version: inner.server_version.map(ProtocolVersion::raw),
            backend: inner.backend_addr.clone(),
            legacy: inner.legacy,
            translator: inner.translator.name().to_string(),
            client_leg: inner.client.settings,
            backend_leg: inner.backend.settings,
            started_at_unix_ms: self.started_at_unix_ms,
        }
    }
}

/// Runs hook or translator code, turning a panic into a handler error.
fn guarded<T>(
    name: &str,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, SessionError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(SessionError::Handler(format!("{name}: {e:#}"))),
        Err(_) => Err(SessionError::Handler(format!("{name}: panicked"))),
    }
}

async fn until_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}

async fn gate_open(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|r| *r).await.is_ok()
}

/// Starts the writer and reader tasks of one leg and attaches it to the session.
pub async fn start_leg(
    session: &Arc<Session>,
    leg: Leg,
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
) -> Result<(), SessionError> {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    tokio::spawn(write_loop(writer, rx, session.closed.subscribe()));
    session.attach_leg(leg, tx).await?;
    tokio::spawn(read_loop(
        Arc::downgrade(session),
        leg,
        reader,
        session.closed.subscribe(),
        session.readable.subscribe(),
    ));
    Ok(())
}

async fn write_loop(
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut rx: mpsc::Receiver<Outbound>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(Outbound::Packet(p)) => {
                    if let Err(err) = writer.write_packet(&p).await {
                        if tracing::enabled!(tracing::Level::DEBUG) {
                            tracing::debug!(err = %err, "session: leg write failed");
                        }
                        break;
                    }
                }
                Some(Outbound::SetCompression(t)) => writer.set_compression(t),
                None => break,
            },
            _ = until_closed(&mut closed) => {
                // Flush what was queued before the close (kick messages).
                while let Ok(msg) = rx.try_recv() {
                    if let Outbound::Packet(p) = msg
                        && time::timeout(FLUSH_ON_CLOSE, writer.write_packet(&p)).await.is_err()
                    {
                        break;
                    }
                }
                break;
            }
        }
    }
    writer.shutdown().await;
}

async fn read_loop(
    session: Weak<Session>,
    leg: Leg,
    mut reader: FrameReader<OwnedReadHalf>,
    mut closed: watch::Receiver<bool>,
    mut readable: watch::Receiver<bool>,
) {
    loop {
        if leg == Leg::Client && !gate_open(&mut readable).await {
            break;
        }
        let res = tokio::select! {
            _ = until_closed(&mut closed) => break,
            r = reader.read_packet() => r,
        };
        let Some(s) = session.upgrade() else { break };
        match res {
            Ok(Some(p)) => {
                if let Err(err) = s.forward(leg, p).await {
                    match err {
                        SessionError::Closed | SessionError::PendingOverflow { .. } => {}
                        other => {
                            tracing::error!(sid = %s.id(), leg = ?leg, err = %other, "session: packet handling failed");
                            let msg = ProxyError::from(other).client_message().unwrap_or_default();
                            s.kick(&msg).await;
                        }
                    }
                    break;
                }
                if let Some(update) = s.take_reader_update(leg) {
                    reader.set_compression(update);
                }
            }
            Ok(None) => {
                s.close(leg.disconnected());
                break;
            }
            Err(err) if err.is_disconnect() => {
                s.close(leg.disconnected());
                break;
            }
            Err(err) => {
                tracing::warn!(sid = %s.id(), client = %s.client_addr(), leg = ?leg, err = %err, "session: protocol error");
                let msg = ProxyError::from(err).client_message().unwrap_or_default();
                s.kick(&msg).await;
                break;
            }
        }
    }
}
