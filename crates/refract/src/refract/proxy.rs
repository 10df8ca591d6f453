use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::BytesMut;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    time,
};

use crate::refract::{
    auth::{AuthStrategy, DEFAULT_SESSION_SERVER, HttpSessionService, SharedSessionService},
    config::Config,
    crypto::ProxyKeyPair,
    hooks::{HookRegistry, LegInit, PacketFilter, Stage},
    legacy::{self, Classification, LegacyKind},
    login, net,
    packets::{self, Handshake, Intent, Phase, ids},
    session::{CloseReason, ConnectionState, Leg, ProxyError, Session, SessionParams},
    status,
    telemetry::SharedSessions,
    transfer::TransferCache,
    translate::{PassthroughTranslator, Translator},
    version::ProtocolVersion,
    wire::FramedConn,
};

const SESSION_SERVICE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection handler needs, shared by all connections.
pub struct ProxyContext {
    pub cfg: Arc<Config>,
    pub sessions: SharedSessions,
    pub transfers: Arc<TransferCache>,
    pub hooks: Arc<HookRegistry>,
    pub auth: AuthStrategy,
    pub session_service: SharedSessionService,
    pub translator: Arc<dyn Translator>,
    /// Present only with `proxy_online_mode`.
    pub proxy_keys: Option<Arc<ProxyKeyPair>>,
}

impl ProxyContext {
    pub fn new(
        cfg: Arc<Config>,
        sessions: SharedSessions,
        transfers: Arc<TransferCache>,
        hooks: Arc<HookRegistry>,
    ) -> anyhow::Result<Self> {
        let session_server = cfg
            .auth
            .account
            .as_ref()
            .map(|a| a.session_server.as_str())
            .unwrap_or(DEFAULT_SESSION_SERVER);
        let session_service: SharedSessionService =
            Arc::new(HttpSessionService::new(session_server, SESSION_SERVICE_TIMEOUT)?);
        let auth = AuthStrategy::from_config(&cfg.auth, session_service.clone())?;
        let proxy_keys = if cfg.proxy_online_mode {
            let keys = ProxyKeyPair::generate().context("proxy: generate online-mode keypair")?;
            Some(Arc::new(keys))
        } else {
            None
        };
        Ok(Self {
            cfg,
            sessions,
            transfers,
            hooks,
            auth,
            session_service,
            translator: Arc::new(PassthroughTranslator),
            proxy_keys,
        })
    }

    fn session_params(&self, client_version: ProtocolVersion) -> SessionParams {
        SessionParams {
            client_version,
            pending_limit: self.cfg.pending_packet_limit,
            translator: self.translator.clone(),
            transfers: self.transfers.clone(),
        }
    }
}

struct ActiveConnGuard;

impl ActiveConnGuard {
    fn new() -> Self {
        metrics::counter!("refract_connections_total").increment(1);
        metrics::gauge!("refract_active_connections").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("refract_active_connections").decrement(1.0);
    }
}

pub async fn serve_with_shutdown(
    listen_addr: &str,
    ctx: Arc<ProxyContext>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "proxy: listening");
    serve_listener(ln, ctx, shutdown).await
}

/// Accepts until `shutdown` flips. Connection failures never reach this loop.
pub async fn serve_listener(
    ln: TcpListener,
    ctx: Arc<ProxyContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err = %err, "proxy: accept failed");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "proxy: accepted");
                    }
                    handle_client(ctx, conn, peer).await;
                });
            }
        }
    }

    Ok(())
}

async fn handle_client(ctx: Arc<ProxyContext>, mut conn: TcpStream, peer: SocketAddr) {
    let _guard = ActiveConnGuard::new();
    let _ = conn.set_nodelay(true);

    let (class, prefix) = match legacy::sniff(&mut conn, ctx.cfg.timeouts.handshake).await {
        Ok(Some(v)) => v,
        Ok(None) => return,
        Err(err) => {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(client = %peer, err = %format!("{err:#}"), "proxy: no first byte");
            }
            return;
        }
    };

    match class {
        Classification::Legacy(kind) if ctx.cfg.allow_legacy_client_passthrough => {
            serve_legacy(&ctx, conn, peer, kind, prefix).await
        }
        _ => serve_framed(&ctx, conn, peer, prefix).await,
    }
}

/// Runs the client-leg hooks for one stage; a replacement becomes the leg's filter.
fn client_leg_init(
    ctx: &ProxyContext,
    peer: SocketAddr,
    stage: Stage,
    legacy: bool,
) -> Result<Option<Arc<dyn PacketFilter>>, ProxyError> {
    let req = LegInit {
        stage,
        client_addr: peer,
        legacy,
    };
    let res = ctx
        .hooks
        .dispatch(|h| h.client_leg_init(&req))
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    if res.cancelled {
        return Err(ProxyError::Kick(
            res.message.unwrap_or_else(|| "Connection refused.".into()),
        ));
    }
    Ok(res.replacement)
}

async fn serve_legacy(
    ctx: &ProxyContext,
    conn: TcpStream,
    peer: SocketAddr,
    kind: LegacyKind,
    prefix: BytesMut,
) {
    let session = match Session::create(
        &ctx.sessions,
        peer,
        ctx.session_params(ProtocolVersion::UNKNOWN),
    ) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(client = %peer, err = %err, "proxy: legacy client rejected");
            return;
        }
    };
    session.set_legacy();

    for stage in [Stage::Pre, Stage::Post] {
        if let Err(err) = client_leg_init(ctx, peer, stage, true) {
            log_failure(&session, &err);
            session.close(err.close_reason());
            return;
        }
    }

    metrics::counter!("refract_legacy_relays_total").increment(1);
    tracing::info!(sid = %session.id(), client = %peer, kind = ?kind, backend = %ctx.cfg.target_addr, "proxy: legacy passthrough");

    let res = legacy::relay(
        conn,
        &prefix,
        &ctx.cfg.target_addr,
        ctx.cfg.timeouts.legacy_connect,
        session.wait_closed(),
    )
    .await;
    match res {
        Ok(stats) => {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(sid = %session.id(), ingress = stats.ingress, egress = stats.egress, "proxy: legacy relay finished");
            }
            session.close(CloseReason::LegacyDone);
        }
        Err(err) => {
            tracing::error!(sid = %session.id(), client = %peer, err = %format!("{err:#}"), "proxy: legacy relay failed");
            session.close(CloseReason::Error(format!("{err:#}")));
        }
    }
}

async fn serve_framed(ctx: &ProxyContext, conn: TcpStream, peer: SocketAddr, prefix: BytesMut) {
    let mut filter = match client_leg_init(ctx, peer, Stage::Pre, false) {
        Ok(f) => f,
        Err(err) => {
            tracing::info!(client = %peer, err = %err, "proxy: client leg refused");
            return;
        }
    };
    let mut client = match FramedConn::new(conn, prefix) {
        Ok(c) => c,
        Err(err) => {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(client = %peer, err = %err, "proxy: client gone before handshake");
            }
            return;
        }
    };
    match client_leg_init(ctx, peer, Stage::Post, false) {
        Ok(Some(f)) => filter = Some(f),
        Ok(None) => {}
        Err(err) => {
            tracing::info!(client = %peer, err = %err, "proxy: client leg refused");
            client.writer.shutdown().await;
            return;
        }
    }

    let handshake = match read_handshake(&mut client, ctx.cfg.timeouts.handshake).await {
        Ok(h) => h,
        Err(err) => {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(client = %peer, err = %err, "proxy: bad handshake");
            }
            client.writer.shutdown().await;
            return;
        }
    };
    let Some(intent) = Intent::from_raw(handshake.intent) else {
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(client = %peer, intent = handshake.intent, "proxy: unknown handshake intent");
        }
        client.writer.shutdown().await;
        return;
    };

    let session = match Session::create(
        &ctx.sessions,
        peer,
        ctx.session_params(ProtocolVersion(handshake.protocol_version)),
    ) {
        Ok(s) => s,
        Err(err) => {
            let err = ProxyError::from(err);
            tracing::warn!(client = %peer, err = %err, "proxy: session rejected");
            if intent != Intent::Status
                && let Some(msg) = err.client_message()
            {
                let _ = client.send(&packets::login_disconnect(&msg)).await;
            }
            client.writer.shutdown().await;
            return;
        }
    };
    if let Some(f) = filter {
        session.set_filter(Leg::Client, f);
    }

    let result = match intent {
        Intent::Status => serve_status(ctx, &session, client, &handshake).await,
        Intent::Login | Intent::Transfer => {
            tokio::select! {
                r = login::serve_login(ctx, &session, client, handshake, intent) => r,
                _ = session.wait_closed() => Err(ProxyError::TransportClosed),
            }
        }
    };

    match result {
        Ok(()) if intent == Intent::Status => {
            session.close(CloseReason::StatusDone);
        }
        // Both legs now belong to the session pumps.
        Ok(()) => session.wait_closed().await,
        Err(err) => {
            log_failure(&session, &err);
            session.close(err.close_reason());
        }
    }
}

async fn serve_status(
    ctx: &ProxyContext,
    session: &Arc<Session>,
    mut client: FramedConn,
    handshake: &Handshake,
) -> Result<(), ProxyError> {
    session.set_phase(Leg::Client, Phase::Status);
    session.advance(ConnectionState::Status)?;

    let backend = match net::parse_wildcard(ctx.cfg.wildcard_domain_handling, &handshake.address) {
        Ok(Some(w)) => w.address,
        _ => ctx.cfg.target_addr.clone(),
    };
    let motd = (!ctx.cfg.custom_motd.is_empty()).then_some(ctx.cfg.custom_motd.as_str());
    let res = status::relay_status(
        &mut client,
        handshake,
        &backend,
        motd,
        ctx.cfg.timeouts.connect,
        ctx.cfg.timeouts.handshake,
    )
    .await;
    client.writer.shutdown().await;
    res
}

async fn read_handshake(client: &mut FramedConn, timeout: Duration) -> Result<Handshake, ProxyError> {
    let p = match time::timeout(timeout, client.read_packet()).await {
        Ok(Ok(Some(p))) => p,
        Ok(Ok(None)) => return Err(ProxyError::TransportClosed),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(ProxyError::Protocol("handshake timed out".into())),
    };
    if p.id != ids::HANDSHAKE {
        return Err(ProxyError::Protocol(format!(
            "expected handshake, got packet {:#04x}",
            p.id
        )));
    }
    Ok(Handshake::decode(&p)?)
}

fn log_failure(session: &Session, err: &ProxyError) {
    let identity = session.identity().map(|i| i.to_string()).unwrap_or_default();
    let client = session.client_addr();
    match err {
        ProxyError::TransportClosed => {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(sid = %session.id(), client = %client, identity = %identity, "proxy: client left");
            }
        }
        ProxyError::Kick(reason) => {
            tracing::info!(sid = %session.id(), client = %client, identity = %identity, reason = %reason, "proxy: client disconnected");
        }
        ProxyError::Auth(_) => {
            metrics::counter!("refract_auth_failures_total").increment(1);
            tracing::warn!(sid = %session.id(), client = %client, identity = %identity, err = %err, "proxy: authentication failed");
        }
        ProxyError::Protocol(_) => {
            tracing::warn!(sid = %session.id(), client = %client, identity = %identity, err = %err, "proxy: protocol error");
        }
        ProxyError::BackendUnavailable(_) | ProxyError::Internal(_) => {
            tracing::error!(sid = %session.id(), client = %client, identity = %identity, err = %err, "proxy: session failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use uuid::Uuid;

    use super::*;
    use crate::refract::{
        config,
        crypto::ProxyKeyPair,
        packets::{EncryptionRequest, LoginHello, LoginSuccess, PluginRequest, Transfer, relay_ids},
        telemetry::SessionRegistry,
        wire::Packet,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn context(body: &str) -> ProxyContext {
        let cfg = Arc::new(config::parse_toml_for_test(body));
        ProxyContext::new(
            cfg,
            Arc::new(SessionRegistry::new(0)),
            Arc::new(TransferCache::new()),
            Arc::new(HookRegistry::new()),
        )
        .unwrap()
    }

    async fn start(ctx: ProxyContext) -> (SocketAddr, Arc<ProxyContext>, watch::Sender<bool>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let ctx = Arc::new(ctx);
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve_listener(ln, ctx.clone(), rx));
        (addr, ctx, tx)
    }

    async fn connect(addr: SocketAddr) -> FramedConn {
        FramedConn::new(TcpStream::connect(addr).await.unwrap(), BytesMut::new()).unwrap()
    }

    async fn accept(ln: &TcpListener) -> FramedConn {
        let (s, _) = time::timeout(WAIT, ln.accept()).await.unwrap().unwrap();
        FramedConn::new(s, BytesMut::new()).unwrap()
    }

    async fn next(conn: &mut FramedConn) -> Packet {
        time::timeout(WAIT, conn.read_packet())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    fn handshake(v: i32, address: &str, port: u16, intent: Intent) -> Packet {
        Handshake {
            protocol_version: v,
            address: address.into(),
            port,
            intent: intent.raw(),
        }
        .encode()
    }

    fn hello(name: &str, v: ProtocolVersion) -> Packet {
        LoginHello {
            name: name.into(),
            uuid: Some(Uuid::from_u128(42)),
            key: None,
        }
        .encode(v)
    }

    fn success(name: &str, v: ProtocolVersion) -> Packet {
        LoginSuccess {
            uuid: Uuid::from_u128(42),
            name: name.into(),
            properties: Vec::new(),
        }
        .encode(v)
    }

    /// Answers one status probe and returns the protocol it announced.
    async fn answer_probe(ln: &TcpListener, reported: i32) -> i32 {
        let mut b = accept(ln).await;
        let hs = Handshake::decode(&next(&mut b).await).unwrap();
        assert_eq!(hs.intent, Intent::Status.raw());
        assert_eq!(next(&mut b).await.id, ids::STATUS_REQUEST);
        let json = format!(
            r#"{{"version":{{"name":"fake","protocol":{reported}}},"players":{{"max":1,"online":0}},"description":"x"}}"#
        );
        b.send(&packets::status_response(&json)).await.unwrap();
        hs.protocol_version
    }

    async fn dead_addr() -> String {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ln.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn auto_detect_logs_in_with_the_probed_version() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let client_v = ProtocolVersion::V1_20;
        let server_v = ProtocolVersion::V1_19_4;

        let backend_task = tokio::spawn(async move {
            // The first probe announces the client's version, the re-probe announces -1.
            assert_eq!(answer_probe(&backend, server_v.raw()).await, client_v.raw());
            assert_eq!(answer_probe(&backend, server_v.raw()).await, -1);

            let mut b = accept(&backend).await;
            let hs = Handshake::decode(&next(&mut b).await).unwrap();
            assert_eq!(hs.protocol_version, server_v.raw());
            assert_eq!(hs.intent, Intent::Login.raw());
            let h = LoginHello::decode(&next(&mut b).await, server_v).unwrap();
            assert_eq!(h.name, "Steve");
            b.send(&success("Steve", server_v)).await.unwrap();
            b
        });

        let (proxy, ctx, _shutdown) = start(context(&format!(
            "target_addr = \"{backend_addr}\"\ntarget_version = \"auto\"\n"
        )))
        .await;

        let mut c = connect(proxy).await;
        c.send(&handshake(client_v.raw(), "localhost", proxy.port(), Intent::Login))
            .await
            .unwrap();
        c.send(&hello("Steve", client_v)).await.unwrap();

        let first = next(&mut c).await;
        assert_eq!(first.id, ids::LOGIN_SET_COMPRESSION);
        let threshold = packets::decode_set_compression(&first).unwrap();
        assert_eq!(threshold, 256);
        c.set_compression(Some(threshold));

        let done = LoginSuccess::decode(&next(&mut c).await, client_v).unwrap();
        assert_eq!(done.name, "Steve");

        let _b = backend_task.await.unwrap();
        let info = ctx.sessions.snapshot();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].server_version, Some(server_v.raw()));
        assert_eq!(info[0].client_version, client_v.raw());
        // Threshold 256 reached the client leg only.
        assert_eq!(info[0].client_leg.compression, Some(256));
        assert_eq!(info[0].backend_leg.compression, None);
    }

    #[tokio::test]
    async fn transfer_redirect_is_consumed_by_the_reconnect() {
        let v = ProtocolVersion::V1_21;
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let first_addr = first.local_addr().unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second_addr = second.local_addr().unwrap();

        let first_task = tokio::spawn(async move {
            let mut b = accept(&first).await;
            let hs = Handshake::decode(&next(&mut b).await).unwrap();
            assert_eq!(hs.intent, Intent::Login.raw());
            LoginHello::decode(&next(&mut b).await, v).unwrap();
            b.send(&success("Alex", v)).await.unwrap();
            assert_eq!(next(&mut b).await.id, ids::LOGIN_ACKNOWLEDGED);
            let id = relay_ids::config_transfer(v).unwrap();
            b.send(
                &Transfer {
                    host: second_addr.ip().to_string(),
                    port: second_addr.port(),
                }
                .encode(id),
            )
            .await
            .unwrap();
            b
        });

        let second_task = tokio::spawn(async move {
            let mut b = accept(&second).await;
            let hs = Handshake::decode(&next(&mut b).await).unwrap();
            assert_eq!(hs.intent, Intent::Transfer.raw());
            LoginHello::decode(&next(&mut b).await, v).unwrap();
            b.send(&success("Alex", v)).await.unwrap();
            b
        });

        let (proxy, ctx, _shutdown) = start(context(&format!(
            "target_addr = \"{first_addr}\"\ntarget_version = \"1.21\"\ncompression_threshold = -1\n"
        )))
        .await;

        let mut c = connect(proxy).await;
        c.send(&handshake(v.raw(), "proxy.local", proxy.port(), Intent::Login))
            .await
            .unwrap();
        c.send(&hello("Alex", v)).await.unwrap();
        assert_eq!(next(&mut c).await.id, ids::LOGIN_SUCCESS);
        c.send(&packets::login_acknowledged()).await.unwrap();

        let p = next(&mut c).await;
        assert_eq!(Some(p.id), relay_ids::config_transfer(v));
        // The client is sent back to the proxy, not to the backend.
        let t = Transfer::decode(&p).unwrap();
        assert_eq!(t.host, "proxy.local");
        assert_eq!(t.port, proxy.port());
        assert!(ctx.transfers.has_redirect(proxy.ip()));
        let _first = first_task.await.unwrap();

        let mut c2 = connect(proxy).await;
        c2.send(&handshake(v.raw(), "proxy.local", proxy.port(), Intent::Transfer))
            .await
            .unwrap();
        c2.send(&hello("Alex", v)).await.unwrap();
        assert_eq!(next(&mut c2).await.id, ids::LOGIN_SUCCESS);

        let _second = second_task.await.unwrap();
        assert!(!ctx.transfers.has_redirect(proxy.ip()));
    }

    #[tokio::test]
    async fn client_mod_timeout_disconnects_within_bound() {
        let v = ProtocolVersion::V1_20;
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let keys = ProxyKeyPair::generate().unwrap();

        let backend_task = tokio::spawn(async move {
            let mut b = accept(&backend).await;
            next(&mut b).await;
            next(&mut b).await;
            b.send(
                &EncryptionRequest {
                    server_id: String::new(),
                    public_key: keys.public_der().to_vec(),
                    verify_token: vec![1, 2, 3, 4],
                    should_authenticate: true,
                }
                .encode(v),
            )
            .await
            .unwrap();
            b
        });

        let (proxy, _ctx, _shutdown) = start(context(&format!(
            "target_addr = \"{backend_addr}\"\ntarget_version = \"1.20\"\ncompression_threshold = -1\n\
             [auth]\nmethod = \"openauthmod\"\n[auth.openauthmod]\njoin_timeout_ms = 300\n"
        )))
        .await;

        let mut c = connect(proxy).await;
        c.send(&handshake(v.raw(), "localhost", proxy.port(), Intent::Login))
            .await
            .unwrap();
        c.send(&hello("Steve", v)).await.unwrap();

        let req = PluginRequest::decode(&next(&mut c).await).unwrap();
        assert_eq!(req.channel, "oam:join");
        // No mod installed: the request goes unanswered.
        let asked = Instant::now();
        let p = next(&mut c).await;
        assert_eq!(p.id, ids::LOGIN_DISCONNECT);
        assert!(asked.elapsed() < Duration::from_millis(300 + 1500));
        let text = packets::component_plain_text(&packets::decode_login_disconnect(&p).unwrap());
        assert!(text.contains("OpenAuthMod"), "{text}");

        let _b = backend_task.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_backend_is_reported_to_the_client() {
        let v = ProtocolVersion::V1_20;
        let target = dead_addr().await;
        let (proxy, ctx, _shutdown) = start(context(&format!(
            "target_addr = \"{target}\"\ntarget_version = \"1.20\"\n[timeouts]\nconnect_timeout_ms = 500\n"
        )))
        .await;

        let mut c = connect(proxy).await;
        c.send(&handshake(v.raw(), "localhost", proxy.port(), Intent::Login))
            .await
            .unwrap();
        c.send(&hello("Steve", v)).await.unwrap();

        let p = next(&mut c).await;
        assert_eq!(p.id, ids::LOGIN_DISCONNECT);
        let text = packets::component_plain_text(&packets::decode_login_disconnect(&p).unwrap());
        assert_eq!(text, "Could not connect to the backend server!");

        time::timeout(WAIT, async {
            while !ctx.sessions.is_empty() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn legacy_first_byte_goes_to_the_raw_relay() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut s, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 3];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
            buf
        });

        let (proxy, _ctx, _shutdown) = start(context(&format!(
            "target_addr = \"{backend_addr}\"\nallow_legacy_client_passthrough = true\n"
        )))
        .await;

        let mut c = TcpStream::connect(proxy).await.unwrap();
        c.write_all(&[0xFE, 0x01, 0xFA]).await.unwrap();
        let mut back = [0u8; 3];
        time::timeout(WAIT, c.read_exact(&mut back))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back, [0xFE, 0x01, 0xFA]);
        assert_eq!(echo.await.unwrap(), [0xFE, 0x01, 0xFA]);
    }

    #[tokio::test]
    async fn full_registry_turns_logins_away() {
        let v = ProtocolVersion::V1_20;
        let mut ctx = context("target_version = \"1.20\"\n");
        ctx.sessions = Arc::new(SessionRegistry::new(1));
        let blocker = Session::create(
            &ctx.sessions,
            "127.0.0.1:1".parse().unwrap(),
            ctx.session_params(v),
        )
        .unwrap();
        let (proxy, _ctx, _shutdown) = start(ctx).await;

        let mut c = connect(proxy).await;
        c.send(&handshake(v.raw(), "localhost", proxy.port(), Intent::Login))
            .await
            .unwrap();
        let p = next(&mut c).await;
        assert_eq!(p.id, ids::LOGIN_DISCONNECT);
        let text = packets::component_plain_text(&packets::decode_login_disconnect(&p).unwrap());
        assert_eq!(text, "The proxy is full.");
        blocker.close(CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_mid_login() {
        let v = ProtocolVersion::V1_20;
        // A backend that accepts and then never answers the login.
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let b = accept(&backend).await;
            time::sleep(WAIT).await;
            drop(b);
        });

        let (proxy, ctx, shutdown) = start(context(&format!(
            "target_addr = \"{backend_addr}\"\ntarget_version = \"1.20\"\n"
        )))
        .await;

        let mut c = connect(proxy).await;
        c.send(&handshake(v.raw(), "localhost", proxy.port(), Intent::Login))
            .await
            .unwrap();
        c.send(&hello("Steve", v)).await.unwrap();

        time::timeout(WAIT, async {
            while ctx.sessions.snapshot().iter().all(|s| s.backend.is_none()) {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.send(true).unwrap();
        assert_eq!(ctx.sessions.close_all(CloseReason::Shutdown), 1);
        assert!(ctx.sessions.is_empty());

        let closed = time::timeout(WAIT, c.read_packet()).await.unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
        hold.abort();
    }
}
