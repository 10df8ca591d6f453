//! Login sequencing for both legs: target selection, version detection, authentication,
//! per-leg encryption and compression, then handing both legs to the session pumps.

use std::{sync::Arc, time::Duration};

use bytes::BytesMut;
use tokio::time;
use uuid::Uuid;

use crate::refract::{
    auth::{AuthError, AuthStrategy, GameProfile, Identity},
    chat::ChatSession,
    crypto,
    hooks::{
        ConnectTarget, DEFAULT_PRE_CONNECT_DENIAL, HookResult, Hooks, JoinServer, LegInit,
        PreConnect, Resolve, SessionCreation, Stage,
    },
    net,
    packets::{
        self, EncryptionRequest, EncryptionResponse, Handshake, Intent, LoginHello, LoginSuccess,
        Phase, PluginRequest, PluginResponse, ProfileKeyData, TokenProof, ids,
    },
    proxy::ProxyContext,
    session::{self, ConnectionState, Leg, ProxyError, Session},
    status,
    version::{ProtocolVersion, TargetVersion},
    wire::{FramedConn, Packet, WireError},
};

/// Runs the login for a client whose handshake asked for login (or transfer).
/// On failure the client gets a readable disconnect before the error is returned.
pub async fn serve_login(
    ctx: &ProxyContext,
    session: &Arc<Session>,
    mut client: FramedConn,
    handshake: Handshake,
    intent: Intent,
) -> Result<(), ProxyError> {
    match negotiate(ctx, session, &mut client, &handshake, intent).await {
        Ok(backend) => finish(ctx, session, client, backend).await,
        Err(err) => {
            if let Some(msg) = err.client_message() {
                let _ = client.send(&packets::login_disconnect(&msg)).await;
            }
            client.writer.shutdown().await;
            Err(err)
        }
    }
}

/// Backend leg after a successful backend login, plus what the client still has to see.
struct Negotiated {
    backend: FramedConn,
    success: LoginSuccess,
}

async fn negotiate(
    ctx: &ProxyContext,
    session: &Arc<Session>,
    client: &mut FramedConn,
    handshake: &Handshake,
    intent: Intent,
) -> Result<Negotiated, ProxyError> {
    let client_version = ProtocolVersion(handshake.protocol_version);
    session.set_client_version(client_version);
    session.set_phase(Leg::Client, Phase::Login);
    session.advance(ConnectionState::Login)?;

    let target = select_target(ctx, session, handshake, intent)?;

    let hello_packet = read_client(client, ctx.cfg.timeouts.handshake).await?;
    if hello_packet.id != ids::LOGIN_HELLO {
        return Err(ProxyError::Protocol(format!(
            "expected login hello, got packet {:#04x}",
            hello_packet.id
        )));
    }
    let mut hello = LoginHello::decode(&hello_packet, client_version)?;

    if ctx.cfg.proxy_online_mode {
        let profile = verify_client(ctx, session, client, &hello, client_version).await?;
        hello.name = profile.name.clone();
        hello.uuid = profile.uuid();
    }

    let identity = ctx.auth.identity(&hello).await?;
    session.set_identity(identity.clone());

    // The client's next packets belong to the backend; hold them until it is up.
    session.pause_client_reads();

    let (host, port) = net::split_host_port(&target.address).map_err(|e| {
        ProxyError::Kick(format!("Invalid backend address: {e:#}"))
    })?;
    let resolved = dispatch(ctx, |h| h.resolve_backend(&Resolve { host: host.clone(), port }))?;
    let (host, port) = match resolved.replacement {
        Some(r) => (r.host, r.port),
        None => (host, port),
    };
    let backend_addr = net::join_host_port(&host, port);

    let server_version = match target.version {
        TargetVersion::Fixed(v) => v,
        TargetVersion::Auto => {
            let v = status::probe_version(
                &backend_addr,
                client_version,
                ctx.cfg.timeouts.connect,
                ctx.cfg.timeouts.status_probe,
            )
            .await?;
            tracing::info!(sid = %session.id(), client = %session.client_addr(), backend = %backend_addr, version = %v, "login: detected backend version");
            v
        }
    };
    session.set_server_version(server_version);

    let created = dispatch(ctx, |h| {
        h.session_creation(&SessionCreation {
            client_addr: session.client_addr(),
            client_version,
            server_version,
        })
    })?;
    if let Some(translator) = created.replacement {
        session.set_translator(translator);
    }

    let mut backend = connect_backend(ctx, session, &backend_addr, client_version).await?;
    session.set_backend_addr(backend_addr.clone());
    tracing::info!(
        sid = %session.id(),
        client = %session.client_addr(),
        identity = %identity,
        backend = %backend_addr,
        "login: [{} <-> {}] connected to backend",
        client_version.name(),
        server_version.name()
    );

    let backend_intent = match intent {
        Intent::Transfer if server_version >= ProtocolVersion::V1_20_5 => Intent::Transfer,
        _ => Intent::Login,
    };
    backend
        .send(
            &Handshake {
                protocol_version: server_version.raw(),
                address: host,
                port,
                intent: backend_intent.raw(),
            }
            .encode(),
        )
        .await
        .map_err(backend_err)?;
    if let Some(jar) = ctx.transfers.take_cookies(session.client_addr().ip()) {
        session.merge_cookies(jar);
    }
    session.set_phase(Leg::Backend, Phase::Login);

    let backend_hello = LoginHello {
        name: identity.name.clone(),
        uuid: identity.uuid,
        key: backend_key_data(ctx, &hello, server_version),
    };
    backend
        .send(&backend_hello.encode(server_version))
        .await
        .map_err(backend_err)?;

    let success = backend_login(
        ctx,
        session,
        client,
        &mut backend,
        &identity,
        backend_hello.key.is_some(),
        client_version,
        server_version,
    )
    .await?;

    Ok(Negotiated { backend, success })
}

fn select_target(
    ctx: &ProxyContext,
    session: &Arc<Session>,
    handshake: &Handshake,
    intent: Intent,
) -> Result<ConnectTarget, ProxyError> {
    let mut target = ConnectTarget {
        address: ctx.cfg.target_addr.clone(),
        version: ctx.cfg.target_version,
    };
    let mut client_facing = handshake.address.clone();

    match net::parse_wildcard(ctx.cfg.wildcard_domain_handling, &handshake.address) {
        Ok(Some(w)) => {
            target.address = w.address;
            target.version = w.version;
            if let Some(original) = w.original_address {
                client_facing = original;
            }
        }
        Ok(None) => {}
        Err(err) => return Err(ProxyError::Kick(err.to_string())),
    }

    if let Some(redirect) = ctx.transfers.take_redirect(session.client_addr().ip()) {
        tracing::info!(sid = %session.id(), client = %session.client_addr(), target = %redirect, "login: following transfer redirect");
        target.address = redirect;
    }

    session.set_handshake_address(client_facing.clone(), handshake.port);

    let pre = dispatch(ctx, |h| {
        h.pre_connect(&PreConnect {
            target: target.clone(),
            client_version: ProtocolVersion(handshake.protocol_version),
            client_addr: session.client_addr(),
            handshake_address: client_facing.clone(),
            handshake_port: handshake.port,
            intent,
        })
    })?;
    if pre.cancelled {
        return Err(ProxyError::Kick(
            pre.message
                .unwrap_or_else(|| DEFAULT_PRE_CONNECT_DENIAL.to_string()),
        ));
    }
    Ok(pre.replacement.unwrap_or(target))
}

fn dispatch<T>(
    ctx: &ProxyContext,
    f: impl Fn(&dyn Hooks) -> HookResult<T>,
) -> Result<HookResult<T>, ProxyError> {
    ctx.hooks
        .dispatch(f)
        .map_err(|e| ProxyError::Internal(e.to_string()))
}

/// Client-leg online mode: the proxy's own key exchange plus a `hasJoined` check.
async fn verify_client(
    ctx: &ProxyContext,
    session: &Arc<Session>,
    client: &mut FramedConn,
    hello: &LoginHello,
    client_version: ProtocolVersion,
) -> Result<GameProfile, ProxyError> {
    let keys = ctx
        .proxy_keys
        .as_ref()
        .ok_or_else(|| ProxyError::Internal("online mode without a proxy keypair".into()))?;
    let token = crypto::random_verify_token();
    client
        .send(
            &EncryptionRequest {
                server_id: String::new(),
                public_key: keys.public_der().to_vec(),
                verify_token: token.to_vec(),
                should_authenticate: true,
            }
            .encode(client_version),
        )
        .await?;

    let p = read_client(client, ctx.cfg.timeouts.handshake).await?;
    if p.id != ids::LOGIN_ENCRYPTION_RESPONSE {
        return Err(ProxyError::Protocol(format!(
            "expected encryption response, got packet {:#04x}",
            p.id
        )));
    }
    let resp = EncryptionResponse::decode(&p, client_version)?;
    let token_ok = match &resp.proof {
        TokenProof::Encrypted(t) => keys
            .decrypt(t)
            .map(|plain| plain == token)
            .unwrap_or(false),
        TokenProof::Signed { salt, signature } => match &hello.key {
            Some(k) => crypto::verify_signed_nonce(&k.public_key, &token, *salt, signature)
                .unwrap_or(false),
            None => false,
        },
    };
    if !token_ok {
        tracing::warn!(sid = %session.id(), client = %session.client_addr(), "login: invalid verify token");
        return Err(ProxyError::Protocol("invalid verify token".into()));
    }

    let secret = keys
        .decrypt(&resp.shared_secret)
        .map_err(|e| ProxyError::Protocol(format!("shared secret: {e}")))
        .and_then(|s| {
            crypto::shared_secret_from(&s).map_err(|e| ProxyError::Protocol(e.to_string()))
        })?;
    client.enable_encryption(&secret);
    session.mark_encrypted(Leg::Client);

    let hash = crypto::server_hash("", &secret, keys.public_der());
    match ctx.session_service.has_joined(&hello.name, &hash).await {
        Ok(Some(profile)) => {
            tracing::info!(sid = %session.id(), client = %session.client_addr(), name = %profile.name, "login: client session verified");
            Ok(profile)
        }
        Ok(None) => Err(AuthError::InvalidSession("session service does not know the join".into()).into()),
        Err(err) => Err(err.into()),
    }
}

fn backend_key_data(
    ctx: &ProxyContext,
    client_hello: &LoginHello,
    server_version: ProtocolVersion,
) -> Option<ProfileKeyData> {
    if !(ProtocolVersion::V1_19..ProtocolVersion::V1_19_3).contains(&server_version)
        || !ctx.cfg.chat_signing
    {
        return None;
    }
    match ctx.auth.player_key() {
        Some(key) => Some(ProfileKeyData {
            expires_at_ms: key.expires_at_ms,
            public_key: key.public_der.clone(),
            key_signature: key.key_signature.clone(),
        }),
        // Delegates that sign on the client's behalf reuse the client's own key.
        None => match ctx.auth {
            AuthStrategy::ClientMod { .. }
            | AuthStrategy::Companion { .. } => client_hello.key.clone(),
            _ => None,
        },
    }
}

async fn connect_backend(
    ctx: &ProxyContext,
    session: &Arc<Session>,
    backend_addr: &str,
    client_version: ProtocolVersion,
) -> Result<FramedConn, ProxyError> {
    let init = |stage| LegInit {
        stage,
        client_addr: session.client_addr(),
        legacy: false,
    };
    let pre = dispatch(ctx, |h| h.backend_leg_init(&init(Stage::Pre)))?;
    if pre.cancelled {
        return Err(ProxyError::Kick(
            pre.message.unwrap_or_else(|| session::BACKEND_UNAVAILABLE_MESSAGE.into()),
        ));
    }

    let mut stream = net::dial_tcp(backend_addr, ctx.cfg.timeouts.connect)
        .await
        .map_err(|e| ProxyError::BackendUnavailable(format!("{e:#}")))?;

    if ctx.cfg.backend_haproxy {
        let dst = stream
            .peer_addr()
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
        net::write_proxy_proto_v2(&mut stream, session.client_addr(), dst, client_version)
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("{e:#}")))?;
    }

    let post = dispatch(ctx, |h| h.backend_leg_init(&init(Stage::Post)))?;
    if post.cancelled {
        return Err(ProxyError::Kick(
            post.message.unwrap_or_else(|| session::BACKEND_UNAVAILABLE_MESSAGE.into()),
        ));
    }
    if let Some(filter) = post.replacement.or(pre.replacement) {
        session.set_filter(Leg::Backend, filter);
    }

    FramedConn::new(stream, BytesMut::new()).map_err(|e| ProxyError::BackendUnavailable(e.to_string()))
}

#[allow(clippy::too_many_arguments)]
async fn backend_login(
    ctx: &ProxyContext,
    session: &Arc<Session>,
    client: &mut FramedConn,
    backend: &mut FramedConn,
    identity: &Identity,
    signs_nonce: bool,
    client_version: ProtocolVersion,
    server_version: ProtocolVersion,
) -> Result<LoginSuccess, ProxyError> {
    loop {
        let p = read_backend(backend, ctx.cfg.timeouts.handshake).await?;
        match p.id {
            ids::LOGIN_DISCONNECT => {
                let raw = packets::decode_login_disconnect(&p)?;
                let text = packets::component_plain_text(&raw);
                tracing::info!(sid = %session.id(), client = %session.client_addr(), identity = %identity, reason = %text, "login: backend kicked");
                return Err(ProxyError::Kick(text));
            }
            ids::LOGIN_ENCRYPTION_REQUEST => {
                let req = EncryptionRequest::decode(&p, server_version)?;
                let secret = crypto::random_secret();
                let hash = crypto::server_hash(&req.server_id, &secret, &req.public_key);

                if req.should_authenticate {
                    let join = dispatch(ctx, |h| {
                        h.join_server(&JoinServer {
                            client_addr: session.client_addr(),
                            server_hash: hash.clone(),
                            username: Some(identity.name.clone()),
                        })
                    })?;
                    if join.cancelled {
                        return Err(ProxyError::Kick(
                            join.message.unwrap_or_else(|| "Join was cancelled.".into()),
                        ));
                    }
                    ctx.auth
                        .authenticate(client, client_version, &hash)
                        .await
                        .inspect_err(|e| {
                            tracing::warn!(sid = %session.id(), client = %session.client_addr(), identity = %identity, method = ctx.auth.name(), err = %e, "login: authentication failed");
                        })?;
                }

                let encrypt = |data: &[u8]| {
                    crypto::encrypt_for(&req.public_key, data)
                        .map_err(|e| ProxyError::Protocol(format!("backend public key: {e}")))
                };
                let proof = if signs_nonce
                    && (ProtocolVersion::V1_19..ProtocolVersion::V1_19_3).contains(&server_version)
                {
                    let (salt, signature) = ctx
                        .auth
                        .sign_nonce(client, client_version, &req.verify_token)
                        .await?;
                    TokenProof::Signed { salt, signature }
                } else {
                    TokenProof::Encrypted(encrypt(&req.verify_token)?)
                };
                let resp = EncryptionResponse {
                    shared_secret: encrypt(&secret)?,
                    proof,
                };
                backend
                    .send(&resp.encode(server_version))
                    .await
                    .map_err(backend_err)?;
                backend.enable_encryption(&secret);
                session.mark_encrypted(Leg::Backend);
            }
            ids::LOGIN_SET_COMPRESSION => {
                let threshold = packets::decode_set_compression(&p)?;
                let t = (threshold >= 0).then_some(threshold);
                backend.set_compression(t);
                session.set_compression(Leg::Backend, t);
            }
            ids::LOGIN_SUCCESS => {
                return Ok(LoginSuccess::decode(&p, server_version)?);
            }
            ids::LOGIN_PLUGIN_REQUEST => {
                let req = PluginRequest::decode(&p)?;
                let resp = if client_version >= ProtocolVersion::V1_13 {
                    relay_plugin_request(client, &req, ctx.cfg.timeouts.handshake).await?
                } else {
                    PluginResponse {
                        message_id: req.message_id,
                        data: None,
                    }
                };
                backend.send(&resp.encode()).await.map_err(backend_err)?;
            }
            ids::LOGIN_COOKIE_REQUEST if server_version >= ProtocolVersion::V1_20_5 => {
                let key = packets::decode_cookie_request(&p)?;
                let resp = if client_version >= ProtocolVersion::V1_20_5 {
                    relay_cookie_request(client, &key, ctx.cfg.timeouts.handshake).await?
                } else {
                    packets::cookie_response(&key, session.cookie(&key).as_deref())
                };
                backend.send(&resp).await.map_err(backend_err)?;
            }
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unexpected backend login packet {other:#04x}"
                )));
            }
        }
    }
}

async fn relay_plugin_request(
    client: &mut FramedConn,
    req: &PluginRequest,
    timeout: Duration,
) -> Result<PluginResponse, ProxyError> {
    client.send(&req.encode()).await?;
    loop {
        let p = read_client(client, timeout).await?;
        if p.id != ids::LOGIN_PLUGIN_RESPONSE {
            continue;
        }
        let resp = PluginResponse::decode(&p)?;
        if resp.message_id == req.message_id {
            return Ok(resp);
        }
    }
}

async fn relay_cookie_request(
    client: &mut FramedConn,
    key: &str,
    timeout: Duration,
) -> Result<Packet, ProxyError> {
    client.send(&packets::cookie_request(key)).await?;
    loop {
        let p = read_client(client, timeout).await?;
        if p.id == ids::LOGIN_COOKIE_RESPONSE {
            return Ok(p);
        }
    }
}

/// Client-facing end of the login, then both legs go to the pumps.
async fn finish(
    ctx: &ProxyContext,
    session: &Arc<Session>,
    mut client: FramedConn,
    negotiated: Negotiated,
) -> Result<(), ProxyError> {
    let Negotiated {
        mut backend,
        success,
    } = negotiated;
    let client_version = session.client_version();
    let server_version = session.server_version().unwrap_or(client_version);

    if let Some(threshold) = ctx.cfg.compression_threshold
        && session.settings(Leg::Client).compression.is_none()
        && client_version >= ProtocolVersion::V1_8
    {
        client.send(&packets::set_compression(threshold)).await?;
        client.set_compression(Some(threshold));
        session.set_compression(Leg::Client, Some(threshold));
    }

    client.send(&success.encode(client_version)).await?;
    session.set_identity(Identity {
        name: success.name.clone(),
        uuid: Some(success.uuid),
    });

    let client_acks = client_version >= ProtocolVersion::V1_20_2;
    let backend_acks = server_version >= ProtocolVersion::V1_20_2;
    if client_acks {
        loop {
            let p = read_client(&mut client, ctx.cfg.timeouts.handshake).await?;
            if p.id == ids::LOGIN_ACKNOWLEDGED {
                break;
            }
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(sid = %session.id(), id = p.id, "login: dropping packet before login acknowledged");
            }
        }
    }
    if backend_acks {
        backend
            .send(&packets::login_acknowledged())
            .await
            .map_err(backend_err)?;
    }

    session.set_phase(Leg::Client, Phase::after_login(client_version));
    session.set_phase(Leg::Backend, Phase::after_login(server_version));

    if ctx.cfg.chat_signing
        && let (Some(key), Some(uuid)) = (ctx.auth.player_key(), nonzero(success.uuid))
    {
        match ChatSession::for_backend(uuid, key.clone(), server_version) {
            Ok(chat) => session.set_chat(chat),
            Err(err) => {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(sid = %session.id(), err = %err, "login: chat signing not available");
                }
            }
        }
    }

    let (br, bw) = backend.into_split();
    session::start_leg(session, Leg::Backend, br, bw).await?;
    let (cr, cw) = client.into_split();
    session::start_leg(session, Leg::Client, cr, cw).await?;
    session.advance(ConnectionState::Play)?;
    session.resume_client_reads();
    Ok(())
}

fn nonzero(id: Uuid) -> Option<Uuid> {
    (!id.is_nil()).then_some(id)
}

fn backend_err(e: WireError) -> ProxyError {
    if e.is_disconnect() {
        ProxyError::BackendUnavailable(format!("backend closed during login: {e}"))
    } else {
        ProxyError::Protocol(format!("backend: {e}"))
    }
}

async fn read_client(client: &mut FramedConn, timeout: Duration) -> Result<Packet, ProxyError> {
    match time::timeout(timeout, client.read_packet()).await {
        Ok(Ok(Some(p))) => Ok(p),
        Ok(Ok(None)) => Err(ProxyError::TransportClosed),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ProxyError::Protocol("client login timed out".into())),
    }
}

async fn read_backend(backend: &mut FramedConn, timeout: Duration) -> Result<Packet, ProxyError> {
    match time::timeout(timeout, backend.read_packet()).await {
        Ok(Ok(Some(p))) => Ok(p),
        Ok(Ok(None)) => Err(ProxyError::BackendUnavailable(
            "backend closed during login".into(),
        )),
        Ok(Err(e)) => Err(backend_err(e)),
        Err(_) => Err(ProxyError::BackendUnavailable("backend login timed out".into())),
    }
}
