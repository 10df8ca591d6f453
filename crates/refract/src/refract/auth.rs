//! Who the player is towards the backend, and how the proxy proves it.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};
use uuid::Uuid;

use crate::refract::{
    config::{AuthConfig, AuthMethod},
    crypto::{PlayerKey, random_salt},
    packets::{LoginHello, PluginRequest, PluginResponse, ProfileProperty, ids},
    version::ProtocolVersion,
    wire::{FramedConn, PacketReader, PacketWriter, WireError},
};

pub const OAM_JOIN_CHANNEL: &str = "oam:join";
pub const OAM_SIGN_NONCE_CHANNEL: &str = "oam:sign_nonce";

const OAM_MESSAGE_ID_BASE: i32 = 0x0A0A_0000;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("backend is in online mode and no authentication method is configured")]
    OnlineModeRequired,
    #[error("session server: {0}")]
    SessionServer(String),
    #[error("client mod did not answer on {channel}")]
    ClientModMissing { channel: &'static str },
    #[error("companion: {0}")]
    Companion(String),
    #[error("no key material to sign the nonce")]
    NonceUnsupported,
    #[error("client session could not be verified: {0}")]
    InvalidSession(String),
    #[error("client leg: {0}")]
    Client(#[from] WireError),
}

impl AuthError {
    /// Disconnect text shown to the player.
    pub fn user_reason(&self) -> &'static str {
        match self {
            AuthError::OnlineModeRequired => {
                "This server is in online mode and requires a valid authentication mode."
            }
            AuthError::SessionServer(_) => {
                "Failed to authenticate with Mojang servers! Please try again in a couple of seconds."
            }
            AuthError::ClientModMissing { .. } => {
                "Authentication cancelled! You need to install OpenAuthMod in order to join this server."
            }
            AuthError::Companion(_) => {
                "Authentication failed! The local authentication service did not respond."
            }
            AuthError::NonceUnsupported => {
                "This server requires a signed nonce. Please enable chat signing in the config and select a valid authentication mode."
            }
            AuthError::InvalidSession(_) => "Invalid session!",
            AuthError::Client(_) => "Authentication failed!",
        }
    }
}

/// The authenticated player as the backend will see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub name: String,
    pub uuid: Option<Uuid>,
}

impl Identity {
    pub fn from_hello(hello: &LoginHello) -> Self {
        Self {
            name: hello.name.clone(),
            uuid: hello.uuid,
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.uuid {
            Some(id) => write!(f, "{} ({})", self.name, id),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GameProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub properties: Vec<ProfilePropertyJson>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProfilePropertyJson {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub signature: Option<String>,
}

impl GameProfile {
    pub fn uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.id).ok()
    }

    pub fn login_properties(&self) -> Vec<ProfileProperty> {
        self.properties
            .iter()
            .map(|p| ProfileProperty {
                name: p.name.clone(),
                value: p.value.clone(),
                signature: p.signature.clone(),
            })
            .collect()
    }
}

/// The account session service (join / hasJoined).
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn join_server(
        &self,
        access_token: &str,
        profile: Uuid,
        server_id: &str,
    ) -> Result<(), AuthError>;

    /// `Ok(None)` when the service does not know the join.
    async fn has_joined(
        &self,
        username: &str,
        server_id: &str,
    ) -> Result<Option<GameProfile>, AuthError>;
}

pub type SharedSessionService = Arc<dyn SessionService>;

pub const DEFAULT_SESSION_SERVER: &str = "https://sessionserver.mojang.com";

pub struct HttpSessionService {
    http: reqwest::Client,
    base: String,
}

impl HttpSessionService {
    pub fn new(base: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("auth: build http client: {e}"))?;
        Ok(Self {
            http,
            base: base.trim().trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest<'a> {
    access_token: &'a str,
    selected_profile: String,
    server_id: &'a str,
}

#[async_trait]
impl SessionService for HttpSessionService {
    async fn join_server(
        &self,
        access_token: &str,
        profile: Uuid,
        server_id: &str,
    ) -> Result<(), AuthError> {
        let url = format!("{}/session/minecraft/join", self.base);
        let body = JoinRequest {
            access_token,
            selected_profile: profile.simple().to_string(),
            server_id,
        };
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::SessionServer(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AuthError::SessionServer(format!(
                "join returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn has_joined(
        &self,
        username: &str,
        server_id: &str,
    ) -> Result<Option<GameProfile>, AuthError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/session/minecraft/hasJoined", self.base),
            &[("username", username), ("serverId", server_id)],
        )
        .map_err(|e| AuthError::InvalidSession(e.to_string()))?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AuthError::InvalidSession(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(AuthError::InvalidSession(format!(
                "hasJoined returned {}",
                resp.status()
            )));
        }
        let profile = resp
            .json::<GameProfile>()
            .await
            .map_err(|e| AuthError::InvalidSession(e.to_string()))?;
        Ok(Some(profile))
    }
}

/// A configured account the proxy joins servers with.
#[derive(Clone)]
pub struct Account {
    pub name: String,
    pub uuid: Uuid,
    pub access_token: String,
    pub key: Option<PlayerKey>,
    pub service: SharedSessionService,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("key", &self.key.is_some())
            .finish_non_exhaustive()
    }
}

/// Exactly one of these is active, chosen by configuration.
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    /// The client's own identity is passed through unverified.
    None,
    Account(Account),
    Companion {
        addr: String,
        timeout: Duration,
    },
    ClientMod {
        join_timeout: Duration,
        sign_timeout: Duration,
    },
}

impl AuthStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            AuthStrategy::None => "none",
            AuthStrategy::Account(_) => "account",
            AuthStrategy::Companion { .. } => "companion",
            AuthStrategy::ClientMod { .. } => "openauthmod",
        }
    }

    /// Key material for signed chat, when the strategy carries any.
    pub fn player_key(&self) -> Option<&PlayerKey> {
        match self {
            AuthStrategy::Account(a) => a.key.as_ref(),
            _ => None,
        }
    }

    /// Identity the backend login uses.
    pub async fn identity(&self, hello: &LoginHello) -> Result<Identity, AuthError> {
        match self {
            AuthStrategy::Account(a) => Ok(Identity {
                name: a.name.clone(),
                uuid: Some(a.uuid),
            }),
            AuthStrategy::Companion { addr, timeout } => {
                let out = companion_call(addr, *timeout, "getusername", &[]).await?;
                match companion_success(&out) {
                    Some([name, ..]) if !name.is_empty() => Ok(Identity {
                        name: name.clone(),
                        uuid: hello.uuid,
                    }),
                    _ => Ok(Identity::from_hello(hello)),
                }
            }
            AuthStrategy::None | AuthStrategy::ClientMod { .. } => Ok(Identity::from_hello(hello)),
        }
    }

    /// Tells the session service the player is joining `server_hash`.
    pub async fn authenticate(
        &self,
        client: &mut FramedConn,
        client_version: ProtocolVersion,
        server_hash: &str,
    ) -> Result<(), AuthError> {
        match self {
            AuthStrategy::None => Err(AuthError::OnlineModeRequired),
            AuthStrategy::Account(a) => a
                .service
                .join_server(&a.access_token, a.uuid, server_hash)
                .await
                .map_err(|e| match e {
                    AuthError::SessionServer(_) => e,
                    other => AuthError::SessionServer(other.to_string()),
                }),
            AuthStrategy::Companion { addr, timeout } => {
                // The companion joins on its own; only a failed exchange is an error.
                companion_call(addr, *timeout, "authenticate", &[server_hash]).await?;
                Ok(())
            }
            AuthStrategy::ClientMod { join_timeout, .. } => {
                let mut data = PacketWriter::new();
                data.string(server_hash);
                let reply = oam_request(
                    client,
                    client_version,
                    OAM_JOIN_CHANNEL,
                    data.finish(0).body,
                    *join_timeout,
                )
                .await?;
                // An empty reply counts as success; an explicit false does not.
                if !reply.is_empty() && !PacketReader::new(&reply).bool()? {
                    return Err(AuthError::ClientModMissing {
                        channel: OAM_JOIN_CHANNEL,
                    });
                }
                Ok(())
            }
        }
    }

    /// Signs the backend's verify nonce: `(salt, signature)`.
    pub async fn sign_nonce(
        &self,
        client: &mut FramedConn,
        client_version: ProtocolVersion,
        nonce: &[u8],
    ) -> Result<(i64, Vec<u8>), AuthError> {
        match self {
            AuthStrategy::ClientMod { sign_timeout, .. } => {
                let mut data = PacketWriter::new();
                data.byte_array(nonce);
                let reply = oam_request(
                    client,
                    client_version,
                    OAM_SIGN_NONCE_CHANNEL,
                    data.finish(0).body,
                    *sign_timeout,
                )
                .await?;
                let mut r = PacketReader::new(&reply);
                if !r.bool()? {
                    return Err(AuthError::ClientModMissing {
                        channel: OAM_SIGN_NONCE_CHANNEL,
                    });
                }
                Ok((r.i64()?, r.byte_array()?))
            }
            AuthStrategy::Companion { addr, timeout } => {
                let encoded = B64.encode(nonce);
                let out = companion_call(addr, *timeout, "sign_nonce", &[&encoded]).await?;
                match companion_success(&out) {
                    Some([salt, sig, ..]) => {
                        let salt = salt
                            .parse::<i64>()
                            .map_err(|e| AuthError::Companion(format!("bad salt: {e}")))?;
                        let sig = B64
                            .decode(sig)
                            .map_err(|e| AuthError::Companion(format!("bad signature: {e}")))?;
                        Ok((salt, sig))
                    }
                    _ => Err(AuthError::Companion("nonce signing refused".into())),
                }
            }
            AuthStrategy::Account(Account { key: Some(key), .. }) => {
                let salt = random_salt();
                let sig = key
                    .sign_nonce(nonce, salt)
                    .map_err(|_| AuthError::NonceUnsupported)?;
                Ok((salt, sig))
            }
            AuthStrategy::Account(_) | AuthStrategy::None => Err(AuthError::NonceUnsupported),
        }
    }
}

/// Sends a login plugin request to the client mod and waits for its answer.
async fn oam_request(
    client: &mut FramedConn,
    client_version: ProtocolVersion,
    channel: &'static str,
    data: Bytes,
    timeout: Duration,
) -> Result<Bytes, AuthError> {
    if client_version < ProtocolVersion::V1_13 {
        return Err(AuthError::ClientModMissing { channel });
    }
    let message_id = OAM_MESSAGE_ID_BASE + random_salt().rem_euclid(0xFFFF) as i32;
    let req = PluginRequest {
        message_id,
        channel: channel.to_string(),
        data,
    };
    client.send(&req.encode()).await?;

    let wait = async {
        loop {
            let Some(p) = client.read_packet().await? else {
                return Err(AuthError::Client(WireError::Eof));
            };
            if p.id != ids::LOGIN_PLUGIN_RESPONSE {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(packet_id = p.id, "auth: ignoring packet while waiting for client mod");
                }
                continue;
            }
            let resp = PluginResponse::decode(&p)?;
            if resp.message_id != message_id {
                continue;
            }
            return match resp.data {
                Some(d) => Ok::<Bytes, AuthError>(d),
                None => Err(AuthError::ClientModMissing { channel }),
            };
        }
    };

    match time::timeout(timeout, wait).await {
        Ok(r) => r,
        Err(_) => Err(AuthError::ClientModMissing { channel }),
    }
}

fn put_java_utf(out: &mut Vec<u8>, s: &str) -> Result<(), AuthError> {
    let bytes = s.as_bytes();
    let len: u16 = bytes
        .len()
        .try_into()
        .map_err(|_| AuthError::Companion("string too long".into()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

async fn read_java_utf(conn: &mut TcpStream) -> std::io::Result<String> {
    let len = conn.read_u16().await?;
    let mut buf = vec![0u8; len as usize];
    conn.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Fields after the leading `"success"` marker, if the companion reported success.
fn companion_success(out: &[String]) -> Option<&[String]> {
    match out.split_first() {
        Some((status, rest)) if status == "success" => Some(rest),
        _ => None,
    }
}

/// One request/response exchange with the local companion process.
pub async fn companion_call(
    addr: &str,
    timeout: Duration,
    command: &str,
    args: &[&str],
) -> Result<Vec<String>, AuthError> {
    let mut req = Vec::with_capacity(64);
    put_java_utf(&mut req, command)?;
    req.extend_from_slice(&(args.len() as i32).to_be_bytes());
    for a in args {
        put_java_utf(&mut req, a)?;
    }

    let call = async {
        let mut conn = TcpStream::connect(addr).await?;
        conn.write_all(&req).await?;
        conn.flush().await?;
        let n = conn.read_i32().await?;
        if !(0..=64).contains(&n) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("response count {n}"),
            ));
        }
        let mut out = Vec::with_capacity(n as usize);
        for _ in 0..n {
            out.push(read_java_utf(&mut conn).await?);
        }
        Ok::<_, std::io::Error>(out)
    };

    match time::timeout(timeout, call).await {
        Ok(Ok(out)) => Ok(out),
        Ok(Err(e)) => Err(AuthError::Companion(format!("{command}: {e}"))),
        Err(_) => Err(AuthError::Companion(format!("{command}: timed out"))),
    }
}


impl AuthStrategy {
    /// Builds the configured strategy. An account's chat key is read from disk here.
    pub fn from_config(cfg: &AuthConfig, service: SharedSessionService) -> anyhow::Result<Self> {
        Ok(match cfg.method {
            AuthMethod::None => AuthStrategy::None,
            AuthMethod::Account => {
                let a = cfg
                    .account
                    .as_ref()
                    .context("auth: method = account needs an [auth.account] table")?;
                let key = match &a.key_file {
                    Some(path) => {
                        let pem = std::fs::read_to_string(path)
                            .with_context(|| format!("read {}", path.display()))?;
                        let key =
                            PlayerKey::from_pkcs8_pem(&pem, a.key_expires_at_ms, a.key_signature.clone())
                                .with_context(|| format!("auth: load chat key {}", path.display()))?;
                        Some(key)
                    }
                    None => None,
                };
                AuthStrategy::Account(Account {
                    name: a.name.clone(),
                    uuid: a.uuid,
                    access_token: a.access_token.clone(),
                    key,
                    service,
                })
            }
            AuthMethod::Companion => AuthStrategy::Companion {
                addr: cfg.companion.addr.clone(),
                timeout: cfg.companion.timeout,
            },
            AuthMethod::OpenAuthMod => AuthStrategy::ClientMod {
                join_timeout: cfg.openauthmod.join_timeout,
                sign_timeout: cfg.openauthmod.sign_nonce_timeout,
            },
        })
    }
}
