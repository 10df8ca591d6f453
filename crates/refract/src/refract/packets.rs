//! Packet layouts the proxy itself has to understand: handshake, status, login and the few
//! configuration/play packets that drive transfers and disconnects. Everything else is
//! relayed opaquely through the translation engine.

use bytes::Bytes;
use serde_json::json;
use uuid::Uuid;

use crate::refract::{
    version::ProtocolVersion as V,
    wire::{Packet, PacketReader, PacketWriter, WireError},
};

pub mod ids {
    pub const HANDSHAKE: i32 = 0x00;

    pub const STATUS_REQUEST: i32 = 0x00;
    pub const STATUS_RESPONSE: i32 = 0x00;
    pub const STATUS_PING: i32 = 0x01;

    pub const LOGIN_DISCONNECT: i32 = 0x00;
    pub const LOGIN_ENCRYPTION_REQUEST: i32 = 0x01;
    pub const LOGIN_SUCCESS: i32 = 0x02;
    pub const LOGIN_SET_COMPRESSION: i32 = 0x03;
    pub const LOGIN_PLUGIN_REQUEST: i32 = 0x04;
    pub const LOGIN_COOKIE_REQUEST: i32 = 0x05;

    pub const LOGIN_HELLO: i32 = 0x00;
    pub const LOGIN_ENCRYPTION_RESPONSE: i32 = 0x01;
    pub const LOGIN_PLUGIN_RESPONSE: i32 = 0x02;
    pub const LOGIN_ACKNOWLEDGED: i32 = 0x03;
    pub const LOGIN_COOKIE_RESPONSE: i32 = 0x04;
}

/// Handshake intent (next state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Status,
    Login,
    Transfer,
}

impl Intent {
    pub fn from_raw(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Status),
            2 => Some(Self::Login),
            3 => Some(Self::Transfer),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            Intent::Status => 1,
            Intent::Login => 2,
            Intent::Transfer => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub address: String,
    pub port: u16,
    pub intent: i32,
}

impl Handshake {
    pub fn decode(p: &Packet) -> Result<Self, WireError> {
        let mut r = p.reader();
        Ok(Self {
            protocol_version: r.varint()?,
            address: r.string()?,
            port: r.u16()?,
            intent: r.varint()?,
        })
    }

    pub fn encode(&self) -> Packet {
        PacketWriter::new()
            .varint(self.protocol_version)
            .string(&self.address)
            .u16(self.port)
            .varint(self.intent)
            .finish(ids::HANDSHAKE)
    }
}

pub fn status_request() -> Packet {
    Packet::new(ids::STATUS_REQUEST, Bytes::new())
}

pub fn status_response(json: &str) -> Packet {
    PacketWriter::new()
        .string(json)
        .finish(ids::STATUS_RESPONSE)
}

pub fn decode_status_response(p: &Packet) -> Result<String, WireError> {
    p.reader().string()
}

/// Status JSON shown when a pinging client is turned away.
pub fn status_kick_json(message: &str) -> String {
    json!({
        "players": {"max": 0, "online": 0},
        "description": message,
        "version": {"protocol": -1, "name": "Refract"},
    })
    .to_string()
}

/// Chat-key data carried in the 1.19 / 1.19.1 login hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileKeyData {
    pub expires_at_ms: i64,
    pub public_key: Vec<u8>,
    pub key_signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginHello {
    pub name: String,
    pub uuid: Option<Uuid>,
    pub key: Option<ProfileKeyData>,
}

impl LoginHello {
    pub fn decode(p: &Packet, v: V) -> Result<Self, WireError> {
        let mut r = p.reader();
        let name = r.string()?;
        let mut out = Self {
            name,
            uuid: None,
            key: None,
        };
        if v >= V::V1_20_2 {
            out.uuid = Some(r.uuid()?);
        } else if v >= V::V1_19_3 {
            if r.bool()? {
                out.uuid = Some(r.uuid()?);
            }
        } else if v >= V::V1_19 {
            if r.bool()? {
                out.key = Some(ProfileKeyData {
                    expires_at_ms: r.i64()?,
                    public_key: r.byte_array()?,
                    key_signature: r.byte_array()?,
                });
            }
            if v >= V::V1_19_1 && !r.is_empty() && r.bool()? {
                out.uuid = Some(r.uuid()?);
            }
        }
        Ok(out)
    }

    pub fn encode(&self, v: V) -> Packet {
        let mut w = PacketWriter::new();
        w.string(&self.name);
        if v >= V::V1_20_2 {
            w.uuid(self.uuid.unwrap_or_else(Uuid::nil));
        } else if v >= V::V1_19_3 {
            w.bool(self.uuid.is_some());
            if let Some(id) = self.uuid {
                w.uuid(id);
            }
        } else if v >= V::V1_19 {
            w.bool(self.key.is_some());
            if let Some(k) = &self.key {
                w.i64(k.expires_at_ms)
                    .byte_array(&k.public_key)
                    .byte_array(&k.key_signature);
            }
            if v >= V::V1_19_1 {
                w.bool(self.uuid.is_some());
                if let Some(id) = self.uuid {
                    w.uuid(id);
                }
            }
        }
        w.finish(ids::LOGIN_HELLO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionRequest {
    pub server_id: String,
    pub public_key: Vec<u8>,
    pub verify_token: Vec<u8>,
    pub should_authenticate: bool,
}

impl EncryptionRequest {
    pub fn decode(p: &Packet, v: V) -> Result<Self, WireError> {
        let mut r = p.reader();
        let server_id = r.string()?;
        let (public_key, verify_token) = if v < V::V1_8 {
            (r.short_byte_array()?, r.short_byte_array()?)
        } else {
            (r.byte_array()?, r.byte_array()?)
        };
        let should_authenticate = if v >= V::V1_20_5 { r.bool()? } else { true };
        Ok(Self {
            server_id,
            public_key,
            verify_token,
            should_authenticate,
        })
    }

    pub fn encode(&self, v: V) -> Packet {
        let mut w = PacketWriter::new();
        w.string(&self.server_id);
        if v < V::V1_8 {
            w.short_byte_array(&self.public_key)
                .short_byte_array(&self.verify_token);
        } else {
            w.byte_array(&self.public_key)
                .byte_array(&self.verify_token);
        }
        if v >= V::V1_20_5 {
            w.bool(self.should_authenticate);
        }
        w.finish(ids::LOGIN_ENCRYPTION_REQUEST)
    }
}

/// What proves possession of the verify token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenProof {
    /// RSA-encrypted verify token.
    Encrypted(Vec<u8>),
    /// 1.19 / 1.19.1 only: salt plus a signature over the token.
    Signed { salt: i64, signature: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionResponse {
    pub shared_secret: Vec<u8>,
    pub proof: TokenProof,
}

impl EncryptionResponse {
    pub fn decode(p: &Packet, v: V) -> Result<Self, WireError> {
        let mut r = p.reader();
        if v < V::V1_8 {
            return Ok(Self {
                shared_secret: r.short_byte_array()?,
                proof: TokenProof::Encrypted(r.short_byte_array()?),
            });
        }
        let shared_secret = r.byte_array()?;
        let proof = if (V::V1_19..V::V1_19_3).contains(&v) && !r.bool()? {
            TokenProof::Signed {
                salt: r.i64()?,
                signature: r.byte_array()?,
            }
        } else {
            TokenProof::Encrypted(r.byte_array()?)
        };
        Ok(Self {
            shared_secret,
            proof,
        })
    }

    pub fn encode(&self, v: V) -> Packet {
        let mut w = PacketWriter::new();
        if v < V::V1_8 {
            let token = match &self.proof {
                TokenProof::Encrypted(t) => t.as_slice(),
                TokenProof::Signed { .. } => &[],
            };
            w.short_byte_array(&self.shared_secret)
                .short_byte_array(token);
            return w.finish(ids::LOGIN_ENCRYPTION_RESPONSE);
        }
        w.byte_array(&self.shared_secret);
        let signed_capable = (V::V1_19..V::V1_19_3).contains(&v);
        match &self.proof {
            TokenProof::Encrypted(t) => {
                if signed_capable {
                    w.bool(true);
                }
                w.byte_array(t);
            }
            TokenProof::Signed { salt, signature } => {
                if signed_capable {
                    w.bool(false).i64(*salt).byte_array(signature);
                } else {
                    w.byte_array(&[]);
                }
            }
        }
        w.finish(ids::LOGIN_ENCRYPTION_RESPONSE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileProperty {
    pub name: String,
    pub value: String,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    pub uuid: Uuid,
    pub name: String,
    pub properties: Vec<ProfileProperty>,
}

impl LoginSuccess {
    pub fn decode(p: &Packet, v: V) -> Result<Self, WireError> {
        let mut r = p.reader();
        let uuid = if v >= V::V1_16 {
            r.uuid()?
        } else {
            let s = r.string()?;
            Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
        };
        let name = r.string()?;
        let mut properties = Vec::new();
        if v >= V::V1_19 {
            let n = r.varint()?;
            for _ in 0..n.max(0) {
                let name = r.string()?;
                let value = r.string()?;
                let signature = if r.bool()? { Some(r.string()?) } else { None };
                properties.push(ProfileProperty {
                    name,
                    value,
                    signature,
                });
            }
        }
        Ok(Self {
            uuid,
            name,
            properties,
        })
    }

    pub fn encode(&self, v: V) -> Packet {
        let mut w = PacketWriter::new();
        if v >= V::V1_16 {
            w.uuid(self.uuid);
        } else if v >= V::V1_7_6 {
            w.string(&self.uuid.hyphenated().to_string());
        } else {
            w.string(&self.uuid.simple().to_string());
        }
        w.string(&self.name);
        if v >= V::V1_19 {
            w.varint(self.properties.len() as i32);
            for prop in &self.properties {
                w.string(&prop.name).string(&prop.value);
                w.bool(prop.signature.is_some());
                if let Some(sig) = &prop.signature {
                    w.string(sig);
                }
            }
        }
        if (V::V1_20_5..=V::V1_21).contains(&v) {
            // strict error handling
            w.bool(false);
        }
        w.finish(ids::LOGIN_SUCCESS)
    }
}

pub fn set_compression(threshold: i32) -> Packet {
    PacketWriter::new()
        .varint(threshold)
        .finish(ids::LOGIN_SET_COMPRESSION)
}

pub fn decode_set_compression(p: &Packet) -> Result<i32, WireError> {
    p.reader().varint()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRequest {
    pub message_id: i32,
    pub channel: String,
    pub data: Bytes,
}

impl PluginRequest {
    pub fn decode(p: &Packet) -> Result<Self, WireError> {
        let mut r = p.reader();
        let message_id = r.varint()?;
        let channel = r.string()?;
        Ok(Self {
            message_id,
            channel,
            data: Bytes::copy_from_slice(r.remaining()),
        })
    }

    pub fn encode(&self) -> Packet {
        PacketWriter::new()
            .varint(self.message_id)
            .string(&self.channel)
            .bytes(&self.data)
            .finish(ids::LOGIN_PLUGIN_REQUEST)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginResponse {
    pub message_id: i32,
    /// `None` means the client did not understand the channel.
    pub data: Option<Bytes>,
}

impl PluginResponse {
    pub fn decode(p: &Packet) -> Result<Self, WireError> {
        let mut r = p.reader();
        let message_id = r.varint()?;
        let data = if r.bool()? {
            Some(Bytes::copy_from_slice(r.remaining()))
        } else {
            None
        };
        Ok(Self { message_id, data })
    }

    pub fn encode(&self) -> Packet {
        let mut w = PacketWriter::new();
        w.varint(self.message_id).bool(self.data.is_some());
        if let Some(d) = &self.data {
            w.bytes(d);
        }
        w.finish(ids::LOGIN_PLUGIN_RESPONSE)
    }
}

pub fn decode_cookie_request(p: &Packet) -> Result<String, WireError> {
    p.reader().string()
}

pub fn cookie_request(key: &str) -> Packet {
    PacketWriter::new()
        .string(key)
        .finish(ids::LOGIN_COOKIE_REQUEST)
}

pub fn cookie_response(key: &str, payload: Option<&[u8]>) -> Packet {
    let mut w = PacketWriter::new();
    w.string(key).bool(payload.is_some());
    if let Some(b) = payload {
        w.byte_array(b);
    }
    w.finish(ids::LOGIN_COOKIE_RESPONSE)
}

pub fn login_acknowledged() -> Packet {
    Packet::new(ids::LOGIN_ACKNOWLEDGED, Bytes::new())
}

pub fn login_disconnect(message: &str) -> Packet {
    PacketWriter::new()
        .string(&text_json(message))
        .finish(ids::LOGIN_DISCONNECT)
}

pub fn decode_login_disconnect(p: &Packet) -> Result<String, WireError> {
    p.reader().string()
}

pub fn text_json(message: &str) -> String {
    json!({ "text": message }).to_string()
}

/// Best-effort plain text of a JSON chat component, for logs and re-kicks.
pub fn component_plain_text(raw: &str) -> String {
    fn walk(v: &serde_json::Value, out: &mut String) {
        match v {
            serde_json::Value::String(s) => out.push_str(s),
            serde_json::Value::Array(items) => items.iter().for_each(|i| walk(i, out)),
            serde_json::Value::Object(map) => {
                if let Some(t) = map.get("text") {
                    walk(t, out);
                } else if let Some(t) = map.get("translate") {
                    walk(t, out);
                }
                if let Some(extra) = map.get("extra") {
                    walk(extra, out);
                }
            }
            _ => {}
        }
    }

    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v) => {
            let mut out = String::new();
            walk(&v, &mut out);
            out
        }
        Err(_) => raw.to_string(),
    }
}

/// Network NBT (no root name) compound `{text: message}`.
pub fn text_nbt(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 16);
    out.push(0x0A);
    out.push(0x08);
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(b"text");
    let bytes = message.as_bytes();
    out.extend_from_slice(&(bytes.len().min(u16::MAX as usize) as u16).to_be_bytes());
    out.extend_from_slice(&bytes[..bytes.len().min(u16::MAX as usize)]);
    out.push(0x00);
    out
}

/// Protocol phase a leg is in; unlike the session lifecycle this one can move back
/// (play -> configuration on 1.20.2+).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Handshake,
    Status,
    Login,
    Configuration,
    Play,
}

impl Phase {
    /// Phase a leg enters right after login success.
    pub fn after_login(v: V) -> Self {
        if v >= V::V1_20_2 {
            Phase::Configuration
        } else {
            Phase::Play
        }
    }
}

fn play_disconnect_id(v: V) -> i32 {
    const TABLE: &[(i32, i32)] = &[
        (47, 0x40),
        (107, 0x1A),
        (393, 0x1B),
        (477, 0x1A),
        (573, 0x1B),
        (735, 0x1A),
        (751, 0x19),
        (755, 0x1A),
        (759, 0x17),
        (760, 0x19),
        (761, 0x17),
        (762, 0x1A),
        (764, 0x1B),
        (766, 0x1D),
    ];
    TABLE
        .iter()
        .rev()
        .find(|(from, _)| v.0 >= *from)
        .map(|(_, id)| *id)
        .unwrap_or(0x40)
}

fn configuration_disconnect_id(v: V) -> i32 {
    if v >= V::V1_20_5 { 0x02 } else { 0x01 }
}

/// Disconnect packet for a client in `phase`, or `None` where the phase has no such packet.
pub fn disconnect_for(phase: Phase, v: V, message: &str) -> Option<Packet> {
    match phase {
        Phase::Handshake => None,
        Phase::Status => Some(status_response(&status_kick_json(message))),
        Phase::Login => Some(login_disconnect(message)),
        Phase::Configuration | Phase::Play => {
            let id = if phase == Phase::Play {
                play_disconnect_id(v)
            } else {
                configuration_disconnect_id(v)
            };
            let mut w = PacketWriter::new();
            if v <= V::V1_20_2 {
                w.string(&text_json(message));
            } else {
                w.bytes(&text_nbt(message));
            }
            Some(w.finish(id))
        }
    }
}

/// Ids of the configuration/play packets that the relay watches for (1.20.2+).
pub mod relay_ids {
    use super::V;

    pub fn finish_configuration(v: V) -> Option<i32> {
        if v >= V::V1_20_5 {
            Some(0x03)
        } else if v >= V::V1_20_2 {
            Some(0x02)
        } else {
            None
        }
    }

    pub fn start_configuration(v: V) -> Option<i32> {
        if v >= V::V1_20_5 {
            Some(0x69)
        } else if v >= V::V1_20_3 {
            Some(0x67)
        } else if v >= V::V1_20_2 {
            Some(0x65)
        } else {
            None
        }
    }

    pub fn config_store_cookie(v: V) -> Option<i32> {
        (v >= V::V1_20_5).then_some(0x0A)
    }

    pub fn config_transfer(v: V) -> Option<i32> {
        (v >= V::V1_20_5).then_some(0x0B)
    }

    pub fn play_store_cookie(v: V) -> Option<i32> {
        (v >= V::V1_20_5).then_some(0x6B)
    }

    pub fn play_transfer(v: V) -> Option<i32> {
        (v >= V::V1_20_5).then_some(0x73)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub host: String,
    pub port: u16,
}

impl Transfer {
    pub fn decode(p: &Packet) -> Result<Self, WireError> {
        let mut r = p.reader();
        let host = r.string()?;
        let port = r.varint()?;
        Ok(Self {
            host,
            port: port.clamp(0, u16::MAX as i32) as u16,
        })
    }

    pub fn encode(&self, id: i32) -> Packet {
        PacketWriter::new()
            .string(&self.host)
            .varint(self.port as i32)
            .finish(id)
    }
}

pub fn decode_store_cookie(p: &Packet) -> Result<(String, Vec<u8>), WireError> {
    let mut r = PacketReader::new(&p.body);
    Ok((r.string()?, r.byte_array()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trip() {
        let hs = Handshake {
            protocol_version: 765,
            address: "play.example.com".into(),
            port: 25565,
            intent: 2,
        };
        assert_eq!(Handshake::decode(&hs.encode()).unwrap(), hs);
    }

    #[test]
    fn login_hello_layout_depends_on_version() {
        let id = Uuid::from_u128(42);
        let hello = LoginHello {
            name: "Steve".into(),
            uuid: Some(id),
            key: None,
        };

        let modern = hello.encode(V::V1_20_2);
        assert_eq!(modern.body.len(), 1 + 5 + 16);
        assert_eq!(LoginHello::decode(&modern, V::V1_20_2).unwrap(), hello);

        let legacy = hello.encode(V::V1_8);
        assert_eq!(legacy.body.len(), 1 + 5);
        assert_eq!(LoginHello::decode(&legacy, V::V1_8).unwrap().uuid, None);

        let v1191 = hello.encode(V::V1_19_1);
        assert_eq!(LoginHello::decode(&v1191, V::V1_19_1).unwrap(), hello);
    }

    #[test]
    fn signed_nonce_only_exists_on_1_19() {
        let resp = EncryptionResponse {
            shared_secret: vec![1; 128],
            proof: TokenProof::Signed {
                salt: 7,
                signature: vec![2; 128],
            },
        };
        let p = resp.encode(V::V1_19_1);
        assert_eq!(EncryptionResponse::decode(&p, V::V1_19_1).unwrap(), resp);

        let enc = EncryptionResponse {
            shared_secret: vec![1; 128],
            proof: TokenProof::Encrypted(vec![3; 128]),
        };
        let p = enc.encode(V::V1_20);
        assert_eq!(EncryptionResponse::decode(&p, V::V1_20).unwrap(), enc);
    }

    #[test]
    fn login_success_carries_properties_from_1_19() {
        let ok = LoginSuccess {
            uuid: Uuid::from_u128(7),
            name: "Alex".into(),
            properties: vec![ProfileProperty {
                name: "textures".into(),
                value: "abc".into(),
                signature: Some("sig".into()),
            }],
        };
        assert_eq!(LoginSuccess::decode(&ok.encode(V::V1_21), V::V1_21).unwrap(), ok);

        let old = LoginSuccess::decode(&ok.encode(V::V1_12_2), V::V1_12_2).unwrap();
        assert_eq!(old.uuid, ok.uuid);
        assert!(old.properties.is_empty());
    }

    #[test]
    fn disconnects_follow_client_phase_and_version() {
        let login = disconnect_for(Phase::Login, V::V1_21, "bye").unwrap();
        assert_eq!(login.id, ids::LOGIN_DISCONNECT);
        assert_eq!(decode_login_disconnect(&login).unwrap(), r#"{"text":"bye"}"#);

        let status = disconnect_for(Phase::Status, V::V1_8, "nope").unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&decode_status_response(&status).unwrap()).unwrap();
        assert_eq!(json["version"]["protocol"], -1);
        assert_eq!(json["description"], "nope");

        let play_json = disconnect_for(Phase::Play, V::V1_12_2, "x").unwrap();
        assert_eq!(play_json.id, 0x1A);
        assert_eq!(play_json.reader().string().unwrap(), r#"{"text":"x"}"#);

        let play_nbt = disconnect_for(Phase::Play, V::V1_21, "x").unwrap();
        assert_eq!(play_nbt.id, 0x1D);
        assert_eq!(&play_nbt.body[..], &text_nbt("x")[..]);

        let cfg = disconnect_for(Phase::Configuration, V::V1_20_2, "x").unwrap();
        assert_eq!(cfg.id, 0x01);

        assert!(disconnect_for(Phase::Handshake, V::V1_21, "x").is_none());
    }

    #[test]
    fn plain_text_of_components() {
        assert_eq!(
            component_plain_text(r#"{"text":"a","extra":[{"text":"b"},"c"]}"#),
            "abc"
        );
        assert_eq!(component_plain_text("not json"), "not json");
    }
}
