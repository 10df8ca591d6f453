//! Chat signing for the three schemes backends have used: unchained (1.19), header-chained
//! (1.19.1/1.19.2) and indexed (1.19.3+).

use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::refract::{
    crypto::{CryptoError, PlayerKey},
    version::ProtocolVersion,
};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat signing failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("chat chain is exhausted")]
    ChainExhausted,
    #[error("backend protocol {0} has no signed chat")]
    Unsupported(i32),
    #[error("chat signing is not active for this session")]
    NotSigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatScheme {
    Unchained,
    HeaderChained,
    Indexed,
}

impl ChatScheme {
    pub fn for_version(v: ProtocolVersion) -> Option<Self> {
        if v >= ProtocolVersion::V1_19_3 {
            Some(Self::Indexed)
        } else if v >= ProtocolVersion::V1_19_1 {
            Some(Self::HeaderChained)
        } else if v >= ProtocolVersion::V1_19 {
            Some(Self::Unchained)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMetadata {
    pub sender: Uuid,
    pub timestamp_ms: i64,
    pub salt: i64,
}

impl MessageMetadata {
    fn timestamp_secs(&self) -> i64 {
        self.timestamp_ms.div_euclid(1000)
    }
}

/// A message the client typed, plus the formatted form a server decorated it into.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoratableMessage {
    pub plain: String,
    pub decorated: Option<Value>,
}

impl DecoratableMessage {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            plain: text.into(),
            decorated: None,
        }
    }

    /// Decoration counts only if it renders differently from the plain text.
    pub fn is_decorated(&self) -> bool {
        match &self.decorated {
            None => false,
            Some(d) => normalize_component(d) != json!({ "text": self.plain }),
        }
    }

    fn signed_component(&self) -> Value {
        match &self.decorated {
            Some(d) if self.is_decorated() => normalize_component(d),
            _ => json!({ "text": self.plain }),
        }
    }
}

fn normalize_component(v: &Value) -> Value {
    match v {
        Value::String(s) => json!({ "text": s }),
        other => other.clone(),
    }
}

/// An entry of the client's last-seen list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSeen {
    pub sender: Uuid,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChainState {
    Unchained,
    Header {
        preceding: Option<Vec<u8>>,
    },
    Indexed {
        session_id: Uuid,
        next_index: i32,
        exhausted: bool,
    },
}

/// Signing state for one identity on one backend.
#[derive(Debug)]
pub struct ChatSession {
    identity: Uuid,
    key: PlayerKey,
    state: ChainState,
}

impl ChatSession {
    pub fn new(identity: Uuid, key: PlayerKey, scheme: ChatScheme) -> Self {
        let state = match scheme {
            ChatScheme::Unchained => ChainState::Unchained,
            ChatScheme::HeaderChained => ChainState::Header { preceding: None },
            ChatScheme::Indexed => ChainState::Indexed {
                session_id: Uuid::new_v4(),
                next_index: 0,
                exhausted: false,
            },
        };
        Self {
            identity,
            key,
            state,
        }
    }

    pub fn for_backend(identity: Uuid, key: PlayerKey, v: ProtocolVersion) -> Result<Self, ChatError> {
        let scheme = ChatScheme::for_version(v).ok_or(ChatError::Unsupported(v.raw()))?;
        Ok(Self::new(identity, key, scheme))
    }

    pub fn identity(&self) -> Uuid {
        self.identity
    }

    pub fn key(&self) -> &PlayerKey {
        &self.key
    }

    pub fn scheme(&self) -> ChatScheme {
        match self.state {
            ChainState::Unchained => ChatScheme::Unchained,
            ChainState::Header { .. } => ChatScheme::HeaderChained,
            ChainState::Indexed { .. } => ChatScheme::Indexed,
        }
    }

    /// Session id of the indexed link; `None` for the older schemes.
    pub fn session_id(&self) -> Option<Uuid> {
        match self.state {
            ChainState::Indexed { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Index the next signed message will carry.
    pub fn next_index(&self) -> Option<i32> {
        match self.state {
            ChainState::Indexed { next_index, .. } => Some(next_index),
            _ => None,
        }
    }

    pub fn preceding_signature(&self) -> Option<&[u8]> {
        match &self.state {
            ChainState::Header { preceding } => preceding.as_deref(),
            _ => None,
        }
    }

    /// Signs one chat message and advances the chain. The chain only moves after the
    /// signature was produced, so a failed signature leaves it untouched.
    pub fn sign(
        &mut self,
        meta: &MessageMetadata,
        message: &DecoratableMessage,
        last_seen: &[LastSeen],
    ) -> Result<Vec<u8>, ChatError> {
        match &mut self.state {
            ChainState::Unchained => {
                let data = unchained_payload(meta, message);
                Ok(self.key.sign(&data)?)
            }
            ChainState::Header { preceding } => {
                let data = header_payload(preceding.as_deref(), meta, message, last_seen);
                let sig = self.key.sign(&data)?;
                *preceding = Some(sig.clone());
                Ok(sig)
            }
            ChainState::Indexed {
                session_id,
                next_index,
                exhausted,
            } => {
                if *exhausted {
                    return Err(ChatError::ChainExhausted);
                }
                let data = indexed_payload(
                    *next_index,
                    self.identity,
                    *session_id,
                    meta,
                    message,
                    last_seen,
                );
                let sig = self.key.sign(&data)?;
                match next_index.checked_add(1) {
                    Some(n) => *next_index = n,
                    None => *exhausted = true,
                }
                Ok(sig)
            }
        }
    }
}

fn unchained_payload(meta: &MessageMetadata, message: &DecoratableMessage) -> Vec<u8> {
    // serde_json maps are ordered, so the component serializes with sorted keys.
    let component = message.signed_component().to_string();
    let mut out = Vec::with_capacity(40 + component.len());
    out.extend_from_slice(&meta.salt.to_be_bytes());
    out.extend_from_slice(meta.sender.as_bytes());
    out.extend_from_slice(&meta.timestamp_secs().to_be_bytes());
    out.extend_from_slice(component.as_bytes());
    out
}

fn header_payload(
    preceding: Option<&[u8]>,
    meta: &MessageMetadata,
    message: &DecoratableMessage,
    last_seen: &[LastSeen],
) -> Vec<u8> {
    let mut body = Sha256::new();
    body.update(meta.salt.to_be_bytes());
    body.update(meta.timestamp_secs().to_be_bytes());
    body.update(message.plain.as_bytes());
    body.update([70u8]);
    if message.is_decorated() {
        body.update(message.signed_component().to_string().as_bytes());
    }
    for seen in last_seen {
        body.update([70u8]);
        body.update(seen.sender.as_bytes());
        body.update(&seen.signature);
    }
    let body_hash = body.finalize();

    let mut out = Vec::with_capacity(preceding.map_or(0, <[u8]>::len) + 16 + body_hash.len());
    if let Some(p) = preceding {
        out.extend_from_slice(p);
    }
    out.extend_from_slice(meta.sender.as_bytes());
    out.extend_from_slice(&body_hash);
    out
}

/// The link record carries the chain owner's id; `meta.sender` is not part of it.
fn indexed_payload(
    index: i32,
    owner: Uuid,
    session_id: Uuid,
    meta: &MessageMetadata,
    message: &DecoratableMessage,
    last_seen: &[LastSeen],
) -> Vec<u8> {
    let content = message.plain.as_bytes();
    let mut out = Vec::with_capacity(64 + content.len() + last_seen.len() * 256);
    out.extend_from_slice(&1i32.to_be_bytes());
    out.extend_from_slice(owner.as_bytes());
    out.extend_from_slice(session_id.as_bytes());
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(&meta.salt.to_be_bytes());
    out.extend_from_slice(&meta.timestamp_secs().to_be_bytes());
    out.extend_from_slice(&(content.len() as i32).to_be_bytes());
    out.extend_from_slice(content);
    out.extend_from_slice(&(last_seen.len() as i32).to_be_bytes());
    for seen in last_seen {
        out.extend_from_slice(&seen.signature);
    }
    out
}
