//! The seam where a packet-remapping engine plugs in. The proxy owns framing, encryption,
//! compression and session state; a [`Translator`] only sees decoded packets and reports the
//! protocol events the session has to act on.

use crate::refract::{
    chat::{ChatError, ChatSession, DecoratableMessage, LastSeen, MessageMetadata},
    packets::{self, Phase, Transfer, relay_ids},
    version::ProtocolVersion,
    wire::Packet,
};

/// Which way a packet travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// client -> backend
    Serverbound,
    /// backend -> client
    Clientbound,
}

/// Per-packet view of the session handed to a [`Translator`]. Built under the session
/// lock, so signing through it advances the chat chain atomically with the relay.
#[derive(Debug)]
pub struct TranslateContext<'a> {
    pub client_version: ProtocolVersion,
    pub server_version: ProtocolVersion,
    /// Phase of the leg the packet was read from.
    pub phase: Phase,
    /// Chat chain of the session's identity, once signed chat is active.
    pub chat: Option<&'a mut ChatSession>,
}

impl TranslateContext<'_> {
    pub fn can_sign_chat(&self) -> bool {
        self.chat.is_some()
    }

    /// Signs a chat message for the backend and moves the chain forward.
    pub fn sign_chat(
        &mut self,
        meta: &MessageMetadata,
        message: &DecoratableMessage,
        last_seen: &[LastSeen],
    ) -> Result<Vec<u8>, ChatError> {
        self.chat
            .as_deref_mut()
            .ok_or(ChatError::NotSigned)?
            .sign(meta, message, last_seen)
    }

    /// Version spoken on the leg a packet arrived on.
    pub fn source_version(&self, dir: Direction) -> ProtocolVersion {
        match dir {
            Direction::Serverbound => self.client_version,
            Direction::Clientbound => self.server_version,
        }
    }
}

/// Protocol events the session reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineSignal {
    /// The backend asked the client to reconnect elsewhere.
    Transfer { host: String, port: u16 },
    /// The backend stored a cookie that must survive a transfer.
    StoreCookie { key: String, payload: Vec<u8> },
    /// Both legs moved to a new phase.
    Phase(Phase),
    /// The backend changed its compression threshold mid-session.
    Compression(i32),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Translated {
    pub packets: Vec<Packet>,
    pub signals: Vec<EngineSignal>,
}

impl Translated {
    pub fn relay(packet: Packet) -> Self {
        Self {
            packets: vec![packet],
            signals: Vec::new(),
        }
    }
}

pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    /// Maps one packet read from the `dir` source leg into zero or more packets for the other leg.
    fn translate(
        &self,
        ctx: &mut TranslateContext<'_>,
        dir: Direction,
        packet: Packet,
    ) -> anyhow::Result<Translated>;
}

/// Relays packets unchanged and only watches for the packets that carry session events.
/// Enough on its own when both legs speak the same version.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTranslator;

impl Translator for PassthroughTranslator {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn translate(
        &self,
        ctx: &mut TranslateContext<'_>,
        dir: Direction,
        packet: Packet,
    ) -> anyhow::Result<Translated> {
        let v = ctx.source_version(dir);
        let mut out = Translated::default();

        match (dir, ctx.phase) {
            (Direction::Clientbound, Phase::Configuration) => {
                if Some(packet.id) == relay_ids::config_transfer(v) {
                    let t = Transfer::decode(&packet)?;
                    out.signals.push(EngineSignal::Transfer {
                        host: t.host,
                        port: t.port,
                    });
                    return Ok(out);
                }
                if Some(packet.id) == relay_ids::config_store_cookie(v) {
                    let (key, payload) = packets::decode_store_cookie(&packet)?;
                    out.signals.push(EngineSignal::StoreCookie { key, payload });
                }
            }
            (Direction::Clientbound, Phase::Play) => {
                if Some(packet.id) == relay_ids::play_transfer(v) {
                    let t = Transfer::decode(&packet)?;
                    out.signals.push(EngineSignal::Transfer {
                        host: t.host,
                        port: t.port,
                    });
                    return Ok(out);
                }
                if Some(packet.id) == relay_ids::play_store_cookie(v) {
                    let (key, payload) = packets::decode_store_cookie(&packet)?;
                    out.signals.push(EngineSignal::StoreCookie { key, payload });
                }
            }
            // The client acknowledges phase switches, so that is when both legs move.
            (Direction::Serverbound, Phase::Configuration) => {
                if Some(packet.id) == relay_ids::finish_configuration(v) {
                    out.signals.push(EngineSignal::Phase(Phase::Play));
                }
            }
            (Direction::Serverbound, Phase::Play) => {
                if Some(packet.id) == configuration_ack_id(v) {
                    out.signals.push(EngineSignal::Phase(Phase::Configuration));
                }
            }
            _ => {}
        }

        out.packets.push(packet);
        Ok(out)
    }
}

/// Serverbound "configuration acknowledged" in play.
fn configuration_ack_id(v: ProtocolVersion) -> Option<i32> {
    if v >= ProtocolVersion::V1_20_5 {
        Some(0x0C)
    } else if v >= ProtocolVersion::V1_20_2 {
        Some(0x0B)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::refract::wire::PacketWriter;

    fn ctx(v: ProtocolVersion, phase: Phase) -> TranslateContext<'static> {
        TranslateContext {
            client_version: v,
            server_version: v,
            phase,
            chat: None,
        }
    }

    #[test]
    fn ordinary_packets_pass_unchanged() {
        let p = Packet::new(0x22, Bytes::from_static(b"abc"));
        let out = PassthroughTranslator
            .translate(
                &mut ctx(ProtocolVersion::V1_12_2, Phase::Play),
                Direction::Clientbound,
                p.clone(),
            )
            .unwrap();
        assert_eq!(out, Translated::relay(p));
    }

    #[test]
    fn transfer_is_consumed_and_signalled() {
        let v = ProtocolVersion::V1_21;
        let p = Transfer {
            host: "other.example".into(),
            port: 25570,
        }
        .encode(0x73);
        let out = PassthroughTranslator
            .translate(&mut ctx(v, Phase::Play), Direction::Clientbound, p)
            .unwrap();
        assert!(out.packets.is_empty());
        assert_eq!(
            out.signals,
            vec![EngineSignal::Transfer {
                host: "other.example".into(),
                port: 25570
            }]
        );
    }

    #[test]
    fn store_cookie_is_relayed_and_signalled() {
        let v = ProtocolVersion::V1_20_5;
        let mut w = PacketWriter::new();
        let p = w.string("k").byte_array(&[9, 9]).finish(0x0A);
        let out = PassthroughTranslator
            .translate(&mut ctx(v, Phase::Configuration), Direction::Clientbound, p.clone())
            .unwrap();
        assert_eq!(out.packets, vec![p]);
        assert_eq!(
            out.signals,
            vec![EngineSignal::StoreCookie {
                key: "k".into(),
                payload: vec![9, 9]
            }]
        );
    }

    #[test]
    fn finish_configuration_moves_to_play() {
        let v = ProtocolVersion::V1_20_2;
        let p = Packet::new(0x02, Bytes::new());
        let out = PassthroughTranslator
            .translate(&mut ctx(v, Phase::Configuration), Direction::Serverbound, p)
            .unwrap();
        assert_eq!(out.signals, vec![EngineSignal::Phase(Phase::Play)]);
    }
}
