//! Server list ping: relaying it for clients and using it to learn a backend's version.

use std::time::Duration;

use bytes::BytesMut;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time;

use crate::refract::{
    net,
    packets::{self, Handshake, Intent, ids},
    session::{BACKEND_UNAVAILABLE_MESSAGE, ProxyError},
    version::ProtocolVersion,
    wire::{FramedConn, Packet, WireError},
};

pub const AUTO_DETECT_FAILED_MESSAGE: &str = "Automatic protocol detection failed!";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect: {0:#}")]
    Connect(anyhow::Error),
    #[error("probe: {0}")]
    Failed(String),
}

impl From<ProbeError> for ProxyError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Connect(err) => ProxyError::BackendUnavailable(format!("{err:#}")),
            ProbeError::Failed(_) => ProxyError::Kick(AUTO_DETECT_FAILED_MESSAGE.to_string()),
        }
    }
}

/// Learns the backend's protocol version from its status response.
///
/// The first probe announces the client's version; a backend that answers with a different
/// one is asked again with `-1`, which servers answer with their own version.
pub async fn probe_version(
    backend_addr: &str,
    client_version: ProtocolVersion,
    connect_timeout: Duration,
    timeout: Duration,
) -> Result<ProtocolVersion, ProbeError> {
    let mut reported =
        probe_once(backend_addr, client_version.raw(), connect_timeout, timeout).await?;
    if reported != client_version.raw() {
        reported = probe_once(backend_addr, -1, connect_timeout, timeout).await?;
    }
    let v = ProtocolVersion(reported);
    if !v.is_known() {
        return Err(ProbeError::Failed(format!("unsupported protocol version {reported}")));
    }
    Ok(v)
}

async fn probe_once(
    backend_addr: &str,
    announced: i32,
    connect_timeout: Duration,
    timeout: Duration,
) -> Result<i32, ProbeError> {
    let (host, port) =
        net::split_host_port(backend_addr).map_err(|e| ProbeError::Failed(format!("{e:#}")))?;
    let stream = net::dial_tcp(backend_addr, connect_timeout)
        .await
        .map_err(ProbeError::Connect)?;
    let mut conn =
        FramedConn::new(stream, BytesMut::new()).map_err(|e| ProbeError::Failed(e.to_string()))?;

    let handshake = Handshake {
        protocol_version: announced,
        address: host,
        port,
        intent: Intent::Status.raw(),
    }
    .encode();
    let request = packets::status_request();
    let response = time::timeout(timeout, status_exchange(&mut conn, &handshake, &request))
        .await
        .map_err(|_| ProbeError::Failed("status response timed out".into()))?
        .map_err(|e| ProbeError::Failed(e.to_string()))?;
    let json = packets::decode_status_response(&response)
        .map_err(|e| ProbeError::Failed(e.to_string()))?;

    reported_protocol(&json).ok_or_else(|| ProbeError::Failed("no version.protocol in status".into()))
}

fn reported_protocol(json: &str) -> Option<i32> {
    let v: Value = serde_json::from_str(json).ok()?;
    let n = v.get("version")?.get("protocol")?.as_i64()?;
    i32::try_from(n).ok()
}

/// Replaces the MOTD of a status response. Unparseable responses pass through.
pub fn rewrite_motd(json: &str, motd: &str) -> String {
    match serde_json::from_str::<Value>(json) {
        Ok(mut v) => match v.as_object_mut() {
            Some(obj) => {
                obj.insert("description".into(), json!({ "text": motd }));
                v.to_string()
            }
            None => json.to_string(),
        },
        Err(_) => json.to_string(),
    }
}

/// Relays one server list ping for a client that already sent its status handshake.
/// The exchange ends after the pong; the caller closes the connection.
pub async fn relay_status(
    client: &mut FramedConn,
    handshake: &Handshake,
    backend_addr: &str,
    custom_motd: Option<&str>,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<(), ProxyError> {
    let request = read_client(client, io_timeout).await?;
    if request.id != ids::STATUS_REQUEST {
        return Err(ProxyError::Protocol(format!(
            "expected status request, got packet {:#04x}",
            request.id
        )));
    }

    let mut backend = match net::dial_tcp(backend_addr, connect_timeout).await {
        Ok(stream) => FramedConn::new(stream, BytesMut::new())
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?,
        Err(err) => {
            tracing::warn!(client = %client.peer, backend = %backend_addr, err = %format!("{err:#}"), "status: backend unavailable");
            let kick = packets::status_kick_json(BACKEND_UNAVAILABLE_MESSAGE);
            client.send(&packets::status_response(&kick)).await?;
            return answer_ping_locally(client, io_timeout).await;
        }
    };

    let backend_handshake = handshake.encode();
    let response = time::timeout(
        io_timeout,
        status_exchange(&mut backend, &backend_handshake, &request),
    )
    .await
    .map_err(|_| ProxyError::BackendUnavailable("status response timed out".into()))??;

    let response = match custom_motd.filter(|m| !m.is_empty()) {
        Some(motd) => {
            let json = packets::decode_status_response(&response)?;
            packets::status_response(&rewrite_motd(&json, motd))
        }
        None => response,
    };
    client.send(&response).await?;

    let ping = match read_client_opt(client, io_timeout).await? {
        Some(p) => p,
        None => return Ok(()),
    };
    if ping.id != ids::STATUS_PING {
        return Err(ProxyError::Protocol(format!(
            "expected ping, got packet {:#04x}",
            ping.id
        )));
    }
    let pong = time::timeout(io_timeout, round_trip(&mut backend, &ping)).await;
    match pong {
        Ok(Ok(Some(p))) if p.id == ids::STATUS_PING => client.send(&p).await?,
        // Backends that hang up after the response still get the client a pong.
        _ => client.send(&ping).await?,
    }
    backend.writer.shutdown().await;
    Ok(())
}

/// Sends the handshake and request, then waits for the status response.
async fn status_exchange(
    conn: &mut FramedConn,
    handshake: &Packet,
    request: &Packet,
) -> Result<Packet, WireError> {
    conn.send(handshake).await?;
    conn.send(request).await?;
    loop {
        match conn.read_packet().await? {
            Some(p) if p.id == ids::STATUS_RESPONSE => return Ok(p),
            Some(_) => continue,
            None => return Err(WireError::TruncatedFrame),
        }
    }
}

async fn round_trip(conn: &mut FramedConn, packet: &Packet) -> Result<Option<Packet>, WireError> {
    conn.send(packet).await?;
    conn.read_packet().await
}

async fn answer_ping_locally(client: &mut FramedConn, io_timeout: Duration) -> Result<(), ProxyError> {
    if let Some(ping) = read_client_opt(client, io_timeout).await?
        && ping.id == ids::STATUS_PING
    {
        client.send(&ping).await?;
    }
    Ok(())
}

async fn read_client(client: &mut FramedConn, io_timeout: Duration) -> Result<Packet, ProxyError> {
    read_client_opt(client, io_timeout)
        .await?
        .ok_or(ProxyError::TransportClosed)
}

async fn read_client_opt(
    client: &mut FramedConn,
    io_timeout: Duration,
) -> Result<Option<Packet>, ProxyError> {
    time::timeout(io_timeout, client.read_packet())
        .await
        .map_err(|_| ProxyError::Protocol("client status timed out".into()))?
        .map_err(ProxyError::from)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::refract::wire::PacketWriter;

    /// Status-only backend that records the announced versions.
    async fn fake_backend(protocol: i32, seen: Arc<Mutex<Vec<i32>>>) -> String {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = ln.accept().await else { return };
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut c = FramedConn::new(stream, BytesMut::new()).unwrap();
                    let hs = Handshake::decode(&c.read_packet().await.unwrap().unwrap()).unwrap();
                    seen.lock().unwrap().push(hs.protocol_version);
                    let _req = c.read_packet().await.unwrap().unwrap();
                    let body = json!({
                        "version": {"name": "test", "protocol": protocol},
                        "players": {"max": 10, "online": 1},
                        "description": {"text": "backend motd"},
                    });
                    c.send(&packets::status_response(&body.to_string())).await.unwrap();
                    if let Ok(Some(ping)) = c.read_packet().await {
                        let _ = c.send(&ping).await;
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn probe_reprobes_with_minus_one_on_mismatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = fake_backend(763, seen.clone()).await;
        let v = probe_version(
            &addr,
            ProtocolVersion::V1_21,
            Duration::from_secs(1),
            Duration::from_secs(3),
        )
        .await
        .unwrap();
        assert_eq!(v, ProtocolVersion::V1_20);
        assert_eq!(*seen.lock().unwrap(), vec![767, -1]);
    }

    #[tokio::test]
    async fn probe_matching_version_needs_one_round() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = fake_backend(765, seen.clone()).await;
        let v = probe_version(
            &addr,
            ProtocolVersion::V1_20_3,
            Duration::from_secs(1),
            Duration::from_secs(3),
        )
        .await
        .unwrap();
        assert_eq!(v, ProtocolVersion::V1_20_3);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn probe_maps_failures() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);
        let err = probe_version(
            &dead_addr,
            ProtocolVersion::V1_21,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::Connect(_)));
        assert_eq!(
            ProxyError::from(err).client_message().as_deref(),
            Some(BACKEND_UNAVAILABLE_MESSAGE)
        );

        // accepts but never answers
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_s, _) = silent.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        let started = std::time::Instant::now();
        let err = probe_version(
            &silent_addr,
            ProtocolVersion::V1_21,
            Duration::from_secs(1),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            ProxyError::from(err).client_message().as_deref(),
            Some(AUTO_DETECT_FAILED_MESSAGE)
        );
    }

    #[tokio::test]
    async fn unregistered_backend_version_is_rejected() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = fake_backend(9999, seen.clone()).await;
        let err = probe_version(
            &addr,
            ProtocolVersion::V1_21,
            Duration::from_secs(1),
            Duration::from_secs(3),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::Failed(_)));
        assert_eq!(*seen.lock().unwrap(), vec![767, -1]);
        assert_eq!(
            ProxyError::from(err).client_message().as_deref(),
            Some(AUTO_DETECT_FAILED_MESSAGE)
        );
    }

    #[test]
    fn motd_rewrite_keeps_other_fields() {
        let out = rewrite_motd(
            r#"{"version":{"protocol":47,"name":"x"},"description":"old"}"#,
            "hello",
        );
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["description"]["text"], "hello");
        assert_eq!(v["version"]["protocol"], 47);
        assert_eq!(rewrite_motd("not json", "x"), "not json");
    }

    #[tokio::test]
    async fn relay_applies_custom_motd_and_pongs() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let backend = fake_backend(767, seen).await;
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();

        let proxy = tokio::spawn(async move {
            let (s, _) = front.accept().await.unwrap();
            let mut c = FramedConn::new(s, BytesMut::new()).unwrap();
            let hs = Handshake::decode(&c.read_packet().await.unwrap().unwrap()).unwrap();
            relay_status(
                &mut c,
                &hs,
                &backend,
                Some("proxied"),
                Duration::from_secs(1),
                Duration::from_secs(2),
            )
            .await
        });

        let stream = TcpStream::connect(front_addr).await.unwrap();
        let mut client = FramedConn::new(stream, BytesMut::new()).unwrap();
        client
            .send(
                &Handshake {
                    protocol_version: 767,
                    address: "localhost".into(),
                    port: 25568,
                    intent: Intent::Status.raw(),
                }
                .encode(),
            )
            .await
            .unwrap();
        client.send(&packets::status_request()).await.unwrap();
        let resp = client.read_packet().await.unwrap().unwrap();
        let v: Value =
            serde_json::from_str(&packets::decode_status_response(&resp).unwrap()).unwrap();
        assert_eq!(v["description"]["text"], "proxied");

        let ping = PacketWriter::new().i64(42).finish(ids::STATUS_PING);
        client.send(&ping).await.unwrap();
        let pong = client.read_packet().await.unwrap().unwrap();
        assert_eq!(pong.id, ids::STATUS_PING);
        assert_eq!(pong.reader().i64().unwrap(), 42);

        proxy.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreachable_backend_still_answers_the_ping() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();

        tokio::spawn(async move {
            let (s, _) = front.accept().await.unwrap();
            let mut c = FramedConn::new(s, BytesMut::new()).unwrap();
            let hs = Handshake {
                protocol_version: 47,
                address: "x".into(),
                port: 1,
                intent: 1,
            };
            let _ = relay_status(&mut c, &hs, &dead_addr, None, Duration::from_millis(500), Duration::from_secs(2)).await;
        });

        let stream = TcpStream::connect(front_addr).await.unwrap();
        let mut client = FramedConn::new(stream, BytesMut::new()).unwrap();
        client.send(&packets::status_request()).await.unwrap();
        let resp = client.read_packet().await.unwrap().unwrap();
        let text = packets::decode_status_response(&resp).unwrap();
        assert!(text.contains(BACKEND_UNAVAILABLE_MESSAGE));
        client
            .send(&Packet::new(ids::STATUS_PING, Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 7])))
            .await
            .unwrap();
        let pong = client.read_packet().await.unwrap().unwrap();
        assert_eq!(pong.reader().i64().unwrap(), 7);
    }
}
