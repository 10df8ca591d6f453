//! Raw relay for protocol epochs that predate length-prefixed framing.

use std::{future::Future, time::Duration};

use anyhow::Context;
use bytes::BytesMut;
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};

use crate::refract::net;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyKind {
    /// Classic (0x00)
    Classic,
    /// Alpha 1.0.15 (0x01)
    Alpha,
    /// Beta through 1.6.4 login (0x02)
    Beta,
    /// Pre-1.7 server list ping (0xFE)
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Legacy(LegacyKind),
    Framed,
}

/// Classifies a connection from its first byte. Computed once per connection.
pub fn classify(first: u8) -> Classification {
    match first {
        0x00 => Classification::Legacy(LegacyKind::Classic),
        0x01 => Classification::Legacy(LegacyKind::Alpha),
        0x02 => Classification::Legacy(LegacyKind::Beta),
        0xFE => Classification::Legacy(LegacyKind::Ping),
        _ => Classification::Framed,
    }
}

/// Reads until at least one byte is buffered and classifies it. The bytes read are
/// returned so the chosen path sees the stream from its first byte.
pub async fn sniff(
    conn: &mut TcpStream,
    timeout: Duration,
) -> anyhow::Result<Option<(Classification, BytesMut)>> {
    let mut buf = BytesMut::with_capacity(512);
    let read = conn.read_buf(&mut buf);
    let n = if timeout > Duration::ZERO {
        time::timeout(timeout, read)
            .await
            .context("legacy: first byte timeout")??
    } else {
        read.await?
    };
    if n == 0 {
        return Ok(None);
    }
    Ok(Some((classify(buf[0]), buf)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub ingress: u64,
    pub egress: u64,
}

/// Connects to the backend and shuttles bytes both ways, starting with `prefix`.
/// Whichever side closes first ends the relay; `stop` ends it from outside.
pub async fn relay(
    client: TcpStream,
    prefix: &[u8],
    backend_addr: &str,
    connect_timeout: Duration,
    stop: impl Future<Output = ()>,
) -> anyhow::Result<RelayStats> {
    let backend = net::dial_tcp(backend_addr, connect_timeout)
        .await
        .context("legacy: backend connect")?;

    let (mut cr, mut cw) = client.into_split();
    let (mut br, mut bw) = backend.into_split();

    bw.write_all(prefix)
        .await
        .context("legacy: write first bytes")?;

    let mut stats = RelayStats {
        ingress: prefix.len() as u64,
        egress: 0,
    };

    tokio::select! {
        r = io::copy(&mut cr, &mut bw) => {
            if let Ok(n) = r {
                stats.ingress += n;
            }
        }
        r = io::copy(&mut br, &mut cw) => {
            if let Ok(n) = r {
                stats.egress += n;
            }
        }
        _ = stop => {}
    }

    let _ = bw.shutdown().await;
    let _ = cw.shutdown().await;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn first_byte_classification() {
        for b in [0x00u8, 0x01, 0x02, 0xFE] {
            assert!(matches!(classify(b), Classification::Legacy(_)), "{b:#x}");
        }
        for b in [0x03u8, 0x10, 0x7F, 0xFF] {
            assert_eq!(classify(b), Classification::Framed, "{b:#x}");
        }
        assert_eq!(classify(0xFE), Classification::Legacy(LegacyKind::Ping));
    }

    #[tokio::test]
    async fn bytes_flow_both_ways_and_close_propagates() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap().to_string();
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();

        let backend_task = tokio::spawn(async move {
            let (mut s, _) = backend.accept().await.unwrap();
            let mut got = [0u8; 4];
            s.read_exact(&mut got).await.unwrap();
            s.write_all(b"pong").await.unwrap();
            got
        });

        let relay_task = tokio::spawn(async move {
            let (mut c, _) = front.accept().await.unwrap();
            let (class, prefix) = sniff(&mut c, Duration::from_secs(1)).await.unwrap().unwrap();
            assert_eq!(class, Classification::Legacy(LegacyKind::Beta));
            relay(
                c,
                &prefix,
                &backend_addr,
                Duration::from_secs(1),
                std::future::pending(),
            )
            .await
            .unwrap()
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(&[0x02, b'a', b'b', b'c']).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        assert_eq!(backend_task.await.unwrap(), [0x02, b'a', b'b', b'c']);

        // backend hung up after replying; the client side must see EOF
        let mut rest = Vec::new();
        let n = time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let stats = relay_task.await.unwrap();
        assert_eq!(stats.egress, 4);
    }

    #[tokio::test]
    async fn unreachable_backend_fails_fast() {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let addr = front.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (c, _) = front.accept().await.unwrap();
        let res = relay(c, &[0xFE], &dead_addr, Duration::from_secs(1), std::future::pending()).await;
        assert!(res.is_err());
    }
}
