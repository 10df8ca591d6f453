use std::{
    borrow::Cow,
    net::{IpAddr, SocketAddr},
    sync::LazyLock,
    time::Duration,
};

use anyhow::Context;
use regex::Regex;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time,
};

use crate::refract::version::{ProtocolVersion, TargetVersion};

pub const DEFAULT_GAME_PORT: u16 = 25565;

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all interfaces",
/// which `SocketAddr` parsing does not accept.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// True when `addr` carries no port (bracketed IPv6 aware).
pub fn needs_port(addr: &str) -> bool {
    let s = addr.trim();
    if s.is_empty() {
        return false;
    }
    let after = match s.rfind(']') {
        Some(pos) => &s[pos + 1..],
        // bare IPv6 literal
        None if s.matches(':').count() > 1 => return true,
        None => s,
    };
    !after.contains(':')
}

/// Splits `host[:port]`, falling back to the game's default port.
pub fn split_host_port(addr: &str) -> anyhow::Result<(String, u16)> {
    let s = addr.trim();
    if s.is_empty() {
        anyhow::bail!("net: empty address");
    }
    if needs_port(s) {
        let host = s.trim_start_matches('[').trim_end_matches(']');
        return Ok((host.to_string(), DEFAULT_GAME_PORT));
    }
    let pos = s.rfind(':').context("net: missing port separator")?;
    let (host, port) = (&s[..pos], &s[pos + 1..]);
    let port: u16 = port
        .parse()
        .with_context(|| format!("net: invalid port in {s:?}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        anyhow::bail!("net: empty host in {s:?}");
    }
    Ok((host.to_string(), port))
}

pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Connects with a bounded timeout. A zero timeout means unbounded.
pub async fn dial_tcp(addr: &str, timeout: Duration) -> anyhow::Result<TcpStream> {
    let c = if timeout > Duration::ZERO {
        time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))?
            .with_context(|| format!("dial {addr}"))?
    } else {
        TcpStream::connect(addr)
            .await
            .with_context(|| format!("dial {addr}"))?
    };
    let _ = c.set_nodelay(true);
    Ok(c)
}

/// TLV type carrying the client's protocol version in the PROXY v2 header.
pub const PP2_TYPE_CLIENT_VERSION: u8 = 0xE0;

/// Writes a PROXY protocol v2 header describing the client, with the client version TLV.
pub async fn write_proxy_proto_v2(
    upstream: &mut (dyn AsyncWrite + Send + Unpin),
    src: SocketAddr,
    dst: SocketAddr,
    client_version: ProtocolVersion,
) -> anyhow::Result<()> {
    let out = encode_proxy_proto_v2(src, dst, client_version);
    upstream.write_all(&out).await.context("proxy: write pp2")?;
    upstream.flush().await.ok();
    Ok(())
}

fn encode_proxy_proto_v2(src: SocketAddr, dst: SocketAddr, client_version: ProtocolVersion) -> Vec<u8> {
    // "\r\n\r\n\0\r\nQUIT\n"
    const SIG: [u8; 12] = [13, 10, 13, 10, 0, 13, 10, 81, 85, 73, 84, 10];

    let tlv_value = client_version.raw().to_be_bytes();
    let mut tlv = Vec::with_capacity(3 + tlv_value.len());
    tlv.push(PP2_TYPE_CLIENT_VERSION);
    tlv.extend_from_slice(&(tlv_value.len() as u16).to_be_bytes());
    tlv.extend_from_slice(&tlv_value);

    let mut out = Vec::with_capacity(16 + 36 + tlv.len());
    out.extend_from_slice(&SIG);
    // version 2, PROXY command
    out.push(0x21);

    let (family, addrs): (u8, Vec<u8>) = match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let mut a = Vec::with_capacity(12);
            a.extend_from_slice(&s.octets());
            a.extend_from_slice(&d.octets());
            a.extend_from_slice(&src.port().to_be_bytes());
            a.extend_from_slice(&dst.port().to_be_bytes());
            (0x11, a)
        }
        (s, d) => {
            let s6 = match s {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            let d6 = match d {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            let mut a = Vec::with_capacity(36);
            a.extend_from_slice(&s6.octets());
            a.extend_from_slice(&d6.octets());
            a.extend_from_slice(&src.port().to_be_bytes());
            a.extend_from_slice(&dst.port().to_be_bytes());
            (0x21, a)
        }
    };

    out.push(family);
    out.extend_from_slice(&((addrs.len() + tlv.len()) as u16).to_be_bytes());
    out.extend_from_slice(&addrs);
    out.extend_from_slice(&tlv);
    out
}

/// How the handshake address may select the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WildcardMode {
    #[default]
    None,
    Public,
    Internal,
}

impl WildcardMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "public" => Some(Self::Public),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Backend chosen by the handshake address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardTarget {
    pub address: String,
    pub version: TargetVersion,
    /// The client-facing address with the routing data stripped (internal mode).
    pub original_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WildcardError {
    #[error("Wrong domain syntax! Please use: address_port_version.viaproxy.hostname")]
    Syntax,
    #[error("Wrong domain syntax! Unknown server version.")]
    UnknownVersion,
}

static FORMAT2: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^address\.(.+?)\.port\.(\d+?)(?:\.version\.(.+?))?$").ok()
});

/// Parses a handshake address according to the wildcard mode. `Ok(None)` means the
/// configured target applies.
pub fn parse_wildcard(
    mode: WildcardMode,
    handshake_address: &str,
) -> Result<Option<WildcardTarget>, WildcardError> {
    match mode {
        WildcardMode::None => Ok(None),
        WildcardMode::Public => {
            if handshake_address.to_ascii_lowercase().contains(".f2.viaproxy.") {
                parse_public_format2(handshake_address).map(Some)
            } else {
                parse_public_format1(handshake_address).map(Some)
            }
        }
        WildcardMode::Internal => parse_internal(handshake_address).map(Some),
    }
}

/// `address_port_version.viaproxy.hostname`; the address itself may contain underscores.
fn parse_public_format1(addr: &str) -> Result<WildcardTarget, WildcardError> {
    let lower = addr.to_ascii_lowercase();
    let cut = lower.rfind(".viaproxy.").ok_or(WildcardError::Syntax)?;
    let data = &addr[..cut];
    let parts: Vec<&str> = data.split('_').collect();
    if parts.len() < 3 {
        return Err(WildcardError::Syntax);
    }
    let version_str = parts[parts.len() - 1];
    let port: u16 = parts[parts.len() - 2]
        .parse()
        .map_err(|_| WildcardError::Syntax)?;
    let host = parts[..parts.len() - 2].join("_");
    if host.is_empty() {
        return Err(WildcardError::Syntax);
    }
    let version =
        ProtocolVersion::from_name_lenient(version_str).ok_or(WildcardError::UnknownVersion)?;
    Ok(WildcardTarget {
        address: join_host_port(&host, port),
        version: TargetVersion::Fixed(version),
        original_address: None,
    })
}

/// `address.<host>.port.<n>[.version.<v>].f2.viaproxy.<suffix>`; a missing version means auto.
fn parse_public_format2(addr: &str) -> Result<WildcardTarget, WildcardError> {
    let lower = addr.to_ascii_lowercase();
    let cut = lower.rfind(".f2.viaproxy.").ok_or(WildcardError::Syntax)?;
    let data = &addr[..cut];
    let re = FORMAT2.as_ref().ok_or(WildcardError::Syntax)?;
    let caps = re.captures(data).ok_or(WildcardError::Syntax)?;
    let host = caps.get(1).map(|m| m.as_str()).ok_or(WildcardError::Syntax)?;
    let port: u16 = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or(WildcardError::Syntax)?;
    let version = match caps.get(3) {
        Some(v) => TargetVersion::Fixed(
            ProtocolVersion::from_name_lenient(v.as_str()).ok_or(WildcardError::UnknownVersion)?,
        ),
        None => TargetVersion::Auto,
    };
    Ok(WildcardTarget {
        address: join_host_port(host, port),
        version,
        original_address: None,
    })
}

/// `original\x07host:port\x07version`, as written by a fronting proxy.
fn parse_internal(addr: &str) -> Result<WildcardTarget, WildcardError> {
    let parts: Vec<&str> = addr.split('\x07').collect();
    if parts.len() < 3 {
        return Err(WildcardError::Syntax);
    }
    let version = TargetVersion::parse(parts[2]).ok_or(WildcardError::UnknownVersion)?;
    if parts[1].trim().is_empty() {
        return Err(WildcardError::Syntax);
    }
    Ok(WildcardTarget {
        address: parts[1].trim().to_string(),
        version,
        original_address: Some(parts[0].to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":25568").as_ref(), "0.0.0.0:25568");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn host_port_defaults() {
        assert_eq!(
            split_host_port("mc.example.com").unwrap(),
            ("mc.example.com".to_string(), 25565)
        );
        assert_eq!(
            split_host_port("127.0.0.1:25570").unwrap(),
            ("127.0.0.1".to_string(), 25570)
        );
        assert_eq!(split_host_port("[::1]:1").unwrap(), ("::1".to_string(), 1));
        assert!(split_host_port("host:notaport").is_err());
        assert!(split_host_port("").is_err());
        assert_eq!(join_host_port("::1", 5), "[::1]:5");
    }

    #[test]
    fn public_format1() {
        let t = parse_wildcard(WildcardMode::Public, "my_server.net_25570_1.8.x.viaproxy.proxy.io")
            .unwrap()
            .unwrap();
        assert_eq!(t.address, "my_server.net:25570");
        assert_eq!(t.version, TargetVersion::Fixed(ProtocolVersion::V1_8));

        assert_eq!(
            parse_wildcard(WildcardMode::Public, "nope.example.com"),
            Err(WildcardError::Syntax)
        );
        assert_eq!(
            parse_wildcard(WildcardMode::Public, "host_1_banana.viaproxy.x"),
            Err(WildcardError::UnknownVersion)
        );
    }

    #[test]
    fn public_format2() {
        let t = parse_wildcard(
            WildcardMode::Public,
            "address.mc.example.com.port.25565.version.1.20.4.f2.viaproxy.proxy.io",
        )
        .unwrap()
        .unwrap();
        assert_eq!(t.address, "mc.example.com:25565");
        assert_eq!(t.version, TargetVersion::Fixed(ProtocolVersion::V1_20_3));

        let auto = parse_wildcard(
            WildcardMode::Public,
            "address.mc.example.com.port.25565.f2.viaproxy.proxy.io",
        )
        .unwrap()
        .unwrap();
        assert_eq!(auto.version, TargetVersion::Auto);
    }

    #[test]
    fn internal_format() {
        let t = parse_wildcard(WildcardMode::Internal, "play.example.com\x07backend:25566\x071.12.2")
            .unwrap()
            .unwrap();
        assert_eq!(t.address, "backend:25566");
        assert_eq!(t.version, TargetVersion::Fixed(ProtocolVersion::V1_12_2));
        assert_eq!(t.original_address.as_deref(), Some("play.example.com"));

        assert!(parse_wildcard(WildcardMode::Internal, "plain.example.com").is_err());
        assert_eq!(parse_wildcard(WildcardMode::None, "anything"), Ok(None));
    }

    #[test]
    fn proxy_header_carries_client_version() {
        let src: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.2:25565".parse().unwrap();
        let out = encode_proxy_proto_v2(src, dst, ProtocolVersion::V1_21);
        assert_eq!(out[12], 0x21);
        assert_eq!(out[13], 0x11);
        assert_eq!(u16::from_be_bytes([out[14], out[15]]), 12 + 7);
        let tlv = &out[16 + 12..];
        assert_eq!(tlv[0], PP2_TYPE_CLIENT_VERSION);
        assert_eq!(u16::from_be_bytes([tlv[1], tlv[2]]), 4);
        assert_eq!(i32::from_be_bytes([tlv[3], tlv[4], tlv[5], tlv[6]]), 767);
    }
}
