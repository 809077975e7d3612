//! PROXY protocol (v1/v2) header parsing.
//!
//! Only consulted when the raw peer address is inside the configured
//! trusted-proxy CIDR set; untrusted peers never get their stream
//! sniffed, so a stray header simply fails to parse as IRC.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{bail, Result};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Max length of a v1 text header.
const MAX_V1_HEADER_LEN: usize = 107;

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Read a PROXY header off the stream, consuming it.
///
/// Returns the conveyed source address, or `None` when the header is a
/// LOCAL/UNKNOWN announcement (the raw socket address stays in effect).
/// Streams that do not begin with a PROXY signature are an error; the
/// caller only invokes this for trusted peers, and a trusted proxy
/// always sends the header.
pub async fn read_header(stream: &mut TcpStream) -> Result<Option<SocketAddr>> {
    let mut sig = [0u8; 12];
    let n = stream.peek(&mut sig).await?;

    if n >= 12 && sig == V2_SIGNATURE {
        return read_v2(stream).await;
    }
    if n >= 6 && &sig[..6] == b"PROXY " {
        return read_v1(stream).await;
    }
    bail!("missing PROXY protocol header");
}

async fn read_v1(stream: &mut TcpStream) -> Result<Option<SocketAddr>> {
    // Text header, CRLF-terminated. The stream cannot be rewound, so the
    // line is consumed byte by byte; it is at most 107 bytes.
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if line.len() > MAX_V1_HEADER_LEN {
            bail!("PROXY v1 header too long");
        }
        if line.ends_with(b"\r\n") {
            break;
        }
    }

    let header = std::str::from_utf8(&line)?;
    let parts: Vec<&str> = header.trim_end().split(' ').collect();
    if parts.len() < 2 || parts[0] != "PROXY" {
        bail!("malformed PROXY v1 header");
    }

    match parts[1] {
        "UNKNOWN" => Ok(None),
        "TCP4" | "TCP6" if parts.len() == 6 => {
            let ip: IpAddr = parts[2].parse()?;
            let port: u16 = parts[4].parse()?;
            Ok(Some(SocketAddr::new(ip, port)))
        }
        other => bail!("unsupported PROXY v1 protocol {other:?}"),
    }
}

async fn read_v2(stream: &mut TcpStream) -> Result<Option<SocketAddr>> {
    let mut sig = [0u8; 12];
    stream.read_exact(&mut sig).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let ver = (head[0] & 0xF0) >> 4;
    let cmd = head[0] & 0x0F;
    let family = (head[1] & 0xF0) >> 4;
    let len = u16::from_be_bytes([head[2], head[3]]) as usize;

    if ver != 2 {
        bail!("unsupported PROXY protocol version {ver}");
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;

    // LOCAL: health checks and the like; keep the socket address.
    if cmd == 0 {
        return Ok(None);
    }
    if cmd != 1 {
        bail!("unsupported PROXY v2 command {cmd}");
    }

    match family {
        1 => {
            if data.len() < 12 {
                bail!("short PROXY v2 IPv4 block");
            }
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[8], data[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        2 => {
            if data.len() < 36 {
                bail!("short PROXY v2 IPv6 block");
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&data[0..16]);
            let port = u16::from_be_bytes([data[32], data[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)))
        }
        // AF_UNSPEC / AF_UNIX announcements carry no usable address.
        _ => Ok(None),
    }
}
