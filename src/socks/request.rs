//! SOCKS5 wire types: address specs, request parsing, reply framing.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Protocol version byte.
pub const SOCKS5_VERSION: u8 = 0x05;

/// Authentication methods.
pub const NO_AUTH_REQUIRED: u8 = 0x00;
pub const NO_ACCEPTABLE_METHODS: u8 = 0xff;

/// Request commands.
pub const CMD_CONNECT: u8 = 0x01;

/// Address types.
const ATYP_IPV4: u8 = 0x01;
const ATYP_FQDN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes.
pub const REPLY_SUCCESS: u8 = 0x00;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDR_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Destination host: a literal IP or a length-prefixed domain name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Fqdn(String),
}

/// A SOCKS5 address: exactly one host kind plus a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrSpec {
    pub host: Host,
    pub port: u16,
}

impl AddrSpec {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self { host: Host::Ip(addr.ip()), port: addr.port() }
    }

    /// A string suitable to hand to the resolver/dialer.
    pub fn dial_addr(&self) -> String {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
            Host::Ip(IpAddr::V4(ip)) => format!("{ip}:{}", self.port),
            Host::Fqdn(name) => format!("{name}:{}", self.port),
        }
    }
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{ip}:{}", self.port),
            Host::Fqdn(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

/// A request received from a SOCKS5 client.
#[derive(Debug)]
pub struct Request {
    pub version: u8,
    pub command: u8,
    /// Desired destination.
    pub dest: AddrSpec,
    /// Peer address of the requesting client, when the listener has one.
    pub remote: Option<AddrSpec>,
}

impl Request {
    /// Parse the fixed 3-byte header plus the destination address.
    pub async fn parse<R>(r: &mut R, remote: Option<AddrSpec>) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 3];
        r.read_exact(&mut header)
            .await
            .map_err(|e| Error::protocol(format!("read 3 bytes header error: {e}")))?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "unsupported proxy version: {:#04x}",
                header[0]
            )));
        }

        let dest = read_addr_spec(r).await?;

        Ok(Self { version: SOCKS5_VERSION, command: header[1], dest, remote })
    }
}

/// Read an address type byte, the address body, and the trailing port.
pub async fn read_addr_spec<R>(r: &mut R) -> Result<AddrSpec>
where
    R: AsyncRead + Unpin,
{
    let atyp = r
        .read_u8()
        .await
        .map_err(|e| Error::protocol(format!("read addr type error: {e}")))?;

    let host = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            r.read_exact(&mut addr)
                .await
                .map_err(|e| Error::protocol(format!("read ipv4 addr error: {e}")))?;
            Host::Ip(IpAddr::from(addr))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            r.read_exact(&mut addr)
                .await
                .map_err(|e| Error::protocol(format!("read ipv6 addr error: {e}")))?;
            Host::Ip(IpAddr::from(addr))
        }
        ATYP_FQDN => {
            let len = r
                .read_u8()
                .await
                .map_err(|e| Error::protocol(format!("read fqdn len error: {e}")))?;
            let mut fqdn = vec![0u8; len as usize];
            r.read_exact(&mut fqdn)
                .await
                .map_err(|e| Error::protocol(format!("read fqdn {len} bytes error: {e}")))?;
            let name = String::from_utf8(fqdn)
                .map_err(|_| Error::protocol("fqdn is not valid utf-8"))?;
            Host::Fqdn(name)
        }
        _ => return Err(Error::protocol(format!("unrecognized address type: {atyp:#04x}"))),
    };

    let port = r
        .read_u16()
        .await
        .map_err(|e| Error::protocol(format!("read 2 bytes port error: {e}")))?;

    Ok(AddrSpec { host, port })
}

/// Serialize an address as `ATYP + body + port`, the layout shared by
/// requests and reply tails. `None` stands for the synthetic null address
/// and serializes as IPv4 0.0.0.0:0.
pub fn serialize_addr_spec(addr: Option<&AddrSpec>) -> Vec<u8> {
    let (atyp, body, port): (u8, Vec<u8>, u16) = match addr {
        None => (ATYP_IPV4, vec![0, 0, 0, 0], 0),
        Some(AddrSpec { host: Host::Ip(IpAddr::V4(ip)), port }) => {
            (ATYP_IPV4, ip.octets().to_vec(), *port)
        }
        Some(AddrSpec { host: Host::Ip(IpAddr::V6(ip)), port }) => {
            (ATYP_IPV6, ip.octets().to_vec(), *port)
        }
        Some(AddrSpec { host: Host::Fqdn(name), port }) => {
            let mut body = Vec::with_capacity(1 + name.len());
            body.push(name.len() as u8);
            body.extend_from_slice(name.as_bytes());
            (ATYP_FQDN, body, *port)
        }
    };

    let mut out = Vec::with_capacity(1 + body.len() + 2);
    out.push(atyp);
    out.extend_from_slice(&body);
    out.extend_from_slice(&port.to_be_bytes());
    out
}

/// Send a reply: `[VER, REP, RSV, ATYP, ADDR.., PORT_HI, PORT_LO]`.
pub async fn send_reply<W>(w: &mut W, rep: u8, addr: Option<&AddrSpec>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut reply = Vec::with_capacity(6 + 4);
    reply.push(SOCKS5_VERSION);
    reply.push(rep);
    reply.push(0x00); // reserved
    reply.extend_from_slice(&serialize_addr_spec(addr));
    w.write_all(&reply).await?;
    Ok(())
}
