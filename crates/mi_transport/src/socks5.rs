//! SOCKS5 CONNECT (RFC 1928, RFC 1929 user/pass subnegotiation).
//!
//! Only the client half, only CONNECT, domain-name addressing. The relay
//! hostname is passed through to the proxy so local DNS never sees it.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::TransportError;
use crate::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksProxy {
    pub endpoint: Endpoint,
    pub username: Option<String>,
    pub password: Option<String>,
}

const VER: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_REJECTED: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V4: u8 = 0x01;
const ATYP_V6: u8 = 0x04;

/// Run the SOCKS5 handshake on `stream` and leave it connected to `target`.
pub fn establish(
    stream: &mut TcpStream,
    proxy: &SocksProxy,
    target: &Endpoint,
) -> Result<(), TransportError> {
    let want_auth = proxy.username.is_some();
    let methods: &[u8] = if want_auth {
        &[METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[METHOD_NO_AUTH]
    };
    let mut greeting = vec![VER, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice)?;
    if choice[0] != VER {
        return Err(TransportError::Proxy("bad SOCKS version".into()));
    }
    match choice[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            let username = proxy
                .username
                .as_deref()
                .ok_or_else(|| TransportError::Proxy("proxy requires credentials".into()))?;
            let password = proxy.password.as_deref().unwrap_or("");
            if username.len() > 255 || password.len() > 255 {
                return Err(TransportError::Proxy("credentials too long".into()));
            }
            let mut auth = vec![0x01, username.len() as u8];
            auth.extend_from_slice(username.as_bytes());
            auth.push(password.len() as u8);
            auth.extend_from_slice(password.as_bytes());
            stream.write_all(&auth)?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status)?;
            if status[1] != 0x00 {
                return Err(TransportError::Proxy("proxy authentication failed".into()));
            }
        }
        METHOD_REJECTED => {
            return Err(TransportError::Proxy("no acceptable auth method".into()))
        }
        other => {
            return Err(TransportError::Proxy(format!(
                "unexpected auth method {other:#04x}"
            )))
        }
    }

    if target.host.len() > 255 {
        return Err(TransportError::Proxy("target hostname too long".into()));
    }
    let mut request = vec![VER, CMD_CONNECT, 0x00, ATYP_DOMAIN, target.host.len() as u8];
    request.extend_from_slice(target.host.as_bytes());
    request.extend_from_slice(&target.port.to_be_bytes());
    stream.write_all(&request)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;
    if head[0] != VER {
        return Err(TransportError::Proxy("bad SOCKS version in reply".into()));
    }
    if head[1] != 0x00 {
        return Err(TransportError::Proxy(format!(
            "proxy CONNECT refused (rep={:#04x})",
            head[1]
        )));
    }
    // Drain the bound address; its shape depends on ATYP.
    let addr_len = match head[3] {
        ATYP_V4 => 4,
        ATYP_V6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            len[0] as usize
        }
        other => {
            return Err(TransportError::Proxy(format!(
                "unexpected ATYP {other:#04x}"
            )))
        }
    };
    let mut skip = vec![0u8; addr_len + 2];
    stream.read_exact(&mut skip)?;
    Ok(())
}
