//! HTTP CONNECT tunneling dialer.
//!
//! Opens a TCP connection to the proxy, asks it to `CONNECT` to the target,
//! and hands back the raw stream once the proxy answers with a 2xx status.

use std::io;

use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use super::{dial_direct, proxy_credentials, Family, ProxyError};

/// Upper bound on the proxy's response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct HttpConnectDialer {
    /// `host:port` of the proxy.
    proxy_addr: String,
    /// Precomputed `Proxy-Authorization` value.
    authorization: Option<String>,
}

impl HttpConnectDialer {
    pub fn new(proxy_url: &Url) -> Result<Self, ProxyError> {
        let host = proxy_url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::InvalidProxyUrl(proxy_url.to_string()))?;
        let port = proxy_url
            .port_or_known_default()
            .ok_or_else(|| ProxyError::InvalidProxyUrl(proxy_url.to_string()))?;

        let authorization = proxy_credentials(proxy_url)?.map(|(user, password)| {
            format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
        });

        Ok(Self {
            proxy_addr: format!("{host}:{port}"),
            authorization,
        })
    }

    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    /// Dial `address` through the proxy, reaching the proxy over `family`.
    pub(crate) async fn dial(&self, family: Family, address: &str) -> io::Result<TcpStream> {
        let mut stream = dial_direct(family, &self.proxy_addr).await?;

        let mut request = format!("CONNECT {address} HTTP/1.1\r\nHost: {address}\r\n");
        if let Some(auth) = &self.authorization {
            request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        request.push_str("\r\n");

        tracing::trace!(proxy = %self.proxy_addr, target = %address, "Sending CONNECT request");
        stream.write_all(request.as_bytes()).await?;

        let head = read_response_head(&mut stream).await?;
        let status = parse_status(&head)?;
        if !(200..300).contains(&status) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy {} refused CONNECT to {address}: status {status}", self.proxy_addr),
            ));
        }

        Ok(stream)
    }
}

/// Read up to and including the blank line, one byte at a time so no
/// tunneled bytes are consumed.
async fn read_response_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy response head too large",
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed connection during CONNECT",
            ));
        }
        head.push(byte[0]);
    }

    String::from_utf8(head).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn parse_status(head: &str) -> io::Result<u16> {
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid status code in proxy response: {status_line}"),
            )
        }),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid proxy response: {status_line}"),
        )),
    }
}
