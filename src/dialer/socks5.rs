//! SOCKS5 dialer.

use std::io;

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use url::Url;

use super::{dial_direct, proxy_credentials, Family, ProxyError};

const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Dials targets through a SOCKS5 proxy; the proxy itself is reached directly.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy_addr: String,
    credentials: Option<(String, String)>,
}

impl Socks5Dialer {
    pub fn new(proxy_url: &Url) -> Result<Self, ProxyError> {
        let host = proxy_url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::InvalidProxyUrl(proxy_url.to_string()))?;
        let port = proxy_url.port().unwrap_or(DEFAULT_SOCKS_PORT);

        let credentials = proxy_credentials(proxy_url)?;

        Ok(Self {
            proxy_addr: format!("{host}:{port}"),
            credentials,
        })
    }

    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    /// Dial `address` through the proxy, reaching the proxy over `family`.
    pub(crate) async fn dial(&self, family: Family, address: &str) -> io::Result<TcpStream> {
        let socket = dial_direct(family, &self.proxy_addr).await?;
        let stream = match &self.credentials {
            Some((user, pass)) => {
                Socks5Stream::connect_with_password_and_socket(socket, address, user, pass).await
            }
            None => Socks5Stream::connect_with_socket(socket, address).await,
        }
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;

        Ok(stream.into_inner())
    }
}
