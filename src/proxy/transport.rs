//! Proxy transport layer
//!
//! Handles establishing connections through upstream endpoints and their
//! `via` chains using HTTP CONNECT tunnelling.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::{Result, WaypointError};
use crate::models::ProxyEndpoint;
use crate::proxy::dialer::{format_authority, Dialer};

/// Upper bound on response header lines before the blank line
const MAX_HEADER_LINES: usize = 128;

/// Trait for proxy connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedConnection = Box<dyn ProxyConnection>;

/// Status line and headers of an HTTP/1.x response
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub status_line: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Parsed `Content-Length`, if present and valid
    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get(http::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Open a stream to `host:port` through `endpoint`.
    ///
    /// A direct endpoint dials the target itself. Otherwise the endpoint is
    /// reached (through its `via` chain, if any) and asked to CONNECT.
    pub fn connect<'a>(
        dialer: &'a Dialer,
        endpoint: &'a ProxyEndpoint,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<BoxedConnection>> {
        async move {
            let Some(target) = endpoint.target() else {
                let stream = dialer.dial(host, port, endpoint.timeout()).await?;
                return Ok(Box::new(stream) as BoxedConnection);
            };

            if target.scheme != "http" {
                return Err(WaypointError::UnsupportedProtocol(target.scheme.clone()));
            }

            let upstream: BoxedConnection = match endpoint.via() {
                Some(via) => Self::connect(dialer, via, &target.host, target.port).await?,
                None => Box::new(
                    dialer
                        .dial(&target.host, target.port, endpoint.timeout())
                        .await?,
                ),
            };

            let authority = format_authority(host, port);
            debug!("Tunnelling to {} through {}", authority, endpoint);

            let stream = timeout(
                endpoint.timeout(),
                Self::http_connect(upstream, &authority, target.credentials()),
            )
            .await??;

            Ok(Box::new(stream) as BoxedConnection)
        }
        .boxed()
    }

    /// Perform an HTTP CONNECT handshake on an established stream.
    ///
    /// The returned reader keeps any bytes the proxy sent after its response
    /// head, so it must be used in place of `stream` from here on.
    #[instrument(skip(stream, credentials))]
    pub async fn http_connect<S>(
        stream: S,
        authority: &str,
        credentials: Option<(&str, &str)>,
    ) -> Result<BufReader<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        let request = Self::build_connect_request(authority, credentials);
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let head = read_response_head(&mut stream).await.map_err(|e| match e {
            WaypointError::Http(msg) => WaypointError::ConnectFailed(msg),
            other => other,
        })?;

        if !head.status.is_success() {
            return Err(WaypointError::ConnectFailed(head.status_line));
        }

        debug!("HTTP CONNECT tunnel established");
        Ok(stream)
    }

    /// Build HTTP CONNECT request
    fn build_connect_request(authority: &str, credentials: Option<(&str, &str)>) -> String {
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

        if let Some((username, password)) = credentials {
            let credentials = format!("{}:{}", username, password);
            request.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                BASE64.encode(credentials.as_bytes())
            ));
        }

        request.push_str("\r\n");
        request
    }
}

/// Read an HTTP/1.x status line and headers up to the blank line
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(WaypointError::Http(
            "connection closed before response".to_string(),
        ));
    }

    let status_line = line.trim_end().to_string();
    let mut parts = status_line.split_whitespace();
    let status = match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => {
            code.parse::<u16>().ok().and_then(|c| StatusCode::from_u16(c).ok())
        }
        _ => None,
    }
    .ok_or_else(|| WaypointError::Http(format!("malformed status line: {:?}", status_line)))?;

    let mut headers = HeaderMap::new();
    for _ in 0..MAX_HEADER_LINES {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(WaypointError::Http(
                "connection closed inside response headers".to_string(),
            ));
        }

        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            return Ok(ResponseHead {
                status,
                status_line,
                headers,
            });
        }

        if let Some((name, value)) = header.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                headers.append(name, value);
            }
        }
    }

    Err(WaypointError::Http("too many response headers".to_string()))
}
