//! DNS over TCP
//!
//! Resolves a hostname by sending a single A query over a TCP stream using
//! RFC 1035 length-prefixed framing, optionally through an HTTP CONNECT
//! tunnel.

use std::net::IpAddr;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::{Result, WaypointError};
use crate::proxy::dialer::{format_authority, parse_host_port, Dialer};
use crate::proxy::transport::{BoxedConnection, ProxyTransport};

pub const DNS_PORT: u16 = 53;

/// Bound on connecting to the DNS server (or its proxy) and on the exchange
pub const DNS_TIMEOUT: Duration = Duration::from_secs(3);

/// Encode an A query for `host` with the given message id
pub fn build_query(host: &str, id: u16) -> Result<Vec<u8>> {
    let mut name = Name::from_ascii(host)
        .map_err(|e| WaypointError::Resolution(format!("invalid hostname '{}': {}", host, e)))?;
    name.set_fqdn(true);

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));

    Ok(message.to_vec()?)
}

/// Decode a response to the query `id` and extract its address records
pub fn parse_response(bytes: &[u8], id: u16) -> Result<Vec<IpAddr>> {
    let message = Message::from_vec(bytes)?;

    if message.message_type() != MessageType::Response {
        return Err(WaypointError::DnsDecode("message is not a response".to_string()));
    }
    if message.id() != id {
        return Err(WaypointError::DnsDecode(format!(
            "response id {} does not match query id {}",
            message.id(),
            id
        )));
    }
    if message.response_code() != ResponseCode::NoError {
        return Err(WaypointError::Resolution(format!(
            "server answered {}",
            message.response_code()
        )));
    }

    let addrs = message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(WaypointError::Resolution("no address records in answer".to_string()));
    }
    Ok(addrs)
}

/// Send one length-prefixed DNS message and read the length-prefixed reply
pub async fn exchange<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let length = u16::try_from(query.len())
        .map_err(|_| WaypointError::DnsDecode("query exceeds 65535 bytes".to_string()))?;

    let mut frame = Vec::with_capacity(query.len() + 2);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(query);
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut prefix = [0u8; 2];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(|e| short_read("length prefix", e))?;

    let mut reply = vec![0u8; usize::from(u16::from_be_bytes(prefix))];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| short_read("message body", e))?;

    Ok(reply)
}

fn short_read(part: &str, err: std::io::Error) -> WaypointError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        WaypointError::DnsDecode(format!("short read on {}", part))
    } else {
        WaypointError::Io(err)
    }
}

/// Resolve `query` against `dns_server` over TCP.
///
/// With `proxy` set, the DNS server is reached through an HTTP CONNECT
/// tunnel on that proxy, authenticating with `credentials` when given.
#[instrument(skip(dialer, credentials))]
pub async fn resolve_via_tcp(
    dialer: &Dialer,
    query: &str,
    dns_server: &str,
    proxy: Option<&str>,
    credentials: Option<(&str, &str)>,
) -> Result<Vec<IpAddr>> {
    let (server, port) = parse_host_port(dns_server, DNS_PORT)?;

    let mut stream: BoxedConnection = match proxy {
        Some(proxy) => {
            let (proxy_host, proxy_port) = parse_host_port(proxy, 80)?;
            let socket = dialer
                .dial_system(&proxy_host, proxy_port, DNS_TIMEOUT)
                .await?;
            let tunnel = timeout(
                DNS_TIMEOUT,
                ProxyTransport::http_connect(socket, &format_authority(&server, port), credentials),
            )
            .await??;
            Box::new(tunnel)
        }
        None => Box::new(dialer.dial_system(&server, port, DNS_TIMEOUT).await?),
    };

    let id = rand::random::<u16>();
    let request = build_query(query, id)?;
    let reply = timeout(DNS_TIMEOUT, exchange(&mut stream, &request)).await??;

    match parse_response(&reply, id) {
        Ok(addrs) => {
            debug!("{} resolved to {:?} via {}", query, addrs, dns_server);
            Ok(addrs)
        }
        Err(e) => {
            if e.is_protocol_violation() {
                warn!("Malformed DNS reply from {}: {}", dns_server, e);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;

    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::Record;
    use tokio::net::TcpListener;

    use crate::resolver::CachingResolver;

    fn dialer() -> Dialer {
        Dialer::new(Arc::new(CachingResolver::default()))
    }

    /// Build a response to `query` carrying the given answers
    fn response_for(query: &[u8], answers: Vec<RData>) -> Vec<u8> {
        let request = Message::from_vec(query).unwrap();
        let name = request.queries()[0].name().clone();

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_available(true)
            .add_query(request.queries()[0].clone());
        for rdata in answers {
            response.add_answer(Record::from_rdata(name.clone(), 300, rdata));
        }
        response.to_vec().unwrap()
    }

    /// DNS server answering one query on TCP with the given records
    async fn spawn_dns_server(answers: Vec<RData>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut prefix = [0u8; 2];
            stream.read_exact(&mut prefix).await.unwrap();
            let mut query = vec![0u8; u16::from_be_bytes(prefix) as usize];
            stream.read_exact(&mut query).await.unwrap();

            let reply = response_for(&query, answers);
            stream
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&reply).await.unwrap();
        });
        port
    }

    #[test]
    fn build_query_encodes_a_question() {
        let bytes = build_query("example.com", 0x1234).unwrap();
        let message = Message::from_vec(&bytes).unwrap();

        assert_eq!(message.id(), 0x1234);
        assert_eq!(message.message_type(), MessageType::Query);
        assert!(message.recursion_desired());
        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.queries()[0].query_type(), RecordType::A);
        assert_eq!(message.queries()[0].name().to_ascii(), "example.com.");
    }

    #[test]
    fn parse_response_extracts_addresses() {
        let query = build_query("example.com", 7).unwrap();
        let reply = response_for(
            &query,
            vec![
                RData::CNAME(CNAME(Name::from_ascii("edge.example.net.").unwrap())),
                RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
                RData::AAAA(AAAA(Ipv6Addr::new(0x2606, 0x2800, 0x220, 1, 0, 0, 0, 0x1946))),
            ],
        );

        let addrs = parse_response(&reply, 7).unwrap();
        assert_eq!(
            addrs,
            vec![
                IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
                IpAddr::V6(Ipv6Addr::new(0x2606, 0x2800, 0x220, 1, 0, 0, 0, 0x1946)),
            ]
        );
    }

    #[test]
    fn parse_response_rejects_mismatched_or_empty() {
        let query = build_query("example.com", 7).unwrap();

        let reply = response_for(&query, vec![RData::A(A(Ipv4Addr::LOCALHOST))]);
        assert!(matches!(
            parse_response(&reply, 8),
            Err(WaypointError::DnsDecode(_))
        ));

        let reply = response_for(&query, Vec::new());
        assert!(matches!(
            parse_response(&reply, 7),
            Err(WaypointError::Resolution(_))
        ));

        assert!(matches!(
            parse_response(&[0x00, 0x07, 0x81], 7),
            Err(WaypointError::DnsDecode(_))
        ));
        assert!(matches!(
            parse_response(&query, 7),
            Err(WaypointError::DnsDecode(_))
        ));
    }

    #[tokio::test]
    async fn exchange_uses_length_prefix_framing() {
        let query = build_query("example.com", 42).unwrap();
        let reply = response_for(&query, vec![RData::A(A(Ipv4Addr::new(10, 1, 2, 3)))]);

        let mut framed_query = (query.len() as u16).to_be_bytes().to_vec();
        framed_query.extend_from_slice(&query);

        let mut mock = tokio_test::io::Builder::new()
            .write(&framed_query)
            .read(&(reply.len() as u16).to_be_bytes())
            .read(&reply)
            .build();

        let bytes = exchange(&mut mock, &query).await.unwrap();
        assert_eq!(
            parse_response(&bytes, 42).unwrap(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))]
        );
    }

    #[tokio::test]
    async fn exchange_reports_short_reads() {
        let query = build_query("example.com", 1).unwrap();
        let mut framed_query = (query.len() as u16).to_be_bytes().to_vec();
        framed_query.extend_from_slice(&query);

        let mut mock = tokio_test::io::Builder::new()
            .write(&framed_query)
            .read(&[0x00, 0x40])
            .read(&[0xde, 0xad])
            .build();

        let err = exchange(&mut mock, &query).await.unwrap_err();
        assert!(matches!(err, WaypointError::DnsDecode(msg) if msg.contains("message body")));
    }

    #[tokio::test]
    async fn resolve_via_tcp_direct() {
        let port = spawn_dns_server(vec![
            RData::A(A(Ipv4Addr::new(192, 0, 2, 10))),
            RData::A(A(Ipv4Addr::new(192, 0, 2, 11))),
        ])
        .await;

        let addrs = resolve_via_tcp(
            &dialer(),
            "www.example.com",
            &format!("127.0.0.1:{}", port),
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            addrs,
            vec![
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 11)),
            ]
        );
    }

    #[tokio::test]
    async fn resolve_via_tcp_through_proxy() {
        let dns_port = spawn_dns_server(vec![RData::A(A(Ipv4Addr::new(198, 51, 100, 7)))]).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        let proxy = tokio::spawn(async move {
            let (mut client, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = client.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();

            let mut server = tokio::net::TcpStream::connect(("127.0.0.1", dns_port))
                .await
                .unwrap();
            client
                .write_all(b"HTTP/1.1 200 Connection established\r\nVia: test\r\n\r\n")
                .await
                .unwrap();
            let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
            request
        });

        let addrs = resolve_via_tcp(
            &dialer(),
            "www.example.com",
            &format!("127.0.0.1:{}", dns_port),
            Some(&format!("127.0.0.1:{}", proxy_port)),
            Some(("user", "secret")),
        )
        .await
        .unwrap();
        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))]);

        let request = proxy.await.unwrap();
        assert!(request.starts_with(&format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n", dns_port)));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n"));
    }
}
