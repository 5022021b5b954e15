//! End-to-end routing: registry scoring, tunnelling and latency feedback.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use waypoint::geo::{CountryLookup, GeoLocator, PrefixTable};
use waypoint::proxy::{Dialer, ProxyRegistry, TunnelConfig, TunnelHandler};
use waypoint::resolver::CachingResolver;
use waypoint::WaypointError;

struct NoLookup;

#[async_trait]
impl CountryLookup for NoLookup {
    async fn country_of(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

struct Harness {
    registry: Arc<ProxyRegistry>,
    geo: GeoLocator,
    tunnels: TunnelHandler,
}

fn harness(lookup: Arc<dyn CountryLookup>) -> Harness {
    let dialer = Arc::new(Dialer::new(Arc::new(CachingResolver::default())));
    Harness {
        registry: Arc::new(ProxyRegistry::new()),
        geo: GeoLocator::new(dialer.clone(), lookup),
        tunnels: TunnelHandler::new(
            dialer,
            TunnelConfig {
                idle_timeout: Duration::from_secs(5),
                buffer_size: 4096,
                max_retries: 2,
            },
        ),
    }
}

async fn spawn_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

async fn spawn_connect_proxy() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((client, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut client = BufReader::new(client);
                let mut line = String::new();
                client.read_line(&mut line).await.unwrap();
                let authority = line.split_whitespace().nth(1).unwrap().to_string();
                loop {
                    let mut header = String::new();
                    client.read_line(&mut header).await.unwrap();
                    if header == "\r\n" {
                        break;
                    }
                }
                let mut upstream = TcpStream::connect(authority.as_str()).await.unwrap();
                client
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .unwrap();
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn selected_parent_relays_and_learns_latency() {
    let echo_port = spawn_echo().await;
    let proxy_port = spawn_connect_proxy().await;

    let h = harness(Arc::new(NoLookup));
    h.registry
        .add_str("primary", &format!("http://127.0.0.1:{} 10 10 2", proxy_port))
        .unwrap();
    h.registry
        .add_str("secondary", &format!("http://127.0.0.1:{} 10 30 2", proxy_port))
        .unwrap();

    let endpoint = h
        .registry
        .select(&Method::CONNECT, None, None, &h.geo)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(endpoint.name(), "primary");

    let before = endpoint
        .priority(&Method::CONNECT, None, None, &h.geo)
        .await
        .unwrap();
    assert_eq!(before, 10.0);

    let (client, mut client_peer) = tokio::io::duplex(4096);
    let relay = {
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            h.tunnels
                .relay(client, &endpoint, "127.0.0.1", echo_port)
                .await
        })
    };

    client_peer.write_all(b"routed payload").await.unwrap();
    let mut reply = [0u8; 14];
    client_peer.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"routed payload");
    drop(client_peer);

    let (sent, received) = tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .expect("relay did not finish")
        .unwrap()
        .unwrap();
    assert_eq!((sent, received), (14, 14));

    // The session's setup time now weighs on the endpoint's score.
    assert_eq!(endpoint.latency().tracked_hosts(), 1);
    assert!(endpoint.avg_resp_time(None) > 0.0);
}

#[tokio::test]
async fn failing_parent_falls_through_to_next_candidate() {
    let echo_port = spawn_echo().await;
    let proxy_port = spawn_connect_proxy().await;
    let dead_port = closed_port().await;

    let h = harness(Arc::new(NoLookup));
    h.registry
        .add_str("dead", &format!("http://127.0.0.1:{} 5 5 1", dead_port))
        .unwrap();
    h.registry
        .add_str("alive", &format!("http://127.0.0.1:{} 20 20 2", proxy_port))
        .unwrap();

    let candidates = h
        .registry
        .rank(&Method::CONNECT, None, None, &h.geo)
        .await
        .unwrap()
        .into_iter()
        .map(|(_, endpoint)| endpoint)
        .collect::<Vec<_>>();
    assert_eq!(candidates[0].name(), "dead");

    let tunnel = h
        .tunnels
        .open_first(&candidates, "127.0.0.1", echo_port)
        .await
        .unwrap();
    assert_eq!(tunnel.endpoint.name(), "alive");
    assert_eq!(candidates[0].latency().tracked_hosts(), 0);
}

#[tokio::test]
async fn destination_country_steers_selection() {
    let table = PrefixTable::parse("93.184.216.0/24 DE\n").unwrap();
    let h = harness(Arc::new(table));

    h.registry
        .add_str("us", "http://10.0.0.1:8080/?location=US 20")
        .unwrap();
    h.registry
        .add_str("fr", "http://10.0.0.2:8080/?location=FR 20")
        .unwrap();
    h.registry
        .add_str("de", "http://10.0.0.3:8080/?location=DE 21")
        .unwrap();

    let country = h.geo.locate_host("93.184.216.34").await.unwrap();
    assert_eq!(country, "DE");

    let ranked = h
        .registry
        .rank(&Method::GET, Some("93.184.216.34"), Some(&country), &h.geo)
        .await
        .unwrap();
    let order = ranked
        .iter()
        .map(|(score, endpoint)| (endpoint.name().to_string(), *score))
        .collect::<Vec<_>>();

    assert_eq!(
        order,
        vec![
            ("fr".to_string(), 19.0),
            ("de".to_string(), 19.0),
            ("us".to_string(), 20.0),
        ]
    );
}

#[tokio::test]
async fn partial_scoring_arguments_are_rejected() {
    let h = harness(Arc::new(NoLookup));
    h.registry.add_str("a", "http://10.0.0.1:8080 10").unwrap();

    let err = h
        .registry
        .select(&Method::GET, Some("example.com"), None, &h.geo)
        .await
        .unwrap_err();
    assert!(matches!(err, WaypointError::InvalidUsage(_)));
}
