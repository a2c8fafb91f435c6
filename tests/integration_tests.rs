//! Integration tests for the caching query proxy.
//!
//! These tests run a real proxy against a mock game server over loopback
//! UDP and validate the challenge handshake end to end.

use a2s::{QueryKind, Request};
use cacher::challenge::{self, ChallengeCache};
use cacher::config::Config;
use cacher::handler::Handler;
use cacher::network::QueryServer;
use cacher::poller::Poller;
use cacher::response::ResponseCache;
use cacher::stats::Stats;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Challenge code every mock game server hands out.
const MOCK_CODE: [u8; 4] = [0xAB, 0xCD, 0xEF, 0x12];

/// WIRE PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Tests the two-phase handshake directly against the mock game server
    #[tokio::test]
    async fn mock_game_server_handshake() {
        let game_server = spawn_mock_game_server().await;
        let client = connect_client(game_server).await;

        for kind in QueryKind::ALL {
            let payload = handshake(&client, kind).await;
            assert_eq!(payload, mock_reply(kind));
            assert!(a2s::is_expected_reply(kind, &payload));
        }
    }

    /// Tests the shape of the challenge reply and that both request forms
    /// are honored
    #[tokio::test]
    async fn challenge_reply_shape_and_request_forms() {
        let game_server = spawn_mock_game_server().await;
        let proxy = start_proxy(game_server).await;
        wait_ready(&proxy.responses).await;

        let client = connect_client(proxy.addr).await;

        // Zeroed code field
        client
            .send(&a2s::initial_request(QueryKind::Player))
            .await
            .unwrap();
        let reply = recv_reply(&client).await;
        assert_eq!(reply.len(), 9);
        assert_eq!(reply[..5], a2s::CHALLENGE_RESPONSE_HEADER);
        let first = a2s::parse_challenge_response(&reply).unwrap();
        assert_ne!(first, a2s::CHALLENGE_REQUEST_FF);
        assert_ne!(first, a2s::CHALLENGE_REQUEST_ZERO);

        // All-FF code field, same peer, so the same code comes back
        let mut ff_form = a2s::PLAYER_REQUEST_HEADER.to_vec();
        ff_form.extend_from_slice(&a2s::CHALLENGE_REQUEST_FF);
        client.send(&ff_form).await.unwrap();
        let second = a2s::parse_challenge_response(&recv_reply(&client).await).unwrap();
        assert_eq!(first, second);

        proxy.stop().await;
    }
}

/// CACHE REFRESH TESTS
mod cache_tests {
    use super::*;

    /// Tests that the pollers fill every cache slot with the upstream bytes
    #[tokio::test]
    async fn pollers_fill_all_caches() {
        let game_server = spawn_mock_game_server().await;
        let proxy = start_proxy(game_server).await;
        wait_ready(&proxy.responses).await;

        for kind in QueryKind::ALL {
            let cached = proxy.responses.load(kind).expect("slot must be filled");
            assert_eq!(*cached, mock_reply(kind));
        }

        proxy.stop().await;
    }

    /// Tests that later refreshes replace the cached payload
    #[tokio::test]
    async fn cache_refresh_propagates() {
        let game_server = spawn_counting_game_server().await;
        let proxy = start_proxy(game_server).await;
        wait_ready(&proxy.responses).await;

        let before = proxy.responses.load(QueryKind::Info).unwrap();
        sleep(Duration::from_millis(200)).await;
        let after = proxy.responses.load(QueryKind::Info).unwrap();

        assert_ne!(*before, *after);

        proxy.stop().await;
    }

    /// Tests that a split upstream reply is cached and served untouched
    #[tokio::test]
    async fn split_replies_cached_verbatim() {
        let (game_server, split_reply) = spawn_split_rules_game_server().await;
        let proxy = start_proxy(game_server).await;
        wait_ready(&proxy.responses).await;

        let client = connect_client(proxy.addr).await;
        let payload = handshake(&client, QueryKind::Rules).await;
        assert_eq!(payload, split_reply);

        proxy.stop().await;
    }
}

/// PROXY BEHAVIOR TESTS
mod proxy_tests {
    use super::*;

    /// Tests the full client handshake for every query kind
    #[tokio::test]
    async fn full_handshake_serves_cached_payload() {
        let game_server = spawn_mock_game_server().await;
        let proxy = start_proxy(game_server).await;
        wait_ready(&proxy.responses).await;

        let client = connect_client(proxy.addr).await;
        for kind in QueryKind::ALL {
            assert_eq!(handshake(&client, kind).await, mock_reply(kind));
        }

        proxy.stop().await;
    }

    /// Tests that a challenge code cannot be used twice
    #[tokio::test]
    async fn replayed_code_rejected() {
        let game_server = spawn_mock_game_server().await;
        let proxy = start_proxy(game_server).await;
        wait_ready(&proxy.responses).await;

        let client = connect_client(proxy.addr).await;
        let code = request_challenge(&client, QueryKind::Rules).await;

        client
            .send(&a2s::request_with_code(QueryKind::Rules, code))
            .await
            .unwrap();
        assert_eq!(recv_reply(&client).await, mock_reply(QueryKind::Rules));

        // The first use consumed the code
        client
            .send(&a2s::request_with_code(QueryKind::Rules, code))
            .await
            .unwrap();
        expect_no_reply(&client).await;

        proxy.stop().await;
    }

    /// Tests that a wrong code gets no reply and burns the outstanding one
    #[tokio::test]
    async fn spoofed_code_consumed_and_recoverable() {
        let game_server = spawn_mock_game_server().await;
        let proxy = start_proxy(game_server).await;
        wait_ready(&proxy.responses).await;

        let client = connect_client(proxy.addr).await;
        let code = request_challenge(&client, QueryKind::Info).await;

        let wrong = if code == [0x12, 0x34, 0x56, 0x78] {
            [0x87, 0x65, 0x43, 0x21]
        } else {
            [0x12, 0x34, 0x56, 0x78]
        };
        client
            .send(&a2s::request_with_code(QueryKind::Info, wrong))
            .await
            .unwrap();
        expect_no_reply(&client).await;

        // The mismatch consumed the real code as well
        client
            .send(&a2s::request_with_code(QueryKind::Info, code))
            .await
            .unwrap();
        expect_no_reply(&client).await;

        // A fresh handshake recovers
        assert_eq!(
            handshake(&client, QueryKind::Info).await,
            mock_reply(QueryKind::Info)
        );

        proxy.stop().await;
    }

    /// Tests that codes are tracked per source address, not per socket
    #[tokio::test]
    async fn codes_shared_across_source_ports() {
        let game_server = spawn_mock_game_server().await;
        let proxy = start_proxy(game_server).await;
        wait_ready(&proxy.responses).await;

        let first_socket = connect_client(proxy.addr).await;
        let second_socket = connect_client(proxy.addr).await;

        // Both sockets are 127.0.0.1, so a code issued to one works
        // from the other
        let code = request_challenge(&first_socket, QueryKind::Info).await;
        second_socket
            .send(&a2s::request_with_code(QueryKind::Info, code))
            .await
            .unwrap();
        assert_eq!(
            recv_reply(&second_socket).await,
            mock_reply(QueryKind::Info)
        );

        proxy.stop().await;
    }

    /// Tests that every query is dropped while any cache slot is empty
    #[tokio::test]
    async fn queries_dropped_until_cache_ready() {
        // Bound but silent, so the pollers keep timing out
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy = start_proxy(silent.local_addr().unwrap()).await;

        let client = connect_client(proxy.addr).await;
        client
            .send(&a2s::initial_request(QueryKind::Info))
            .await
            .unwrap();
        expect_no_reply(&client).await;

        proxy.stop().await;
    }
}

/// STRESS AND ERROR HANDLING TESTS
mod stress_tests {
    use super::*;

    /// Tests many clients requesting challenges at once
    #[tokio::test]
    async fn concurrent_challenge_hammer() {
        let game_server = spawn_mock_game_server().await;
        let proxy = start_proxy(game_server).await;
        wait_ready(&proxy.responses).await;

        let mut workers = Vec::new();
        for _ in 0..16 {
            let addr = proxy.addr;
            workers.push(tokio::spawn(async move {
                let client = connect_client(addr).await;
                for _ in 0..50 {
                    let code = request_challenge(&client, QueryKind::Player).await;
                    assert_ne!(code, a2s::CHALLENGE_REQUEST_FF);
                    assert_ne!(code, a2s::CHALLENGE_REQUEST_ZERO);
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        proxy.stop().await;
    }

    /// Tests back-to-back full handshakes from a single client
    #[tokio::test]
    async fn sequential_handshake_churn() {
        let game_server = spawn_mock_game_server().await;
        let proxy = start_proxy(game_server).await;
        wait_ready(&proxy.responses).await;

        let client = connect_client(proxy.addr).await;
        let expected = mock_reply(QueryKind::Player);
        for _ in 0..50 {
            assert_eq!(handshake(&client, QueryKind::Player).await, expected);
        }

        proxy.stop().await;
    }

    /// Tests that malformed packets are ignored without disturbing service
    #[tokio::test]
    async fn malformed_packet_handling() {
        let game_server = spawn_mock_game_server().await;
        let proxy = start_proxy(game_server).await;
        wait_ready(&proxy.responses).await;

        let client = connect_client(proxy.addr).await;

        client.send(&[]).await.unwrap();
        client.send(&[0u8; 9]).await.unwrap();
        client.send(&[0u8; 24]).await.unwrap();
        client.send(&[0xFF; 29]).await.unwrap();
        client.send(b"GET / HTTP/1.1\r\n\r\nabcdefg").await.unwrap();
        expect_no_reply(&client).await;

        // Valid traffic still flows afterwards
        assert_eq!(
            handshake(&client, QueryKind::Info).await,
            mock_reply(QueryKind::Info)
        );

        proxy.stop().await;
    }
}

// HELPER FUNCTIONS

/// A proxy wired up the same way the daemon does it, listening on an
/// ephemeral port.
struct TestProxy {
    addr: SocketAddr,
    responses: Arc<ResponseCache>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestProxy {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn build_test_config(game_server: SocketAddr) -> Config {
    let mut config = Config::default();
    config.bind = "127.0.0.1:0".parse().unwrap();
    config.game_server = game_server;
    config.update_interval = Duration::from_millis(50);
    config.upstream_timeout = Duration::from_millis(500);
    config
}

async fn start_proxy(game_server: SocketAddr) -> TestProxy {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = build_test_config(game_server);
    let challenges = Arc::new(ChallengeCache::new(
        config.challenge_ttl,
        config.max_challenge_codes,
        config.challenge_concurrency,
    ));
    let responses = Arc::new(ResponseCache::new());
    let stats = Arc::new(Stats::new(false, false));
    let handler = Arc::new(Handler::new(
        Arc::clone(&challenges),
        Arc::clone(&responses),
        stats,
    ));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    for kind in QueryKind::ALL {
        let poller = Poller::connect(kind, Arc::clone(&responses), &config)
            .await
            .expect("poller setup failed");
        tasks.push(tokio::spawn(poller.run(shutdown_rx.clone())));
    }
    tasks.push(tokio::spawn(challenge::run_sweeper(
        Arc::clone(&challenges),
        config.cleaner_interval,
        shutdown_rx.clone(),
    )));

    let server = QueryServer::bind(&config, handler).expect("bind failed");
    let addr = server.local_addr().unwrap();
    tasks.push(tokio::spawn(server.run(shutdown_rx)));

    TestProxy {
        addr,
        responses,
        shutdown,
        tasks,
    }
}

async fn wait_ready(responses: &ResponseCache) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !responses.all_ready() {
        assert!(Instant::now() < deadline, "cache never became ready");
        sleep(Duration::from_millis(10)).await;
    }
}

fn mock_reply(kind: QueryKind) -> Vec<u8> {
    let mut reply = vec![0xFF, 0xFF, 0xFF, 0xFF, kind.reply_type()];
    match kind {
        QueryKind::Info => reply.extend_from_slice(b"\x11mock server\x00de_dust2\x00"),
        QueryKind::Player => reply.extend_from_slice(&[0x02, 0x00, b'p', b'1', 0x00]),
        QueryKind::Rules => reply.extend_from_slice(b"\x01\x00sv_cheats\x000\x00"),
    }
    reply
}

/// Answers like a real game server: a challenge for anything without the
/// right code, the payload once the code is presented.
async fn spawn_mock_game_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buffer = [0u8; 2048];
        while let Ok((len, peer)) = socket.recv_from(&mut buffer).await {
            let reply = match a2s::classify(&buffer[..len]) {
                Some(Request::Query { kind, code }) if code == MOCK_CODE => mock_reply(kind),
                Some(_) => a2s::challenge_response(MOCK_CODE).to_vec(),
                None => continue,
            };
            let _ = socket.send_to(&reply, peer).await;
        }
    });

    addr
}

/// Like the plain mock, but the reply body carries a counter that changes
/// on every answered query.
async fn spawn_counting_game_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buffer = [0u8; 2048];
        let mut refreshes: u32 = 0;
        while let Ok((len, peer)) = socket.recv_from(&mut buffer).await {
            let reply = match a2s::classify(&buffer[..len]) {
                Some(Request::Query { kind, code }) if code == MOCK_CODE => {
                    refreshes = refreshes.wrapping_add(1);
                    let mut reply = vec![0xFF, 0xFF, 0xFF, 0xFF, kind.reply_type()];
                    reply.extend_from_slice(&refreshes.to_le_bytes());
                    reply
                }
                Some(_) => a2s::challenge_response(MOCK_CODE).to_vec(),
                None => continue,
            };
            let _ = socket.send_to(&reply, peer).await;
        }
    });

    addr
}

fn split_rules_reply() -> Vec<u8> {
    let mut reply = a2s::SPLIT_PACKET_PREFIX.to_vec();
    reply.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]); // packet id
    reply.push(2); // total fragments
    reply.push(0); // fragment number
    reply.extend_from_slice(b"first half of an oversized rules reply");
    reply
}

/// Mock whose RULES payload is the first fragment of a split reply.
async fn spawn_split_rules_game_server() -> (SocketAddr, Vec<u8>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let split_reply = split_rules_reply();

    let rules_reply = split_reply.clone();
    tokio::spawn(async move {
        let mut buffer = [0u8; 2048];
        while let Ok((len, peer)) = socket.recv_from(&mut buffer).await {
            let reply = match a2s::classify(&buffer[..len]) {
                Some(Request::Query {
                    kind: QueryKind::Rules,
                    code,
                }) if code == MOCK_CODE => rules_reply.clone(),
                Some(Request::Query { kind, code }) if code == MOCK_CODE => mock_reply(kind),
                Some(_) => a2s::challenge_response(MOCK_CODE).to_vec(),
                None => continue,
            };
            let _ = socket.send_to(&reply, peer).await;
        }
    });

    (addr, split_reply)
}

async fn connect_client(addr: SocketAddr) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(addr).await.unwrap();
    socket
}

async fn recv_reply(socket: &UdpSocket) -> Vec<u8> {
    let mut buffer = [0u8; 4096];
    let len = timeout(Duration::from_secs(1), socket.recv(&mut buffer))
        .await
        .expect("timed out waiting for a reply")
        .expect("recv failed");
    buffer[..len].to_vec()
}

async fn expect_no_reply(socket: &UdpSocket) {
    let mut buffer = [0u8; 4096];
    let result = timeout(Duration::from_millis(300), socket.recv(&mut buffer)).await;
    assert!(result.is_err(), "expected no reply but got one");
}

async fn request_challenge(socket: &UdpSocket, kind: QueryKind) -> [u8; 4] {
    socket.send(&a2s::initial_request(kind)).await.unwrap();
    let reply = recv_reply(socket).await;
    a2s::parse_challenge_response(&reply).expect("expected a challenge response")
}

async fn handshake(socket: &UdpSocket, kind: QueryKind) -> Vec<u8> {
    let code = request_challenge(socket, kind).await;
    socket
        .send(&a2s::request_with_code(kind, code))
        .await
        .unwrap();
    recv_reply(socket).await
}
