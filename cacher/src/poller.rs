//! Upstream refresh: one poller per query kind keeps its cached reply fresh.

use crate::config::Config;
use crate::network::bind_socket;
use crate::response::ResponseCache;
use a2s::QueryKind;
use log::{debug, info, warn};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{timeout, MissedTickBehavior};

/// Why a single refresh cycle produced nothing to cache. The previous
/// payload keeps being served regardless.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("game server did not answer within {0:?}")]
    Timeout(Duration),
    #[error("unexpected reply of {len} bytes")]
    UnexpectedReply { len: usize },
    #[error("game server answered the challenge with another challenge")]
    RepeatedChallenge,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Queries the game server for one kind on a fixed interval and stores the
/// verbatim reply. Runs the same two-phase handshake a plain client would:
/// initial request, then a repeat carrying the code if the server answers
/// with a challenge.
pub struct Poller {
    kind: QueryKind,
    socket: UdpSocket,
    responses: Arc<ResponseCache>,
    update_interval: Duration,
    recv_timeout: Duration,
    buffer_size: usize,
}

impl Poller {
    /// Binds and connects the upstream socket. Failure here is fatal to
    /// startup: the kind could never become ready.
    pub async fn connect(
        kind: QueryKind,
        responses: Arc<ResponseCache>,
        config: &Config,
    ) -> io::Result<Self> {
        let bind_addr = match config.game_server {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = bind_socket(bind_addr, config.recv_buffer_size, config.send_buffer_size)?;
        socket.connect(config.game_server).await?;
        info!("{} poller connected to {}", kind.name(), config.game_server);

        Ok(Self {
            kind,
            socket,
            responses,
            update_interval: config.update_interval,
            recv_timeout: config.upstream_timeout,
            buffer_size: config.datagram_buffer_size,
        })
    }

    /// Refreshes until shutdown is signalled. A failed cycle is logged and
    /// retried on the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = vec![0u8; self.buffer_size];
        let mut timer = tokio::time::interval(self.update_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.refresh(&mut buffer).await {
                        warn!("{} refresh failed: {}", self.kind.name(), e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        debug!("{} poller stopped", self.kind.name());
    }

    /// One full refresh cycle: initial request, an optional challenge
    /// round, then storing the reply byte-for-byte.
    async fn refresh(&self, buffer: &mut [u8]) -> Result<(), PollError> {
        self.socket.send(&a2s::initial_request(self.kind)).await?;
        let len = self.recv(buffer).await?;

        let reply = match a2s::parse_challenge_response(&buffer[..len]) {
            Some(code) => {
                self.socket
                    .send(&a2s::request_with_code(self.kind, code))
                    .await?;
                let len = self.recv(buffer).await?;
                if a2s::parse_challenge_response(&buffer[..len]).is_some() {
                    return Err(PollError::RepeatedChallenge);
                }
                &buffer[..len]
            }
            None => &buffer[..len],
        };

        if !a2s::is_expected_reply(self.kind, reply) {
            return Err(PollError::UnexpectedReply { len: reply.len() });
        }

        let first_fill = !self.responses.is_ready(self.kind);
        self.responses.store(self.kind, reply.to_vec());
        if first_fill {
            info!("{} cache ready ({} bytes)", self.kind.name(), reply.len());
        }

        Ok(())
    }

    async fn recv(&self, buffer: &mut [u8]) -> Result<usize, PollError> {
        match timeout(self.recv_timeout, self.socket.recv(buffer)).await {
            Ok(received) => Ok(received?),
            Err(_) => Err(PollError::Timeout(self.recv_timeout)),
        }
    }
}
