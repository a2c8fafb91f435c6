//! UDP front end: socket setup and the receiver/sender task pair serving
//! client queries.

use crate::config::Config;
use crate::handler::{Handler, Reply};
use log::{debug, error, info};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// Binds a non-blocking UDP socket with explicit kernel buffer sizes and
/// hands it to tokio. Dual-stack when given an IPv6 address.
pub fn bind_socket(
    addr: SocketAddr,
    recv_buffer: usize,
    send_buffer: usize,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_recv_buffer_size(recv_buffer)?;
    socket.set_send_buffer_size(send_buffer)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

struct Outbound {
    peer: SocketAddr,
    reply: Reply,
}

/// The listening side of the proxy. Several receiver tasks share one
/// socket and feed a single sender task, so a slow send never blocks
/// packet intake.
pub struct QueryServer {
    socket: Arc<UdpSocket>,
    handler: Arc<Handler>,
    threads: usize,
    buffer_size: usize,
}

impl QueryServer {
    pub fn bind(config: &Config, handler: Arc<Handler>) -> io::Result<Self> {
        let socket = bind_socket(config.bind, config.recv_buffer_size, config.send_buffer_size)?;
        info!("Listening on {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            handler,
            threads: config.threads,
            buffer_size: config.datagram_buffer_size,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::new();
        for id in 0..self.threads {
            let socket = Arc::clone(&self.socket);
            let handler = Arc::clone(&self.handler);
            let tx = tx.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(run_receiver(
                id,
                socket,
                handler,
                tx,
                shutdown,
                self.buffer_size,
            )));
        }
        // The sender stops once every receiver has dropped its handle
        drop(tx);
        tasks.push(tokio::spawn(run_sender(Arc::clone(&self.socket), rx)));

        for task in tasks {
            if let Err(e) = task.await {
                error!("Server task panicked: {}", e);
            }
        }
    }
}

async fn run_receiver(
    id: usize,
    socket: Arc<UdpSocket>,
    handler: Arc<Handler>,
    tx: mpsc::UnboundedSender<Outbound>,
    mut shutdown: watch::Receiver<bool>,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buffer) => {
                match result {
                    Ok((len, peer)) => {
                        if let Some(reply) = handler.handle(peer, &buffer[..len]) {
                            if tx.send(Outbound { peer, reply }).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("Receiver {} stopped", id);
}

async fn run_sender(socket: Arc<UdpSocket>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        if let Err(e) = socket
            .send_to(outbound.reply.as_bytes(), outbound.peer)
            .await
        {
            error!("Failed to send reply to {}: {}", outbound.peer, e);
        }
    }

    debug!("Sender stopped");
}
