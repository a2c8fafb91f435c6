use a2s::QueryKind;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Sends one query through the full challenge handshake and prints what
/// comes back. Works against a cacher or a game server directly.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to query
    #[arg(short, long, default_value = "127.0.0.1:27016")]
    server: SocketAddr,

    /// Query to send: info, player or rules
    #[arg(short, long, default_value = "info")]
    query: String,

    /// Receive timeout in milliseconds
    #[arg(short, long, default_value = "2000")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let kind = match args.query.to_lowercase().as_str() {
        "info" => QueryKind::Info,
        "player" | "players" => QueryKind::Player,
        "rules" => QueryKind::Rules,
        other => return Err(format!("unknown query kind: {}", other).into()),
    };
    let recv_timeout = Duration::from_millis(args.timeout);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(args.server).await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    println!("Sending {} request to {}", kind.name(), args.server);
    socket.send(&a2s::initial_request(kind)).await?;

    let mut buffer = [0u8; 65535];
    let len = timeout(recv_timeout, socket.recv(&mut buffer)).await??;

    let reply = match a2s::parse_challenge_response(&buffer[..len]) {
        Some(code) => {
            println!(
                "Received challenge code {:08X}, repeating the request",
                u32::from_be_bytes(code)
            );
            socket.send(&a2s::request_with_code(kind, code)).await?;
            let len = timeout(recv_timeout, socket.recv(&mut buffer)).await??;
            &buffer[..len]
        }
        None => &buffer[..len],
    };

    println!("Received {} bytes", reply.len());
    if reply.starts_with(&a2s::SPLIT_PACKET_PREFIX) {
        println!("Reply is split across packets");
    } else if reply.len() >= 5 {
        println!("Reply type: 0x{:02X}", reply[4]);
    }
    if !a2s::is_expected_reply(kind, reply) {
        println!("Warning: reply does not look like a {} response", kind.name());
    }
    println!("First bytes: {}", hex_preview(reply, 32));

    Ok(())
}

fn hex_preview(data: &[u8], limit: usize) -> String {
    let shown: Vec<String> = data
        .iter()
        .take(limit)
        .map(|b| format!("{:02X}", b))
        .collect();
    let mut preview = shown.join(" ");
    if data.len() > limit {
        preview.push_str(" ...");
    }
    preview
}
