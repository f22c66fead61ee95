use clap::Parser;
use soe_shared::{
    AckBody, DisconnectBody, DisconnectReason, Message, OpCode, Packet, SessionRequestBody,
    SessionResponseBody, DEFAULT_PROTOCOL_NAME, DEFAULT_UDP_LENGTH,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

/// Drives a running SOE server by hand: opens a session, sends a few
/// messages and disconnects.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:20260")]
    server: SocketAddr,
    /// Session id to announce
    #[clap(long, default_value = "305419896")]
    session: u32,
    /// Number of small messages to send
    #[clap(short, long, default_value = "5")]
    count: u16,
}

async fn print_replies(
    socket: &UdpSocket,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut buf = [0u8; 2048];

    while let Ok(received) = timeout(wait, socket.recv_from(&mut buf)).await {
        let (len, _) = received?;
        let packet = Packet::from_bytes(buf[..len].to_vec())?;

        match packet.opcode() {
            OpCode::SessionResponse => {
                let body: SessionResponseBody = packet.reader().read()?;
                println!(
                    "Session {:#010x} accepted, udp length {}",
                    body.session_id, body.udp_length
                );
            }
            OpCode::AckReliableData => {
                let body: AckBody = packet.reader().read()?;
                println!("Ack {}", body.sequence);
            }
            OpCode::OutOfOrderReliableData => {
                let body: AckBody = packet.reader().read()?;
                println!("Out of order {}", body.sequence);
            }
            OpCode::Disconnect => {
                let body: DisconnectBody = packet.reader().read()?;
                let reason = DisconnectReason::try_from(body.reason)
                    .map(|reason| reason.to_string())
                    .unwrap_or_else(|code| format!("code {}", code));
                println!("Disconnected by server: {}", reason);
            }
            other => println!("Received {:?} ({} bytes)", other, len),
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(args.server).await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    let request = Packet::session_request(
        SessionRequestBody {
            crc_length: 0,
            session_id: args.session,
            udp_length: DEFAULT_UDP_LENGTH,
        },
        DEFAULT_PROTOCOL_NAME,
    )?;
    println!("Sending session request to {}", args.server);
    socket.send(request.raw()).await?;
    print_replies(&socket, Duration::from_millis(500)).await?;

    let mut sequence: u16 = 0;
    for i in 0..args.count {
        let text = format!("hello {}", i);
        socket
            .send(Packet::reliable_data(sequence, text.as_bytes())?.raw())
            .await?;
        println!("Sent '{}' as sequence {}", text, sequence);
        sequence = sequence.wrapping_add(1);
        print_replies(&socket, Duration::from_millis(200)).await?;
    }

    // A message large enough to need several fragments
    let large: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let fragment_size = DEFAULT_UDP_LENGTH as usize - soe_shared::FRAGMENT_HEADER_LEN;
    let message = Message::fragmented(large, fragment_size);
    let total_size = message.len() as u32;
    for (index, fragment) in message.fragments().iter().enumerate() {
        let total = if index == 0 { Some(total_size) } else { None };
        socket
            .send(Packet::fragment(sequence, total, fragment)?.raw())
            .await?;
        sequence = sequence.wrapping_add(1);
        sleep(Duration::from_millis(5)).await;
    }
    println!(
        "Sent {} byte message in {} fragments",
        total_size,
        message.fragments().len()
    );
    print_replies(&socket, Duration::from_millis(500)).await?;

    socket
        .send(Packet::disconnect(args.session, DisconnectReason::Application)?.raw())
        .await?;
    println!("Test client finished");

    Ok(())
}
