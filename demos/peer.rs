//! Example Control Peer
//!
//! Attaches to a running datapath, sends a burst of control requests,
//! waits for their replies, then sends a packet and polls for the upcall.

use ringlink::{Family, LinkError, MessageHeader, PosixRegistry, Transport, WaitPolicy};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let ring_id = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let mut transport = match Transport::init(&PosixRegistry::new(), ring_id) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("[Peer] Failed to attach: {}", e);
            std::process::exit(1);
        }
    };

    let requests: Vec<MessageHeader> = (0..8)
        .map(|i| MessageHeader {
            cookie: i,
            ..MessageHeader::control(Family::FLOW, 1)
        })
        .collect();

    let start = Instant::now();
    if let Err(e) = transport.send_bulk(&requests, &[]) {
        eprintln!("[Peer] Burst rejected: {}", e);
        std::process::exit(1);
    }

    let wait = WaitPolicy::forever().with_timeout(Duration::from_secs(2));
    let mut reply = Vec::new();
    for _ in 0..requests.len() {
        match transport.recv_reply_with(&mut reply, &wait) {
            Ok(header) => println!(
                "[Peer] Reply cookie={} body={}",
                header.cookie,
                String::from_utf8_lossy(&reply[ringlink::message::HEADER_SIZE..])
            ),
            Err(e) => {
                eprintln!("[Peer] No reply: {}", e);
                std::process::exit(1);
            }
        }
    }
    println!("[Peer] {} round trips in {:?}", requests.len(), start.elapsed());

    let frame = vec![0xAB; 1500];
    if let Err(e) = transport.send(&MessageHeader::packet(1), &frame) {
        eprintln!("[Peer] Packet rejected: {}", e);
        std::process::exit(1);
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match transport.recv_packet() {
            Ok(upcall) => {
                println!(
                    "[Peer] Upcall reason={} in_port={} len={}",
                    upcall.info.reason,
                    upcall.info.in_port,
                    upcall.packet.len()
                );
                break;
            }
            Err(LinkError::WouldBlock) if Instant::now() < deadline => std::thread::yield_now(),
            Err(e) => {
                eprintln!("[Peer] No upcall: {}", e);
                break;
            }
        }
    }
}
