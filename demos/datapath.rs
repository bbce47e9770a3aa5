//! Example Datapath (ring owner)
//!
//! Creates the link resources and a handful of KNI port bundles, then
//! answers every control request and reflects every packet back up to the
//! peer as an upcall.
//!
//! Run with `RUST_LOG=ringlink=debug` for per-ring logging.

use ringlink::{
    Datapath, KniConfig, KniProvisioner, LinkConfig, LinkError, PosixRegistry, UpcallInfo,
    WaitPolicy,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Upcall reason for packets sent back by this demo
const REASON_REFLECT: u32 = 2;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let ring_id = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let registry = PosixRegistry::new();
    let config = LinkConfig {
        ring_id,
        ..LinkConfig::default()
    };

    let mut datapath = match Datapath::create(&registry, &config) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("[Datapath] Failed to create link: {}", e);
            std::process::exit(1);
        }
    };

    let kni = KniConfig {
        max_ports: 4,
        ..KniConfig::default()
    };
    let report = match KniProvisioner::new(&registry, kni) {
        Ok(provisioner) => provisioner.provision_all(),
        Err(e) => {
            eprintln!("[Datapath] Bad KNI config: {}", e);
            std::process::exit(1);
        }
    };
    println!(
        "[Datapath] KNI ports ready: {:?}",
        report.ready_ports().collect::<Vec<_>>()
    );

    println!("[Datapath] Serving ring {} (Ctrl+C to quit)", ring_id);

    let wait = WaitPolicy::forever().with_timeout(Duration::from_secs(1));
    let mut served = 0u64;

    loop {
        let request = match datapath.recv_request_with(&wait) {
            Ok(r) => r,
            Err(LinkError::TimedOut) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "bad request");
                continue;
            }
        };
        served += 1;

        if request.header.family.carries_packet() {
            let info = UpcallInfo {
                reason: REASON_REFLECT,
                in_port: request.header.port,
                userdata: served,
            };
            if let Err(e) = datapath.send_upcall(&info, &request.packet) {
                tracing::warn!(error = %e, "upcall dropped");
            }
            continue;
        }

        let body = format!("served {}", served);
        if let Err(e) = datapath.send_reply(request.ring_id, &request.header, body.as_bytes()) {
            tracing::warn!(cookie = request.header.cookie, error = %e, "reply dropped");
        }
    }
}
