//! Well-known region names.
//!
//! Independently launched processes find each other's rings only through
//! these names, so every process must derive them the same way.

/// Ring id the datapath uses for its control-peer rings
pub const DATAPATH_RING_ID: u32 = 0;

/// Ring carrying upcalled packets from the datapath to the control peer
pub const PACKET_RING_NAME: &str = "packet_ring";

/// Pool of transfer buffers backing every message on the link
pub const POOL_NAME: &str = "pktbuf_pool";

/// Datapath -> peer ring (replies)
pub fn rx_ring_name(ring_id: u32) -> String {
    format!("rx_{ring_id}")
}

/// Peer -> datapath ring (requests)
pub fn tx_ring_name(ring_id: u32) -> String {
    format!("tx_{ring_id}")
}

/// Per-port kernel-interface queue, e.g. `kni_port_3_alloc`
pub fn kni_queue_name(port_id: u16, role: &str) -> String {
    format!("kni_port_{port_id}_{role}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_deterministic() {
        assert_eq!(rx_ring_name(3), "rx_3");
        assert_eq!(tx_ring_name(3), "tx_3");
        assert_ne!(rx_ring_name(3), tx_ring_name(3));
        assert_eq!(kni_queue_name(7, "sync"), "kni_port_7_sync");
    }
}
