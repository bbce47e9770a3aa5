//! Datapath side of the link
//!
//! The datapath owns every link resource. The buffer pool and the packet
//! ring are created once and shared; each control link adds its own
//! tx/rx ring pair under a ring id. Requests arrive on tx, replies go back
//! on the rx ring of the same id, and upcalled packets go out on the packet
//! ring. Dropping the [`Datapath`] tears everything down.

use crate::error::{LinkError, Result};
use crate::message::{self, MessageHeader, Request, UpcallInfo, HEADER_SIZE};
use crate::names::{rx_ring_name, tx_ring_name, PACKET_RING_NAME, POOL_NAME};
use crate::pool::BufferPool;
use crate::registry::RegionRegistry;
use crate::ring::{Ring, RingConsumer, RingProducer, SLOT_SIZE};
use crate::transport::{hand_off, LinkConfig};
use crate::wait::WaitPolicy;

/// One control peer's tx/rx ring pair
struct Link {
    ring_id: u32,
    requests: RingConsumer,
    replies: RingProducer,
}

impl Link {
    fn create(
        registry: &dyn RegionRegistry,
        ring_id: u32,
        capacity: u32,
        watermark: Option<u32>,
    ) -> Result<Self> {
        let replies = Ring::create(registry, &rx_ring_name(ring_id), capacity, SLOT_SIZE)?;
        let requests = Ring::create(registry, &tx_ring_name(ring_id), capacity, SLOT_SIZE)?;
        if let Some(watermark) = watermark {
            requests.set_watermark(watermark)?;
        }
        Ok(Self {
            ring_id,
            requests: requests.into_consumer(),
            replies: replies.into_producer(),
        })
    }
}

/// Round-robin over the request rings, starting after the last hit
fn poll_links(links: &mut [Link], next: &mut usize) -> Option<(u32, u64)> {
    let n = links.len();
    for i in 0..n {
        let idx = (*next + i) % n;
        if let Some(raw) = links[idx].requests.try_dequeue() {
            *next = (idx + 1) % n;
            return Some((links[idx].ring_id, raw));
        }
    }
    None
}

pub struct Datapath {
    links: Vec<Link>,
    next: usize,
    upcalls: RingProducer,
    pool: BufferPool,
    ring_capacity: u32,
    tx_watermark: Option<u32>,
}

impl Datapath {
    /// Create the shared pool and packet ring plus the link for `config.ring_id`
    #[tracing::instrument(skip(registry))]
    pub fn create(registry: &dyn RegionRegistry, config: &LinkConfig) -> Result<Self> {
        config.validate()?;

        let pool = BufferPool::create(registry, POOL_NAME, config.pool_buffers, config.buffer_size)?;
        let upcalls = Ring::create(registry, PACKET_RING_NAME, config.ring_capacity, SLOT_SIZE)?;
        let link = Link::create(
            registry,
            config.ring_id,
            config.ring_capacity,
            config.tx_watermark,
        )?;

        tracing::info!(ring_id = config.ring_id, "datapath link ready");
        Ok(Self {
            links: vec![link],
            next: 0,
            upcalls: upcalls.into_producer(),
            pool,
            ring_capacity: config.ring_capacity,
            tx_watermark: config.tx_watermark,
        })
    }

    /// Serve another control link over the same pool and packet ring
    #[tracing::instrument(skip(self, registry))]
    pub fn add_link(&mut self, registry: &dyn RegionRegistry, ring_id: u32) -> Result<()> {
        if self.link(ring_id).is_some() {
            return Err(LinkError::InvalidArgument(format!(
                "ring id {ring_id} is already served"
            )));
        }
        let link = Link::create(registry, ring_id, self.ring_capacity, self.tx_watermark)?;
        self.links.push(link);
        tracing::info!(ring_id, links = self.links.len(), "datapath link ready");
        Ok(())
    }

    fn link(&self, ring_id: u32) -> Option<&Link> {
        self.links.iter().find(|l| l.ring_id == ring_id)
    }

    /// Ids of every served link, in creation order
    pub fn ring_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.links.iter().map(|l| l.ring_id)
    }

    /// Take the next request from any link, or [`LinkError::WouldBlock`] if none is queued
    pub fn recv_request(&mut self) -> Result<Request> {
        let (ring_id, raw) =
            poll_links(&mut self.links, &mut self.next).ok_or(LinkError::WouldBlock)?;
        self.decode_request(ring_id, raw)
    }

    /// Wait for a request on any link under `wait`
    pub fn recv_request_with(&mut self, wait: &WaitPolicy) -> Result<Request> {
        let (links, next) = (&mut self.links, &mut self.next);
        let (ring_id, raw) = wait.spin_until(|| poll_links(links, next))?;
        self.decode_request(ring_id, raw)
    }

    fn decode_request(&self, ring_id: u32, raw: u64) -> Result<Request> {
        // SAFETY: the control peer passed ownership of this buffer through its tx ring
        let buf = unsafe { self.pool.claim(raw)? };
        let bytes = buf.as_slice();

        let header = MessageHeader::decode(bytes)?;
        let packet = if header.family.carries_packet() {
            bytes[HEADER_SIZE..].to_vec()
        } else {
            Vec::new()
        };
        Ok(Request {
            ring_id,
            header,
            packet,
        })
    }

    /// Answer the control peer on link `ring_id` with `header` followed by `body`
    pub fn send_reply(&mut self, ring_id: u32, header: &MessageHeader, body: &[u8]) -> Result<()> {
        let Some(idx) = self.links.iter().position(|l| l.ring_id == ring_id) else {
            return Err(LinkError::InvalidArgument(format!(
                "no link with ring id {ring_id}"
            )));
        };
        let mut buf = self.pool.checkout()?;
        message::frame_reply(&mut buf, header, body)?;
        hand_off(&mut self.links[idx].replies, vec![buf])
    }

    /// Hand a packet up to the control peer
    pub fn send_upcall(&mut self, info: &UpcallInfo, packet: &[u8]) -> Result<()> {
        let mut buf = self.pool.checkout()?;
        message::frame_upcall(&mut buf, info, packet)?;
        hand_off(&mut self.upcalls, vec![buf]).map_err(|e| {
            tracing::debug!(in_port = info.in_port, error = %e, "upcall dropped");
            e
        })
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn request_ring(&self, ring_id: u32) -> Option<&Ring> {
        self.link(ring_id).map(|l| l.requests.ring())
    }

    pub fn reply_ring(&self, ring_id: u32) -> Option<&Ring> {
        self.link(ring_id).map(|l| l.replies.ring())
    }

    pub fn upcall_ring(&self) -> &Ring {
        self.upcalls.ring()
    }
}
