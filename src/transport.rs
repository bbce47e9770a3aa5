//! Control-peer side of the datapath link
//!
//! A [`Transport`] attaches to the rings and buffer pool a running datapath
//! created (see [`Datapath`](crate::datapath::Datapath)) and moves control
//! messages and packets over them:
//!
//! - requests go out on the tx ring, in bursts of up to [`MAX_BURST`]
//! - replies come back on the rx ring (blocking receive)
//! - upcalled packets come in on the packet ring (non-blocking receive)

use crate::error::{LinkError, Result};
use crate::message::{self, MessageHeader, Upcall, UpcallInfo, HEADER_SIZE, UPCALL_INFO_SIZE};
use crate::names::{rx_ring_name, tx_ring_name, DATAPATH_RING_ID, PACKET_RING_NAME, POOL_NAME};
use crate::pool::{BufferPool, TransferBuf};
use crate::registry::RegionRegistry;
use crate::ring::{Ring, RingConsumer, RingProducer};
use crate::wait::WaitPolicy;

/// Largest number of messages in one bulk send
pub const MAX_BURST: usize = 256;

/// Default slot count of every link ring
const DEFAULT_RING_CAPACITY: u32 = 1024;

/// Default number of transfer buffers
const DEFAULT_POOL_BUFFERS: u32 = 4096;

/// Default transfer buffer size (one MTU-sized frame plus header)
const DEFAULT_BUFFER_SIZE: u32 = 2048;

/// Link configuration, shared by both sides
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Selects the rx/tx ring pair (`rx_<id>`, `tx_<id>`)
    pub ring_id: u32,
    /// Slot count of the rx, tx and packet rings (power of two)
    pub ring_capacity: u32,
    /// Number of transfer buffers in the pool
    pub pool_buffers: u32,
    /// Physical size of each transfer buffer in bytes
    pub buffer_size: u32,
    /// Optional occupancy limit on the tx ring
    pub tx_watermark: Option<u32>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ring_id: DATAPATH_RING_ID,
            ring_capacity: DEFAULT_RING_CAPACITY,
            pool_buffers: DEFAULT_POOL_BUFFERS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            tx_watermark: None,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.ring_capacity.is_power_of_two() {
            return Err(LinkError::Config(format!(
                "ring capacity {} is not a power of two",
                self.ring_capacity
            )));
        }
        let min_buffer = HEADER_SIZE.max(UPCALL_INFO_SIZE);
        if (self.buffer_size as usize) < min_buffer {
            return Err(LinkError::Config(format!(
                "buffer size {} is below the {min_buffer}-byte header",
                self.buffer_size
            )));
        }
        if self.pool_buffers == 0 {
            return Err(LinkError::Config("pool needs at least one buffer".into()));
        }
        if let Some(watermark) = self.tx_watermark {
            if watermark == 0 || watermark > self.ring_capacity {
                return Err(LinkError::Config(format!(
                    "tx watermark {watermark} outside 1..={}",
                    self.ring_capacity
                )));
            }
        }
        Ok(())
    }
}

/// Enqueue a burst of filled buffers as one unit.
///
/// On success every buffer now belongs to the consumer. On failure every
/// buffer is returned to the pool; a full ring reports [`LinkError::Busy`].
pub(crate) fn hand_off(producer: &mut RingProducer, bufs: Vec<TransferBuf<'_>>) -> Result<()> {
    let n = bufs.len();
    if n > MAX_BURST {
        return Err(LinkError::InvalidArgument(format!(
            "burst of {n} exceeds {MAX_BURST}"
        )));
    }

    let mut handles = [0u64; MAX_BURST];
    for (slot, buf) in handles.iter_mut().zip(&bufs) {
        *slot = buf.handle().to_raw();
    }

    match producer.enqueue_bulk(&handles[..n]) {
        Ok(()) => {
            for buf in bufs {
                let _ = buf.into_handle();
            }
            Ok(())
        }
        Err(LinkError::NoSpace { .. }) => Err(LinkError::Busy),
        Err(e) => Err(e),
    }
}

/// Attached link to the datapath
pub struct Transport {
    ring_id: u32,
    tx: RingProducer,
    rx: RingConsumer,
    packets: RingConsumer,
    pool: BufferPool,
}

impl Transport {
    /// Attach to the rings and pool of a running datapath.
    ///
    /// There is no degraded mode: any missing resource fails the whole call
    /// and the caller decides whether to retry, report or exit.
    #[tracing::instrument(skip(registry))]
    pub fn init(registry: &dyn RegionRegistry, ring_id: u32) -> Result<Self> {
        let attach_ring = |name: &str| {
            Ring::attach(registry, name).map_err(|e| {
                tracing::error!(ring = name, error = %e, "cannot attach ring, is the datapath running?");
                e
            })
        };

        let rx = attach_ring(&rx_ring_name(ring_id))?.into_consumer();
        let tx = attach_ring(&tx_ring_name(ring_id))?.into_producer();
        let packets = attach_ring(PACKET_RING_NAME)?.into_consumer();
        let pool = BufferPool::attach(registry, POOL_NAME).map_err(|e| {
            tracing::error!(pool = POOL_NAME, error = %e, "cannot attach buffer pool, is the datapath running?");
            e
        })?;

        if pool.buffer_size() < HEADER_SIZE.max(UPCALL_INFO_SIZE) {
            return Err(LinkError::Config(format!(
                "pool buffers of {} bytes cannot hold a message header",
                pool.buffer_size()
            )));
        }

        tracing::info!(ring_id, buffers = pool.buffer_count(), "transport attached");
        Ok(Self {
            ring_id,
            tx,
            rx,
            packets,
            pool,
        })
    }

    /// Send one message; `packet` is only read for packet-family messages
    pub fn send(&mut self, request: &MessageHeader, packet: &[u8]) -> Result<()> {
        self.send_bulk(std::slice::from_ref(request), &[packet])
    }

    /// Send `requests` as one all-or-nothing burst.
    ///
    /// `packets` is either empty or holds one entry per request; entries of
    /// control-only requests are ignored. Nothing reaches the ring unless
    /// every message was framed, and every buffer taken by a failed call is
    /// back in the pool when it returns.
    pub fn send_bulk(&mut self, requests: &[MessageHeader], packets: &[&[u8]]) -> Result<()> {
        let n = requests.len();
        if n > MAX_BURST {
            return Err(LinkError::InvalidArgument(format!(
                "burst of {n} exceeds {MAX_BURST}"
            )));
        }
        if !packets.is_empty() && packets.len() != n {
            return Err(LinkError::InvalidArgument(format!(
                "{} packets for {n} requests",
                packets.len()
            )));
        }
        if n == 0 {
            return Ok(());
        }

        let mut bufs = Vec::with_capacity(n);
        for (i, request) in requests.iter().enumerate() {
            let mut buf = self.pool.checkout()?;
            let packet = packets.get(i).copied().unwrap_or(&[]);

            if let Err(e) = message::frame_request(&mut buf, request, packet) {
                if let LinkError::PayloadTooLarge { max, got } = e {
                    tracing::warn!(max, got, port = request.port, "packet dropped, exceeds transfer buffer");
                }
                return Err(e);
            }
            bufs.push(buf);
        }

        hand_off(&mut self.tx, bufs).map_err(|e| {
            tracing::debug!(ring_id = self.ring_id, burst = n, error = %e, "send backpressure");
            e
        })
    }

    /// Wait for the next reply and copy its bytes (header included) into `out`
    pub fn recv_reply(&mut self, out: &mut Vec<u8>) -> Result<MessageHeader> {
        self.recv_reply_with(out, &WaitPolicy::forever())
    }

    /// [`recv_reply`](Self::recv_reply) bounded by a timeout or cancel token
    pub fn recv_reply_with(&mut self, out: &mut Vec<u8>, wait: &WaitPolicy) -> Result<MessageHeader> {
        let raw = self.rx.dequeue_with(wait)?;
        // SAFETY: the datapath passed ownership of this buffer through the rx ring
        let buf = unsafe { self.pool.claim(raw)? };

        out.clear();
        out.extend_from_slice(buf.as_slice());
        drop(buf);

        MessageHeader::decode(out)
    }

    /// Take the next upcalled packet, or [`LinkError::WouldBlock`] if none is queued
    pub fn recv_packet(&mut self) -> Result<Upcall> {
        let raw = self.packets.try_dequeue().ok_or(LinkError::WouldBlock)?;
        // SAFETY: the datapath passed ownership of this buffer through the packet ring
        let buf = unsafe { self.pool.claim(raw)? };

        let bytes = buf.as_slice();
        let info = UpcallInfo::decode(bytes)?;
        let packet = bytes[UPCALL_INFO_SIZE..].to_vec();
        Ok(Upcall { info, packet })
    }

    pub fn ring_id(&self) -> u32 {
        self.ring_id
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn tx_ring(&self) -> &Ring {
        self.tx.ring()
    }

    pub fn rx_ring(&self) -> &Ring {
        self.rx.ring()
    }

    pub fn packet_ring(&self) -> &Ring {
        self.packets.ring()
    }

    /// Largest packet a single message can carry
    pub fn max_payload(&self) -> usize {
        message::max_payload(self.pool.buffer_size(), HEADER_SIZE)
    }
}
