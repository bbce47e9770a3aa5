//! Message framing inside one transfer buffer
//!
//! ```text
//! request / reply : [MessageHeader: 16 bytes][packet bytes, packet family only]
//! upcall          : [UpcallInfo:    16 bytes][packet bytes]
//! ```
//!
//! All integers are little-endian. The link only looks at
//! [`MessageHeader::family`]; every other field is carried untouched.

use crate::error::{LinkError, Result};
use crate::pool::TransferBuf;

/// Encoded size of [`MessageHeader`]
pub const HEADER_SIZE: usize = 16;

/// Encoded size of [`UpcallInfo`]
pub const UPCALL_INFO_SIZE: usize = 16;

/// Type discriminant of a control message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Family(pub u16);

impl Family {
    pub const FLOW: Family = Family(1);
    pub const VPORT: Family = Family(2);
    /// Control message followed by raw packet bytes
    pub const PACKET: Family = Family(3);

    #[inline]
    pub fn carries_packet(self) -> bool {
        self == Family::PACKET
    }
}

/// Fixed-size header present in every request and reply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub family: Family,
    /// Family-specific command, opaque to the link
    pub command: u16,
    /// Port the message concerns, opaque to the link
    pub port: u32,
    /// Size of the reply the sender expects back
    pub reply_len: u32,
    /// Sender-chosen correlation value
    pub cookie: u32,
}

impl MessageHeader {
    /// A control-only message
    pub fn control(family: Family, command: u16) -> Self {
        Self {
            family,
            command,
            port: 0,
            reply_len: 0,
            cookie: 0,
        }
    }

    /// A message that carries a packet out of `port`
    pub fn packet(port: u32) -> Self {
        Self {
            family: Family::PACKET,
            command: 0,
            port,
            reply_len: 0,
            cookie: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.family.0.to_le_bytes());
        out[2..4].copy_from_slice(&self.command.to_le_bytes());
        out[4..8].copy_from_slice(&self.port.to_le_bytes());
        out[8..12].copy_from_slice(&self.reply_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.cookie.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let b = fixed::<HEADER_SIZE>(bytes)?;
        Ok(Self {
            family: Family(u16::from_le_bytes([b[0], b[1]])),
            command: u16::from_le_bytes([b[2], b[3]]),
            port: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            reply_len: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
            cookie: u32::from_le_bytes([b[12], b[13], b[14], b[15]]),
        })
    }
}

/// Metadata the datapath attaches to a packet it hands up
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpcallInfo {
    /// Why the packet was sent up (table miss, explicit action, ...)
    pub reason: u32,
    pub in_port: u32,
    /// Value from the action that triggered the upcall
    pub userdata: u64,
}

impl UpcallInfo {
    pub fn encode(&self) -> [u8; UPCALL_INFO_SIZE] {
        let mut out = [0u8; UPCALL_INFO_SIZE];
        out[0..4].copy_from_slice(&self.reason.to_le_bytes());
        out[4..8].copy_from_slice(&self.in_port.to_le_bytes());
        out[8..16].copy_from_slice(&self.userdata.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let b = fixed::<UPCALL_INFO_SIZE>(bytes)?;
        let mut userdata = [0u8; 8];
        userdata.copy_from_slice(&b[8..16]);
        Ok(Self {
            reason: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            in_port: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            userdata: u64::from_le_bytes(userdata),
        })
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<&[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or(LinkError::Truncated {
            need: N,
            got: bytes.len(),
        })
}

/// A request as the datapath receives it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// Link the request arrived on; replies go back on the same id
    pub ring_id: u32,
    pub header: MessageHeader,
    /// Empty unless the header's family carries a packet
    pub packet: Vec<u8>,
}

/// A packet handed up by the datapath
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upcall {
    pub info: UpcallInfo,
    pub packet: Vec<u8>,
}

/// Largest packet that fits next to a fixed header in one buffer
#[inline]
pub fn max_payload(buffer_size: usize, header_size: usize) -> usize {
    buffer_size.saturating_sub(header_size)
}

/// Write `header` (and `packet`, when the family carries one) into `buf`
/// and record the used length.
pub(crate) fn frame_request(
    buf: &mut TransferBuf<'_>,
    header: &MessageHeader,
    packet: &[u8],
) -> Result<()> {
    let payload = if header.family.carries_packet() {
        packet
    } else {
        &[]
    };
    let used = write_with_payload(buf, &header.encode(), payload)?;
    buf.set_len(used)
}

/// Write a reply header followed by an opaque body
pub(crate) fn frame_reply(
    buf: &mut TransferBuf<'_>,
    header: &MessageHeader,
    body: &[u8],
) -> Result<()> {
    let used = write_with_payload(buf, &header.encode(), body)?;
    buf.set_len(used)
}

/// Write an upcall (info + packet) into `buf` and record the used length.
pub(crate) fn frame_upcall(
    buf: &mut TransferBuf<'_>,
    info: &UpcallInfo,
    packet: &[u8],
) -> Result<()> {
    let used = write_with_payload(buf, &info.encode(), packet)?;
    buf.set_len(used)
}

fn write_with_payload(buf: &mut TransferBuf<'_>, head: &[u8], payload: &[u8]) -> Result<usize> {
    let capacity = buf.capacity();
    let max = max_payload(capacity, head.len());
    if head.len() > capacity || payload.len() > max {
        return Err(LinkError::PayloadTooLarge {
            max,
            got: payload.len(),
        });
    }

    let data = buf.as_mut_slice();
    data[..head.len()].copy_from_slice(head);
    data[head.len()..head.len() + payload.len()].copy_from_slice(payload);
    Ok(head.len() + payload.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::registry::LocalRegistry;

    #[test]
    fn test_header_layout() {
        let header = MessageHeader {
            family: Family::FLOW,
            command: 0x0203,
            port: 7,
            reply_len: 64,
            cookie: 0xDEAD_BEEF,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[0..2], &[1, 0]);
        assert_eq!(&bytes[2..4], &[3, 2]);
        assert_eq!(&bytes[12..16], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(MessageHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            MessageHeader::decode(&[0u8; 10]),
            Err(LinkError::Truncated { need: 16, got: 10 })
        ));
        assert!(UpcallInfo::decode(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_control_message_ignores_packet() {
        let registry = LocalRegistry::new();
        let pool = BufferPool::create(&registry, "pool", 1, 64).unwrap();
        let mut buf = pool.checkout().unwrap();

        let header = MessageHeader::control(Family::VPORT, 1);
        frame_request(&mut buf, &header, b"ignored").unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(buf.as_slice(), &header.encode());
    }

    #[test]
    fn test_packet_message_appends_payload() {
        let registry = LocalRegistry::new();
        let pool = BufferPool::create(&registry, "pool", 1, 64).unwrap();
        let mut buf = pool.checkout().unwrap();

        frame_request(&mut buf, &MessageHeader::packet(2), &[0xAB; 48]).unwrap();
        assert_eq!(buf.len(), 64);
        assert!(buf.as_slice()[HEADER_SIZE..].iter().all(|&b| b == 0xAB));

        let err = frame_request(&mut buf, &MessageHeader::packet(2), &[0; 49]).unwrap_err();
        assert!(matches!(err, LinkError::PayloadTooLarge { max: 48, got: 49 }));
    }

    #[test]
    fn test_upcall_frame() {
        let registry = LocalRegistry::new();
        let pool = BufferPool::create(&registry, "pool", 1, 128).unwrap();
        let mut buf = pool.checkout().unwrap();
        let info = UpcallInfo {
            reason: 1,
            in_port: 4,
            userdata: 99,
        };
        frame_upcall(&mut buf, &info, b"frame").unwrap();
        assert_eq!(UpcallInfo::decode(buf.as_slice()).unwrap(), info);
        assert_eq!(&buf.as_slice()[UPCALL_INFO_SIZE..], b"frame");
    }
}
