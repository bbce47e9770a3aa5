//! C Bindings for the control-peer transport
//!
//! Every call returns `0` on success or a positive errno value
//! (`ENOBUFS` on backpressure, `EAGAIN` when nothing is queued, ...).

use crate::error::{LinkError, Result};
use crate::message::{Family, MessageHeader, Upcall, UpcallInfo};
use crate::registry::PosixRegistry;
use crate::transport::{Transport, MAX_BURST};
use crate::wait::WaitPolicy;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;
use std::time::Duration;

// Opaque handle
pub struct RinglinkTransport {
    transport: Transport,
    scratch: Vec<u8>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RinglinkHeader {
    pub family: u16,
    pub command: u16,
    pub port: u32,
    pub reply_len: u32,
    pub cookie: u32,
}

impl From<RinglinkHeader> for MessageHeader {
    fn from(h: RinglinkHeader) -> Self {
        MessageHeader {
            family: Family(h.family),
            command: h.command,
            port: h.port,
            reply_len: h.reply_len,
            cookie: h.cookie,
        }
    }
}

impl From<MessageHeader> for RinglinkHeader {
    fn from(h: MessageHeader) -> Self {
        RinglinkHeader {
            family: h.family.0,
            command: h.command,
            port: h.port,
            reply_len: h.reply_len,
            cookie: h.cookie,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RinglinkUpcall {
    pub reason: u32,
    pub in_port: u32,
    pub userdata: u64,
}

impl From<UpcallInfo> for RinglinkUpcall {
    fn from(info: UpcallInfo) -> Self {
        RinglinkUpcall {
            reason: info.reason,
            in_port: info.in_port,
            userdata: info.userdata,
        }
    }
}

fn status(result: Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}

fn invalid(what: &str) -> c_int {
    LinkError::InvalidArgument(what.to_string()).errno()
}

/// Copy as much of `src` as fits into the caller buffer and report the full length
unsafe fn copy_out(src: &[u8], buf: *mut u8, buf_len: usize, out_len: *mut usize) {
    if !buf.is_null() {
        let n = src.len().min(buf_len);
        ptr::copy_nonoverlapping(src.as_ptr(), buf, n);
    }
    if !out_len.is_null() {
        *out_len = src.len();
    }
}

/// Attach to the datapath serving `ring_id`
///
/// # Safety
/// `prefix` must be null (default region prefix) or a valid null-terminated
/// string; `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn ringlink_transport_init(
    prefix: *const c_char,
    ring_id: u32,
    out: *mut *mut RinglinkTransport,
) -> c_int {
    if out.is_null() {
        return invalid("null output handle");
    }
    *out = ptr::null_mut();

    let registry = if prefix.is_null() {
        PosixRegistry::new()
    } else {
        match CStr::from_ptr(prefix).to_str() {
            Ok(s) => PosixRegistry::with_prefix(s),
            Err(_) => return invalid("prefix is not utf-8"),
        }
    };

    match Transport::init(&registry, ring_id) {
        Ok(transport) => {
            *out = Box::into_raw(Box::new(RinglinkTransport {
                transport,
                scratch: Vec::new(),
            }));
            0
        }
        Err(e) => e.errno(),
    }
}

/// Detach and free a transport handle
///
/// # Safety
/// `handle` must be null or a pointer returned by `ringlink_transport_init`
/// that has not been destroyed yet. It must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn ringlink_transport_destroy(handle: *mut RinglinkTransport) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Send one message; `packet` may be null when `packet_len` is 0
///
/// # Safety
/// `handle` must come from `ringlink_transport_init` and not be in use on
/// another thread; `header` must point to a valid header; a non-null
/// `packet` must be readable for `packet_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn ringlink_send(
    handle: *mut RinglinkTransport,
    header: *const RinglinkHeader,
    packet: *const u8,
    packet_len: usize,
) -> c_int {
    if handle.is_null() || header.is_null() {
        return invalid("null handle or header");
    }
    if packet.is_null() && packet_len != 0 {
        return invalid("null packet");
    }
    let link = &mut (*handle).transport;
    let packet = if packet_len == 0 {
        &[][..]
    } else {
        slice::from_raw_parts(packet, packet_len)
    };
    status(link.send(&MessageHeader::from(*header), packet))
}

/// Send `n` messages as one all-or-nothing burst
///
/// `packets` and `packet_lens` are either both null or arrays of `n` entries.
///
/// # Safety
/// `handle` must come from `ringlink_transport_init` and not be in use on
/// another thread; `headers` must point to `n` valid headers; when set,
/// `packets` and `packet_lens` must point to `n` entries each, and every
/// non-null packet must be readable for its length.
#[no_mangle]
pub unsafe extern "C" fn ringlink_send_bulk(
    handle: *mut RinglinkTransport,
    headers: *const RinglinkHeader,
    packets: *const *const u8,
    packet_lens: *const usize,
    n: usize,
) -> c_int {
    if handle.is_null() || (headers.is_null() && n != 0) {
        return invalid("null handle or headers");
    }
    if n > MAX_BURST {
        return invalid("burst too large");
    }
    if n == 0 {
        return 0;
    }
    if packets.is_null() != packet_lens.is_null() {
        return invalid("packets and lengths must both be set");
    }

    let mut requests = [MessageHeader::control(Family(0), 0); MAX_BURST];
    for (dst, src) in requests.iter_mut().zip(slice::from_raw_parts(headers, n)) {
        *dst = MessageHeader::from(*src);
    }

    let mut storage: [&[u8]; MAX_BURST] = [&[]; MAX_BURST];
    let payloads = if packets.is_null() {
        &storage[..0]
    } else {
        let ptrs = slice::from_raw_parts(packets, n);
        let lens = slice::from_raw_parts(packet_lens, n);
        for (i, (&p, &len)) in ptrs.iter().zip(lens).enumerate() {
            if len == 0 {
                continue;
            }
            if p.is_null() {
                return invalid("null packet");
            }
            storage[i] = slice::from_raw_parts(p, len);
        }
        &storage[..n]
    };

    status((*handle).transport.send_bulk(&requests[..n], payloads))
}

unsafe fn reply_into(
    handle: *mut RinglinkTransport,
    wait: &WaitPolicy,
    header: *mut RinglinkHeader,
    buf: *mut u8,
    buf_len: usize,
    out_len: *mut usize,
) -> c_int {
    if handle.is_null() {
        return invalid("null handle");
    }
    let RinglinkTransport { transport, scratch } = &mut *handle;
    match transport.recv_reply_with(scratch, wait) {
        Ok(reply) => {
            if !header.is_null() {
                *header = reply.into();
            }
            copy_out(scratch, buf, buf_len, out_len);
            0
        }
        Err(e) => e.errno(),
    }
}

/// Wait for the next reply
///
/// The whole reply (header included) is copied into `buf`, truncated to
/// `buf_len`; `out_len` receives the untruncated length.
///
/// # Safety
/// `handle` must come from `ringlink_transport_init` and not be in use on
/// another thread. `header`, `buf` and `out_len` may each be null; when
/// set, `header` and `out_len` must be writable and `buf` writable for
/// `buf_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn ringlink_recv_reply(
    handle: *mut RinglinkTransport,
    header: *mut RinglinkHeader,
    buf: *mut u8,
    buf_len: usize,
    out_len: *mut usize,
) -> c_int {
    reply_into(handle, &WaitPolicy::forever(), header, buf, buf_len, out_len)
}

/// Like `ringlink_recv_reply`, giving up with `ETIMEDOUT` after `timeout_ms`
///
/// # Safety
/// Same pointer requirements as `ringlink_recv_reply`.
#[no_mangle]
pub unsafe extern "C" fn ringlink_recv_reply_timeout(
    handle: *mut RinglinkTransport,
    timeout_ms: u64,
    header: *mut RinglinkHeader,
    buf: *mut u8,
    buf_len: usize,
    out_len: *mut usize,
) -> c_int {
    let wait = WaitPolicy::forever().with_timeout(Duration::from_millis(timeout_ms));
    reply_into(handle, &wait, header, buf, buf_len, out_len)
}

/// Take the next upcalled packet without blocking (`EAGAIN` when none)
///
/// # Safety
/// `handle` must come from `ringlink_transport_init` and not be in use on
/// another thread. `info`, `buf` and `out_len` may each be null; when set,
/// `info` and `out_len` must be writable and `buf` writable for `buf_len`
/// bytes.
#[no_mangle]
pub unsafe extern "C" fn ringlink_recv_packet(
    handle: *mut RinglinkTransport,
    info: *mut RinglinkUpcall,
    buf: *mut u8,
    buf_len: usize,
    out_len: *mut usize,
) -> c_int {
    if handle.is_null() {
        return invalid("null handle");
    }
    match (*handle).transport.recv_packet() {
        Ok(Upcall { info: meta, packet }) => {
            if !info.is_null() {
                *info = meta.into();
            }
            copy_out(&packet, buf, buf_len, out_len);
            0
        }
        Err(e) => e.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::Datapath;
    use crate::transport::LinkConfig;
    use rustix::io::Errno;
    use std::ffi::CString;

    fn prefix(tag: &str) -> CString {
        CString::new(format!("/ringlink_ffi_{}_{tag}_", std::process::id())).unwrap()
    }

    #[test]
    fn test_init_without_datapath() {
        let prefix = prefix("absent");
        let mut handle = ptr::null_mut();
        let rc = unsafe { ringlink_transport_init(prefix.as_ptr(), 0, &mut handle) };
        assert_eq!(rc, Errno::NOENT.raw_os_error());
        assert!(handle.is_null());
    }

    #[test]
    fn test_null_arguments() {
        unsafe {
            assert_eq!(
                ringlink_transport_init(ptr::null(), 0, ptr::null_mut()),
                Errno::INVAL.raw_os_error()
            );
            assert_eq!(
                ringlink_send(ptr::null_mut(), ptr::null(), ptr::null(), 0),
                Errno::INVAL.raw_os_error()
            );
            ringlink_transport_destroy(ptr::null_mut());
        }
    }

    #[test]
    fn test_c_round_trip() {
        let prefix = prefix("link");
        let registry = PosixRegistry::with_prefix(prefix.to_str().unwrap());
        let config = LinkConfig {
            ring_capacity: 64,
            pool_buffers: 64,
            buffer_size: 256,
            ..LinkConfig::default()
        };
        let mut datapath = Datapath::create(&registry, &config).unwrap();

        let mut handle = ptr::null_mut();
        assert_eq!(
            unsafe { ringlink_transport_init(prefix.as_ptr(), 0, &mut handle) },
            0
        );

        let header = RinglinkHeader {
            family: Family::PACKET.0,
            command: 0,
            port: 9,
            reply_len: 0,
            cookie: 1,
        };
        let packet = [0xC3u8; 100];
        assert_eq!(
            unsafe { ringlink_send(handle, &header, packet.as_ptr(), packet.len()) },
            0
        );
        let request = datapath.recv_request().unwrap();
        assert_eq!(request.header.port, 9);
        assert_eq!(request.packet, packet);

        let reply = MessageHeader::control(Family::FLOW, 3);
        datapath.send_reply(0, &reply, b"ok").unwrap();
        let mut out_header = RinglinkHeader::from(MessageHeader::control(Family(0), 0));
        let mut buf = [0u8; 8];
        let mut len = 0usize;
        let rc = unsafe {
            ringlink_recv_reply_timeout(handle, 1000, &mut out_header, buf.as_mut_ptr(), buf.len(), &mut len)
        };
        assert_eq!(rc, 0);
        assert_eq!(out_header.command, 3);
        assert_eq!(len, 18);

        let rc = unsafe {
            ringlink_recv_packet(handle, ptr::null_mut(), buf.as_mut_ptr(), buf.len(), &mut len)
        };
        assert_eq!(rc, Errno::AGAIN.raw_os_error());

        let rc = unsafe { ringlink_recv_reply_timeout(handle, 5, ptr::null_mut(), ptr::null_mut(), 0, ptr::null_mut()) };
        assert_eq!(rc, Errno::TIMEDOUT.raw_os_error());

        let oversized = [0u8; 300];
        let rc = unsafe { ringlink_send(handle, &header, oversized.as_ptr(), oversized.len()) };
        assert_eq!(rc, Errno::NOMEM.raw_os_error());

        unsafe { ringlink_transport_destroy(handle) };
    }
}
