// src/frame.rs
use bytes::Bytes;
use etherparse::{EtherType, Ethernet2HeaderSlice, IpNumber, Ipv4HeaderSlice, TcpHeaderSlice};
use log::debug;
use std::net::Ipv4Addr;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// One direction of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Identifies one in-flight request: every segment of one client write
/// carries the same acknowledgement number, but the ack alone collides
/// across concurrent connections, so the flow tuple is part of the key.
pub type JoinKey = (FlowKey, u32);

/// A captured link-layer packet reduced to the fields reassembly needs.
#[derive(Debug, Clone)]
pub struct Frame {
    pub flow: FlowKey,
    pub seq: u32,
    pub ack: u32,
    pub psh: bool,
    pub payload: Bytes,
}

impl Frame {
    #[inline]
    pub fn join_key(&self) -> JoinKey {
        (self.flow, self.ack)
    }
}

/// Decode an Ethernet II / IPv4 / TCP packet. Anything else, and anything
/// malformed, yields `None`. Header slicing runs behind `catch_unwind` so a
/// pathological packet drops instead of taking the capture loop down.
pub fn decode(data: &[u8]) -> Option<Frame> {
    match catch_unwind(AssertUnwindSafe(|| decode_inner(data))) {
        Ok(frame) => frame,
        Err(_) => {
            debug!("panic while decoding a captured packet; dropped");
            None
        }
    }
}

fn decode_inner(data: &[u8]) -> Option<Frame> {
    let eth = Ethernet2HeaderSlice::from_slice(data).ok()?;
    if eth.ether_type() != EtherType::IPV4 {
        return None;
    }

    let ip_data = &data[eth.slice().len()..];
    let ip = Ipv4HeaderSlice::from_slice(ip_data).ok()?;
    if ip.protocol() != IpNumber::TCP || ip.is_fragmenting_payload() {
        return None;
    }

    // Bound the payload by the IP total length so Ethernet trailer padding
    // never leaks into the reassembled request.
    let ip_end = (ip.total_len() as usize).min(ip_data.len());
    let tcp_data = ip_data.get(ip.slice().len()..ip_end)?;
    let tcp = TcpHeaderSlice::from_slice(tcp_data).ok()?;
    let payload = &tcp_data[tcp.slice().len()..];

    Some(Frame {
        flow: FlowKey {
            src_ip: Ipv4Addr::from(ip.source()),
            dst_ip: Ipv4Addr::from(ip.destination()),
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
        },
        seq: tcp.sequence_number(),
        ack: tcp.acknowledgment_number(),
        psh: tcp.psh(),
        payload: Bytes::copy_from_slice(payload),
    })
}
