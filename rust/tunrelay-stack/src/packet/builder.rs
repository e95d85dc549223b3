//! Building fresh IPv4 packets.

use super::checksum::{ipv4_header_checksum, transport_checksum};
use super::tcp::{mss_option, TcpFlags};
use super::{Packet, PROTO_TCP, PROTO_UDP};
use bytes::BytesMut;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};

static IP_ID: AtomicU16 = AtomicU16::new(1);

/// Next IPv4 identification value for packets this process originates.
pub fn next_ip_id() -> u16 {
    IP_ID.fetch_add(1, Ordering::Relaxed)
}

fn write_ipv4_header(pkt: &mut [u8], protocol: u8, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) {
    let total_len = pkt.len();
    pkt[0] = 0x45;
    pkt[1] = 0x00;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[4..6].copy_from_slice(&next_ip_id().to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = protocol;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());
    let ip_cksum = ipv4_header_checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
}

/// Build IPv4 TCP packet
#[allow(clippy::too_many_arguments)]
pub fn build_ipv4_tcp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    mss: Option<u16>,
) -> BytesMut {
    let tcp_opts_len = if flags.syn && mss.is_some() { 4 } else { 0 };
    let tcp_hdr_len = 20 + tcp_opts_len;
    let total_len = 20 + tcp_hdr_len + payload.len();

    let mut pkt = BytesMut::zeroed(total_len);
    write_ipv4_header(&mut pkt, PROTO_TCP, src_ip, dst_ip);

    let t = 20;
    pkt[t..t + 2].copy_from_slice(&src_port.to_be_bytes());
    pkt[t + 2..t + 4].copy_from_slice(&dst_port.to_be_bytes());
    pkt[t + 4..t + 8].copy_from_slice(&seq.to_be_bytes());
    pkt[t + 8..t + 12].copy_from_slice(&ack.to_be_bytes());
    pkt[t + 12] = ((tcp_hdr_len / 4) as u8) << 4;
    pkt[t + 13] = flags.to_byte();
    pkt[t + 14..t + 16].copy_from_slice(&window.to_be_bytes());

    if let (true, Some(mss_val)) = (flags.syn, mss) {
        pkt[t + 20..t + 24].copy_from_slice(&mss_option(mss_val));
    }

    let payload_start = t + tcp_hdr_len;
    pkt[payload_start..].copy_from_slice(payload);

    let tcp_cksum = transport_checksum(src_ip, dst_ip, PROTO_TCP, &pkt[t..], 16);
    pkt[t + 16..t + 18].copy_from_slice(&tcp_cksum.to_be_bytes());

    pkt
}

/// Build IPv4 UDP packet
pub fn build_ipv4_udp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> BytesMut {
    let total_len = 20 + 8 + payload.len();
    let mut pkt = BytesMut::zeroed(total_len);
    write_ipv4_header(&mut pkt, PROTO_UDP, src_ip, dst_ip);

    let udp_len = (8 + payload.len()) as u16;
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[24..26].copy_from_slice(&udp_len.to_be_bytes());
    pkt[28..].copy_from_slice(payload);

    let mut udp_cksum = transport_checksum(src_ip, dst_ip, PROTO_UDP, &pkt[20..], 6);
    if udp_cksum == 0 {
        udp_cksum = 0xFFFF;
    }
    pkt[26..28].copy_from_slice(&udp_cksum.to_be_bytes());

    pkt
}

/// Packet builder utility struct
pub struct PacketBuilder;

impl PacketBuilder {
    /// Header-only TCP packet from `src` to `dst`, ready to be stamped through
    /// the editors. `capacity` is reserved for later payloads.
    pub fn tcp_template(src: SocketAddrV4, dst: SocketAddrV4, window: u16, capacity: usize) -> Packet {
        let header = build_ipv4_tcp(
            *src.ip(),
            *dst.ip(),
            src.port(),
            dst.port(),
            0,
            0,
            TcpFlags::ack_only(),
            window,
            &[],
            None,
        );
        with_capacity(header, capacity)
    }

    /// Header-only UDP packet from `src` to `dst`.
    pub fn udp_template(src: SocketAddrV4, dst: SocketAddrV4, capacity: usize) -> Packet {
        let header = build_ipv4_udp(*src.ip(), *dst.ip(), src.port(), dst.port(), &[]);
        with_capacity(header, capacity)
    }
}

fn with_capacity(header: BytesMut, capacity: usize) -> Packet {
    let mut buf = BytesMut::with_capacity(capacity.max(header.len()));
    buf.extend_from_slice(&header);
    Packet::ipv4(buf)
}
