//! Buffer-backed packet model.
//!
//! A [`Packet`] owns exactly one `BytesMut` at a time and exposes the
//! protocol layers found in it as an ordered list of [`Layer`] spans
//! (IPv4 first, then TCP/UDP/ICMP, then anything unparsed as `Raw`).
//! The list is parsed lazily and dropped whenever the buffer changes.
//!
//! Mutation goes through editors obtained from the packet:
//!
//! * header editors ([`Ipv4Editor`], [`TcpEditor`], [`UdpEditor`]) queue
//!   field edits and apply them in one pass on `commit()`, including
//!   variable-length option tails;
//! * [`PayloadEditor`] resizes or rewrites the innermost payload.
//!
//! Both report a size delta back to the packet, which rewrites the length
//! fields of the edited layer and its ancestors and then recomputes
//! checksums top-down (IPv4 before TCP/UDP, since the transport pseudo
//! header depends on the finalized IP header).

pub mod builder;
pub mod checksum;
pub mod editor;
pub mod ipv4;
pub mod tcp;
pub mod udp;

use crate::error::{Result, StackError};
use bytes::BytesMut;
use std::cell::OnceCell;
use std::fmt;

pub use builder::{build_ipv4_tcp, build_ipv4_udp, next_ip_id, PacketBuilder};
pub use editor::{Changeset, HeaderEditor, PayloadEditor, PayloadMode};
pub use ipv4::{Ipv4Editor, Ipv4View, IPV4_HEADER_LEN};
pub use tcp::{mss_option, TcpEditor, TcpFlags, TcpView, TCP_HEADER_LEN};
pub use udp::{UdpEditor, UdpView, UDP_HEADER_LEN};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const ICMP_HEADER_LEN: usize = 8;

/// Kind of a protocol layer inside a packet buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Ipv4,
    Tcp,
    Udp,
    Icmp,
    Raw,
}

impl LayerKind {
    /// Size of the header without options.
    pub fn fixed_header_len(self) -> usize {
        match self {
            LayerKind::Ipv4 => IPV4_HEADER_LEN,
            LayerKind::Tcp => TCP_HEADER_LEN,
            LayerKind::Udp => UDP_HEADER_LEN,
            LayerKind::Icmp => ICMP_HEADER_LEN,
            LayerKind::Raw => 0,
        }
    }

    /// Largest header including the options tail.
    pub fn max_header_len(self) -> usize {
        match self {
            LayerKind::Ipv4 | LayerKind::Tcp => 60,
            other => other.fixed_header_len(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LayerKind::Ipv4 => "ipv4",
            LayerKind::Tcp => "tcp",
            LayerKind::Udp => "udp",
            LayerKind::Icmp => "icmp",
            LayerKind::Raw => "raw",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One protocol layer, addressed by byte offset into the packet buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer {
    pub kind: LayerKind,
    pub offset: usize,
    pub header_len: usize,
    /// Header plus payload.
    pub len: usize,
}

impl Layer {
    pub fn payload_offset(&self) -> usize {
        self.offset + self.header_len
    }

    pub fn payload_len(&self) -> usize {
        self.len - self.header_len
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// A packet owning one buffer and a lazily parsed layer chain.
pub struct Packet {
    top: LayerKind,
    buffer: Option<BytesMut>,
    chain: OnceCell<Vec<Layer>>,
}

impl Packet {
    /// Detached packet whose outermost layer will be `top`.
    pub fn new(top: LayerKind) -> Self {
        Self {
            top,
            buffer: None,
            chain: OnceCell::new(),
        }
    }

    /// Packet attached to `buffer`.
    pub fn with_buffer(top: LayerKind, buffer: BytesMut) -> Self {
        Self {
            top,
            buffer: Some(buffer),
            chain: OnceCell::new(),
        }
    }

    pub fn ipv4(buffer: BytesMut) -> Self {
        Self::with_buffer(LayerKind::Ipv4, buffer)
    }

    /// Attach a buffer. Fails if one is already attached.
    pub fn attach(&mut self, buffer: BytesMut) -> Result<()> {
        if self.buffer.is_some() {
            return Err(StackError::AlreadyAttached);
        }
        self.buffer = Some(buffer);
        self.invalidate();
        Ok(())
    }

    /// Take the buffer back. Fails if none is attached.
    pub fn detach(&mut self) -> Result<BytesMut> {
        let buffer = self.buffer.take().ok_or(StackError::NotAttached)?;
        self.invalidate();
        Ok(buffer)
    }

    /// Consume the packet, returning its buffer.
    pub fn into_buffer(mut self) -> Result<BytesMut> {
        self.detach()
    }

    pub fn is_attached(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn top(&self) -> LayerKind {
        self.top
    }

    /// Read-only view of the whole buffer (empty when detached).
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    /// Parsed layers, outermost first.
    pub fn layers(&self) -> &[Layer] {
        self.chain.get_or_init(|| parse_chain(self.top, self.buffer()))
    }

    pub fn layer(&self, kind: LayerKind) -> Option<Layer> {
        self.layers().iter().copied().find(|l| l.kind == kind)
    }

    pub(crate) fn layer_index(&self, kind: LayerKind) -> Result<usize> {
        self.layers()
            .iter()
            .position(|l| l.kind == kind)
            .ok_or(StackError::MissingLayer(kind.name()))
    }

    pub(crate) fn layer_slice(&self, layer: &Layer) -> &[u8] {
        &self.buffer()[layer.offset..layer.end()]
    }

    pub fn ipv4_view(&self) -> Option<Ipv4View<'_>> {
        self.layer(LayerKind::Ipv4).map(|l| Ipv4View::new(self.layer_slice(&l)))
    }

    pub fn tcp_view(&self) -> Option<TcpView<'_>> {
        self.layer(LayerKind::Tcp).map(|l| TcpView::new(self.layer_slice(&l)))
    }

    pub fn udp_view(&self) -> Option<UdpView<'_>> {
        self.layer(LayerKind::Udp).map(|l| UdpView::new(self.layer_slice(&l)))
    }

    pub fn ipv4_editor(&mut self) -> Result<Ipv4Editor<'_>> {
        let index = self.layer_index(LayerKind::Ipv4)?;
        Ok(Ipv4Editor::new(HeaderEditor::new(self, index)?))
    }

    pub fn tcp_editor(&mut self) -> Result<TcpEditor<'_>> {
        let index = self.layer_index(LayerKind::Tcp)?;
        Ok(TcpEditor::new(HeaderEditor::new(self, index)?))
    }

    pub fn udp_editor(&mut self) -> Result<UdpEditor<'_>> {
        let index = self.layer_index(LayerKind::Udp)?;
        Ok(UdpEditor::new(HeaderEditor::new(self, index)?))
    }

    /// Editor over the payload of the innermost parsed layer.
    pub fn payload_editor(&mut self, mode: PayloadMode) -> Result<PayloadEditor<'_>> {
        PayloadEditor::new(self, mode)
    }

    /// Deep copy into a fresh buffer with at least `capacity` bytes reserved.
    pub fn duplicate_with_capacity(&self, capacity: usize) -> Packet {
        let data = self.buffer();
        let mut buffer = BytesMut::with_capacity(capacity.max(data.len()));
        buffer.extend_from_slice(data);
        Packet::with_buffer(self.top, buffer)
    }

    pub fn duplicate(&self) -> Packet {
        self.duplicate_with_capacity(self.len())
    }

    pub(crate) fn buffer_mut(&mut self) -> Result<&mut BytesMut> {
        self.buffer.as_mut().ok_or(StackError::NotAttached)
    }

    pub(crate) fn invalidate(&mut self) {
        self.chain = OnceCell::new();
    }

    /// Finalize lengths and checksums after layer `index` changed size by `delta`.
    ///
    /// `pseudo_touched` is set when an IPv4 edit changed fields covered by the
    /// transport pseudo header; only then is the child checksum redone.
    pub(crate) fn on_layer_committed(
        &mut self,
        index: usize,
        delta: isize,
        pseudo_touched: bool,
    ) -> Result<()> {
        let before = self.layers().to_vec();
        if index >= before.len() {
            return Err(StackError::MissingLayer("committed layer"));
        }

        if delta != 0 {
            let buf = self.buffer_mut()?;
            for layer in &before[..=index] {
                let new_len = layer.len as isize + delta;
                if !(0..=u16::MAX as isize).contains(&new_len) {
                    return Err(StackError::InvalidPacket(format!(
                        "{} length out of range: {}",
                        layer.kind, new_len
                    )));
                }
                write_length_field(buf, layer, new_len as usize);
            }
        }
        self.invalidate();

        let after = self.layers().to_vec();
        let last = index.min(after.len().saturating_sub(1));
        for i in 0..=last {
            if i == index || delta != 0 {
                self.refresh_checksum(&after, i)?;
            }
        }
        if pseudo_touched && after.get(index).map(|l| l.kind) == Some(LayerKind::Ipv4) {
            if let Some(child) = after.get(index + 1) {
                if matches!(child.kind, LayerKind::Tcp | LayerKind::Udp) {
                    self.refresh_checksum(&after, index + 1)?;
                }
            }
        }
        Ok(())
    }

    fn refresh_checksum(&mut self, layers: &[Layer], i: usize) -> Result<()> {
        let layer = layers[i];
        let parent = i.checked_sub(1).map(|p| layers[p]);
        let buf = self.buffer_mut()?;
        match layer.kind {
            LayerKind::Ipv4 => {
                let header = &buf[layer.offset..layer.offset + layer.header_len];
                let sum = checksum::ipv4_header_checksum(header);
                buf[layer.offset + 10..layer.offset + 12].copy_from_slice(&sum.to_be_bytes());
            }
            LayerKind::Tcp | LayerKind::Udp => {
                let Some(ip) = parent.filter(|p| p.kind == LayerKind::Ipv4) else {
                    return Ok(());
                };
                let view = Ipv4View::new(&buf[ip.offset..ip.end()]);
                let (src, dst) = (view.src(), view.dst());
                let (protocol, field) = if layer.kind == LayerKind::Tcp {
                    (PROTO_TCP, 16)
                } else {
                    (PROTO_UDP, 6)
                };
                let at = layer.offset + field;
                if layer.kind == LayerKind::Udp && buf[at] == 0 && buf[at + 1] == 0 {
                    // zero means the sender disabled the UDP checksum
                    return Ok(());
                }
                let segment = &buf[layer.offset..layer.end()];
                let mut sum = checksum::transport_checksum(src, dst, protocol, segment, field);
                if layer.kind == LayerKind::Udp && sum == 0 {
                    sum = 0xFFFF;
                }
                buf[at..at + 2].copy_from_slice(&sum.to_be_bytes());
            }
            LayerKind::Icmp => {
                let mut acc = checksum::Checksum::new();
                acc.add_range_skipping(&buf[layer.offset..layer.end()], &[2]);
                let sum = acc.finish();
                buf[layer.offset + 2..layer.offset + 4].copy_from_slice(&sum.to_be_bytes());
            }
            LayerKind::Raw => {}
        }
        Ok(())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("top", &self.top)
            .field("len", &self.len())
            .field("layers", &self.layers())
            .finish()
    }
}

fn write_length_field(buf: &mut [u8], layer: &Layer, len: usize) {
    let at = layer.offset;
    match layer.kind {
        LayerKind::Ipv4 => buf[at + 2..at + 4].copy_from_slice(&(len as u16).to_be_bytes()),
        LayerKind::Udp => buf[at + 4..at + 6].copy_from_slice(&(len as u16).to_be_bytes()),
        LayerKind::Tcp | LayerKind::Icmp | LayerKind::Raw => {}
    }
}

fn parse_chain(top: LayerKind, buf: &[u8]) -> Vec<Layer> {
    let mut chain = Vec::with_capacity(2);
    if buf.is_empty() {
        return chain;
    }
    match top {
        LayerKind::Ipv4 => parse_ipv4(buf, &mut chain),
        other => parse_transport(other, buf, 0, buf.len(), &mut chain),
    }
    chain
}

fn parse_ipv4(buf: &[u8], chain: &mut Vec<Layer>) {
    if buf.len() < IPV4_HEADER_LEN || buf[0] >> 4 != 4 {
        return;
    }
    let header_len = ((buf[0] & 0x0F) as usize) * 4;
    let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if header_len < IPV4_HEADER_LEN || total_len < header_len || total_len > buf.len() {
        return;
    }
    chain.push(Layer {
        kind: LayerKind::Ipv4,
        offset: 0,
        header_len,
        len: total_len,
    });

    let fragment_offset = u16::from_be_bytes([buf[6], buf[7]]) & 0x1FFF;
    let kind = match (fragment_offset, buf[9]) {
        (0, PROTO_TCP) => LayerKind::Tcp,
        (0, PROTO_UDP) => LayerKind::Udp,
        (0, PROTO_ICMP) => LayerKind::Icmp,
        _ => LayerKind::Raw,
    };
    parse_transport(kind, buf, header_len, total_len - header_len, chain);
}

fn parse_transport(kind: LayerKind, buf: &[u8], offset: usize, len: usize, chain: &mut Vec<Layer>) {
    let data = &buf[offset..offset + len];
    let header_len = match kind {
        LayerKind::Tcp if data.len() >= TCP_HEADER_LEN => {
            let doff = ((data[12] >> 4) as usize) * 4;
            (doff >= TCP_HEADER_LEN && doff <= data.len()).then_some(doff)
        }
        LayerKind::Udp if data.len() >= UDP_HEADER_LEN => Some(UDP_HEADER_LEN),
        LayerKind::Icmp if data.len() >= ICMP_HEADER_LEN => Some(ICMP_HEADER_LEN),
        LayerKind::Raw => Some(0),
        _ => None,
    };
    match header_len {
        Some(header_len) => chain.push(Layer {
            kind,
            offset,
            header_len,
            len,
        }),
        None if len > 0 => chain.push(Layer {
            kind: LayerKind::Raw,
            offset,
            header_len: 0,
            len,
        }),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn syn() -> Packet {
        let buf = build_ipv4_tcp(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(93, 184, 216, 34),
            40000,
            443,
            1000,
            0,
            TcpFlags::syn_only(),
            65535,
            &[],
            Some(1460),
        );
        Packet::ipv4(buf)
    }

    #[test]
    fn test_layer_chain() {
        let packet = syn();
        let kinds: Vec<_> = packet.layers().iter().map(|l| l.kind).collect();
        assert_eq!(kinds, vec![LayerKind::Ipv4, LayerKind::Tcp]);
        let tcp = packet.layer(LayerKind::Tcp).unwrap();
        assert_eq!(tcp.offset, 20);
        assert_eq!(tcp.header_len, 24);
        assert_eq!(tcp.payload_len(), 0);
    }

    #[test]
    fn test_attach_twice_fails() {
        let mut packet = syn();
        let err = packet.attach(BytesMut::new()).unwrap_err();
        assert!(matches!(err, StackError::AlreadyAttached));
    }

    #[test]
    fn test_detach_twice_fails() {
        let mut packet = syn();
        let buf = packet.detach().unwrap();
        assert_eq!(buf.len(), 44);
        assert!(packet.layers().is_empty());
        assert!(matches!(packet.detach(), Err(StackError::NotAttached)));
        packet.attach(buf).unwrap();
        assert_eq!(packet.layers().len(), 2);
    }

    #[test]
    fn test_truncated_transport_becomes_raw() {
        let mut buf = syn().into_buffer().unwrap();
        buf.truncate(30);
        buf[2..4].copy_from_slice(&30u16.to_be_bytes());
        let packet = Packet::ipv4(buf);
        let kinds: Vec<_> = packet.layers().iter().map(|l| l.kind).collect();
        assert_eq!(kinds, vec![LayerKind::Ipv4, LayerKind::Raw]);
    }

    #[test]
    fn test_garbage_has_no_layers() {
        let packet = Packet::ipv4(BytesMut::from(&[0x60u8, 0, 0, 0][..]));
        assert!(packet.layers().is_empty());
        assert!(packet.ipv4_view().is_none());
    }

    #[test]
    fn test_duplicate_is_independent() {
        let packet = syn();
        let mut copy = packet.duplicate();
        let mut editor = copy.tcp_editor().unwrap();
        editor.set_seq(7);
        editor.commit().unwrap();
        assert_eq!(packet.tcp_view().unwrap().seq(), 1000);
        assert_eq!(copy.tcp_view().unwrap().seq(), 7);
        assert_ne!(packet.buffer().as_ptr(), copy.buffer().as_ptr());
    }
}
