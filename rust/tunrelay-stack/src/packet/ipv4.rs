//! IPv4 header view and editor.

use super::editor::{Changeset, HeaderEditor};
use crate::error::Result;
use std::net::Ipv4Addr;

pub const IPV4_HEADER_LEN: usize = 20;

const DONT_FRAGMENT: u8 = 0x40;

/// Read-only IPv4 header accessor over a layer's bytes.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4View<'a> {
    data: &'a [u8],
}

impl<'a> Ipv4View<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn version(&self) -> u8 {
        self.data[0] >> 4
    }

    pub fn header_len(&self) -> usize {
        ((self.data[0] & 0x0F) as usize) * 4
    }

    pub fn dscp_ecn(&self) -> u8 {
        self.data[1]
    }

    pub fn total_len(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn identification(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn dont_fragment(&self) -> bool {
        self.data[6] & DONT_FRAGMENT != 0
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    pub fn protocol(&self) -> u8 {
        self.data[9]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[10], self.data[11]])
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    pub fn options(&self) -> &'a [u8] {
        &self.data[IPV4_HEADER_LEN..self.header_len()]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len()..]
    }
}

/// Queued edits to an IPv4 header.
pub struct Ipv4Editor<'a> {
    inner: HeaderEditor<'a>,
}

impl<'a> Ipv4Editor<'a> {
    pub(crate) fn new(inner: HeaderEditor<'a>) -> Self {
        Self { inner }
    }

    pub fn set_dscp_ecn(&mut self, value: u8) -> &mut Self {
        self.inner.set_u8_masked(1, value, 0xFF);
        self
    }

    pub fn set_identification(&mut self, id: u16) -> &mut Self {
        self.inner.set_u16(4, id);
        self
    }

    pub fn set_dont_fragment(&mut self, df: bool) -> &mut Self {
        self.inner
            .set_u8_masked(6, if df { DONT_FRAGMENT } else { 0 }, DONT_FRAGMENT);
        self
    }

    pub fn set_ttl(&mut self, ttl: u8) -> &mut Self {
        self.inner.set_u8_masked(8, ttl, 0xFF);
        self
    }

    pub fn set_protocol(&mut self, protocol: u8) -> &mut Self {
        self.inner.set_u8_masked(9, protocol, 0xFF);
        self
    }

    pub fn set_src(&mut self, addr: Ipv4Addr) -> &mut Self {
        self.inner.set_u32(12, u32::from(addr));
        self
    }

    pub fn set_dst(&mut self, addr: Ipv4Addr) -> &mut Self {
        self.inner.set_u32(16, u32::from(addr));
        self
    }

    /// Replace the options tail (padded to 4 bytes, at most 40).
    pub fn set_options(&mut self, options: &[u8]) -> Result<&mut Self> {
        self.inner.set_tail(options)?;
        Ok(self)
    }

    pub fn pending(&self) -> usize {
        self.inner.pending()
    }

    pub fn commit(self) -> Result<Changeset> {
        self.inner.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_ipv4_udp, Packet};
    use smoltcp::wire::Ipv4Packet;

    fn packet() -> Packet {
        Packet::ipv4(build_ipv4_udp(
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(8, 8, 8, 8),
            3000,
            53,
            b"payload",
        ))
    }

    #[test]
    fn test_view_fields() {
        let packet = packet();
        let ip = packet.ipv4_view().unwrap();
        assert_eq!(ip.version(), 4);
        assert_eq!(ip.header_len(), 20);
        assert_eq!(ip.total_len(), 35);
        assert_eq!(ip.ttl(), 64);
        assert_eq!(ip.protocol(), 17);
        assert!(ip.dont_fragment());
        assert_eq!(ip.src(), Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(ip.dst(), Ipv4Addr::new(8, 8, 8, 8));
        assert!(ip.options().is_empty());
    }

    #[test]
    fn test_ttl_edit_keeps_length() {
        let mut packet = packet();
        let before = packet.buffer().to_vec();
        let mut editor = packet.ipv4_editor().unwrap();
        editor.set_ttl(12).set_dont_fragment(false);
        let changes = editor.commit().unwrap();
        assert_eq!(changes.size_delta, 0);
        assert_eq!(packet.len(), before.len());
        assert_eq!(packet.buffer()[20..], before[20..]);
        let ip = Ipv4Packet::new_checked(packet.buffer()).unwrap();
        assert!(ip.verify_checksum());
        assert_eq!(ip.hop_limit(), 12);
        assert!(!ip.dont_frag());
    }

    #[test]
    fn test_options_tail() {
        let mut packet = packet();
        let mut editor = packet.ipv4_editor().unwrap();
        // router alert, padded with one zero byte
        editor.set_options(&[0x94, 0x04, 0x00]).unwrap();
        assert_eq!(editor.commit().unwrap().size_delta, 4);

        let ip = packet.ipv4_view().unwrap();
        assert_eq!(ip.header_len(), 24);
        assert_eq!(ip.options(), &[0x94, 0x04, 0x00, 0x00]);
        assert_eq!(ip.total_len(), 39);
        let udp = packet.udp_view().unwrap();
        assert_eq!(udp.payload(), b"payload");
        assert_eq!(udp.dst_port(), 53);
        assert!(Ipv4Packet::new_checked(packet.buffer()).unwrap().verify_checksum());
    }
}
