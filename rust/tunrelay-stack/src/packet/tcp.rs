//! TCP header view, flags and editor.

use super::editor::{Changeset, HeaderEditor};
use crate::error::Result;
use std::fmt;

pub const TCP_HEADER_LEN: usize = 20;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;

/// The control bits this relay reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    /// Bits of the flags byte covered by this struct.
    pub const MASK: u8 = 0x1F;

    pub fn syn_only() -> Self {
        Self { syn: true, ..Default::default() }
    }
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.syn, "SYN"),
            (self.fin, "FIN"),
            (self.rst, "RST"),
            (self.psh, "PSH"),
            (self.ack, "ACK"),
        ];
        let set: Vec<&str> = names.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        if set.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&set.join(","))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TcpView<'a> {
    data: &'a [u8],
}

impl<'a> TcpView<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn seq(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn ack(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    pub fn header_len(&self) -> usize {
        ((self.data[12] >> 4) as usize) * 4
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_byte(self.data[13])
    }

    pub fn window(&self) -> u16 {
        u16::from_be_bytes([self.data[14], self.data[15]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[16], self.data[17]])
    }

    pub fn urgent(&self) -> u16 {
        u16::from_be_bytes([self.data[18], self.data[19]])
    }

    pub fn options(&self) -> &'a [u8] {
        &self.data[TCP_HEADER_LEN..self.header_len()]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len()..]
    }

    /// Sequence space consumed by this segment (payload plus SYN/FIN).
    pub fn seq_len(&self) -> u32 {
        let flags = self.flags();
        self.payload().len() as u32 + u32::from(flags.syn) + u32::from(flags.fin)
    }

    /// Maximum segment size option, if present.
    pub fn mss(&self) -> Option<u16> {
        let opts = self.options();
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                OPT_END => break,
                OPT_NOP => i += 1,
                OPT_MSS if i + 4 <= opts.len() && opts[i + 1] == 4 => {
                    return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                }
                _ => {
                    if i + 1 < opts.len() && opts[i + 1] > 1 {
                        i += opts[i + 1] as usize;
                    } else {
                        break;
                    }
                }
            }
        }
        None
    }
}

/// Encoded MSS option.
pub fn mss_option(mss: u16) -> [u8; 4] {
    let b = mss.to_be_bytes();
    [OPT_MSS, 4, b[0], b[1]]
}

pub struct TcpEditor<'a> {
    inner: HeaderEditor<'a>,
}

impl<'a> TcpEditor<'a> {
    pub(crate) fn new(inner: HeaderEditor<'a>) -> Self {
        Self { inner }
    }

    pub fn set_src_port(&mut self, port: u16) -> &mut Self {
        self.inner.set_u16(0, port);
        self
    }

    pub fn set_dst_port(&mut self, port: u16) -> &mut Self {
        self.inner.set_u16(2, port);
        self
    }

    pub fn set_seq(&mut self, seq: u32) -> &mut Self {
        self.inner.set_u32(4, seq);
        self
    }

    pub fn set_ack(&mut self, ack: u32) -> &mut Self {
        self.inner.set_u32(8, ack);
        self
    }

    /// Rewrites FIN/SYN/RST/PSH/ACK; URG, ECE and CWR are left alone.
    pub fn set_flags(&mut self, flags: TcpFlags) -> &mut Self {
        self.inner.set_u8_masked(13, flags.to_byte(), TcpFlags::MASK);
        self
    }

    pub fn set_window(&mut self, window: u16) -> &mut Self {
        self.inner.set_u16(14, window);
        self
    }

    pub fn set_urgent(&mut self, urgent: u16) -> &mut Self {
        self.inner.set_u16(18, urgent);
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

    #[test]
    fn test_flags_roundtrip_byte() {
        assert_eq!(TcpFlags::from_byte(0x12), TcpFlags::syn_ack());
        assert_eq!(TcpFlags::fin_ack().to_byte(), 0x11);
        assert_eq!(TcpFlags::rst_only().to_string(), "RST");
        assert_eq!(TcpFlags::psh_ack().to_string(), "PSH,ACK");
    }

    #[test]
    fn test_mss_after_nops() {
        let mut seg = vec![0u8; 28];
        seg[12] = 7 << 4;
        seg[20..28].copy_from_slice(&[1, 1, 2, 4, 0x05, 0x50, 0, 0]);
        assert_eq!(TcpView::new(&seg).mss(), Some(1360));
    }

    #[test]
    fn test_mss_skips_other_options() {
        let mut seg = vec![0u8; 32];
        seg[12] = 8 << 4;
        // sack-permitted, timestamp stub, then mss
        seg[20..32].copy_from_slice(&[4, 2, 8, 4, 0, 0, 2, 4, 0x02, 0x18, 0, 0]);
        assert_eq!(TcpView::new(&seg).mss(), Some(536));
    }

    #[test]
    fn test_malformed_option_length_stops() {
        let mut seg = vec![0u8; 24];
        seg[12] = 6 << 4;
        seg[20..24].copy_from_slice(&[8, 0, 2, 4]);
        assert_eq!(TcpView::new(&seg).mss(), None);
    }
}
