//! Internet checksum (RFC 1071) accumulator.

use std::net::Ipv4Addr;

/// Running one's-complement sum over 16-bit big-endian words.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum {
    sum: u64,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_u16(&mut self, word: u16) {
        self.sum += word as u64;
    }

    pub fn add_u32(&mut self, value: u32) {
        self.add_u16((value >> 16) as u16);
        self.add_u16(value as u16);
    }

    /// Sum `data` as 16-bit words. An odd trailing byte is padded with zero.
    pub fn add_bytes(&mut self, data: &[u8]) {
        self.add_range_skipping(data, &[]);
    }

    /// Sum `data`, ignoring the words that start at the given even byte offsets.
    pub fn add_range_skipping(&mut self, data: &[u8], skip: &[usize]) {
        let mut chunks = data.chunks_exact(2);
        for (i, word) in chunks.by_ref().enumerate() {
            if skip.contains(&(i * 2)) {
                continue;
            }
            self.sum += u16::from_be_bytes([word[0], word[1]]) as u64;
        }
        if let [last] = chunks.remainder() {
            if !skip.contains(&(data.len() - 1)) {
                self.sum += (*last as u64) << 8;
            }
        }
    }

    /// IPv4 pseudo header used by TCP and UDP.
    pub fn add_pseudo_header(&mut self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: usize) {
        self.add_u32(u32::from(src));
        self.add_u32(u32::from(dst));
        self.add_u16(protocol as u16);
        self.add_u16(length as u16);
    }

    fn fold(&self) -> u16 {
        let mut sum = self.sum;
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        sum as u16
    }

    /// Fold carries and return the one's complement.
    pub fn finish(&self) -> u16 {
        !self.fold()
    }
}

/// Checksum of an IPv4 header, skipping the checksum field itself.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut acc = Checksum::new();
    acc.add_range_skipping(header, &[10]);
    acc.finish()
}

/// TCP or UDP checksum over pseudo header plus segment, skipping the field at `checksum_offset`.
pub fn transport_checksum(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
    checksum_offset: usize,
) -> u16 {
    let mut acc = Checksum::new();
    acc.add_pseudo_header(src, dst, protocol, segment.len());
    acc.add_range_skipping(segment, &[checksum_offset]);
    acc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1071_example() {
        // Words from RFC 1071 section 3.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        let mut acc = Checksum::new();
        acc.add_bytes(&data);
        assert_eq!(acc.fold(), 0xddf2);
        assert_eq!(acc.finish(), !0xddf2);
    }

    #[test]
    fn test_skip_ignores_field() {
        let mut with_field = [0x45u8, 0x00, 0x00, 0x14, 0xab, 0xcd];
        let mut acc = Checksum::new();
        acc.add_range_skipping(&with_field, &[4]);
        let skipped = acc.finish();

        with_field[4] = 0;
        with_field[5] = 0;
        let mut acc = Checksum::new();
        acc.add_bytes(&with_field);
        assert_eq!(skipped, acc.finish());
    }

    #[test]
    fn test_odd_length_pads_zero() {
        let mut a = Checksum::new();
        a.add_bytes(&[0x12, 0x34, 0x56]);
        let mut b = Checksum::new();
        b.add_bytes(&[0x12, 0x34, 0x56, 0x00]);
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn test_valid_header_sums_to_zero() {
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let sum = ipv4_header_checksum(&header);
        assert_eq!(sum, 0xb861);
        header[10..12].copy_from_slice(&sum.to_be_bytes());
        let mut acc = Checksum::new();
        acc.add_bytes(&header);
        assert_eq!(acc.finish(), 0);
    }
}
