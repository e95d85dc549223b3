//! UDP header view and editor.

use super::editor::{Changeset, HeaderEditor};
use crate::error::Result;

pub const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct UdpView<'a> {
    data: &'a [u8],
}

impl<'a> UdpView<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    /// Length field as carried on the wire.
    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[UDP_HEADER_LEN..]
    }
}

pub struct UdpEditor<'a> {
    inner: HeaderEditor<'a>,
}

impl<'a> UdpEditor<'a> {
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

    pub fn pending(&self) -> usize {
        self.inner.pending()
    }

    pub fn commit(self) -> Result<Changeset> {
        self.inner.commit()
    }
}
