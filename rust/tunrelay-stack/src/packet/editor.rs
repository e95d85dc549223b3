//! Deferred-commit header and payload editors.

use super::{Layer, LayerKind, Packet};
use crate::error::{Result, StackError};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    /// Only the bits in `mask` are written.
    U8 { value: u8, mask: u8 },
    U16(u16),
    U32(u32),
}

impl Edit {
    fn apply(self, dst: &mut [u8]) {
        match self {
            Edit::U8 { value, mask } => dst[0] = (dst[0] & !mask) | (value & mask),
            Edit::U16(v) => dst[..2].copy_from_slice(&v.to_be_bytes()),
            Edit::U32(v) => dst[..4].copy_from_slice(&v.to_be_bytes()),
        }
    }
}

/// Summary of a committed edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    /// Field offsets (relative to the layer start) that were written.
    pub offsets: Vec<usize>,
    /// Change in layer size, in bytes.
    pub size_delta: isize,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty() && self.size_delta == 0
    }
}

/// Accumulates field edits for one layer and applies them on [`commit`](Self::commit).
///
/// Setters compare against the bytes currently in the buffer and drop the
/// edit when nothing would change.
pub struct HeaderEditor<'a> {
    packet: &'a mut Packet,
    index: usize,
    layer: Layer,
    edits: BTreeMap<usize, Edit>,
    tail: Option<Vec<u8>>,
}

impl<'a> HeaderEditor<'a> {
    pub(crate) fn new(packet: &'a mut Packet, index: usize) -> Result<Self> {
        let layer = *packet
            .layers()
            .get(index)
            .ok_or(StackError::MissingLayer("editor target"))?;
        Ok(Self {
            packet,
            index,
            layer,
            edits: BTreeMap::new(),
            tail: None,
        })
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    /// Header bytes as they are in the buffer (pending edits not applied).
    pub fn current(&self) -> &[u8] {
        let start = self.layer.offset;
        &self.packet.buffer()[start..start + self.layer.header_len]
    }

    /// Number of queued edits, counting a tail replacement as one.
    pub fn pending(&self) -> usize {
        self.edits.len() + usize::from(self.tail.is_some())
    }

    pub(crate) fn set_u8_masked(&mut self, offset: usize, value: u8, mask: u8) {
        let (value, mask) = match self.edits.get(&offset) {
            Some(Edit::U8 { value: v, mask: m }) => ((v & !mask) | (value & mask), m | mask),
            _ => (value & mask, mask),
        };
        let current = self.current()[offset];
        if current & mask == value {
            self.edits.remove(&offset);
        } else {
            self.edits.insert(offset, Edit::U8 { value, mask });
        }
    }

    pub(crate) fn set_u16(&mut self, offset: usize, value: u16) {
        let cur = self.current();
        if u16::from_be_bytes([cur[offset], cur[offset + 1]]) == value {
            self.edits.remove(&offset);
        } else {
            self.edits.insert(offset, Edit::U16(value));
        }
    }

    pub(crate) fn set_u32(&mut self, offset: usize, value: u32) {
        let cur = self.current();
        let old = u32::from_be_bytes([cur[offset], cur[offset + 1], cur[offset + 2], cur[offset + 3]]);
        if old == value {
            self.edits.remove(&offset);
        } else {
            self.edits.insert(offset, Edit::U32(value));
        }
    }

    /// Replace the variable-length options tail. The tail is zero padded to a
    /// multiple of four bytes.
    pub(crate) fn set_tail(&mut self, tail: &[u8]) -> Result<()> {
        let kind = self.layer.kind;
        let fixed = kind.fixed_header_len();
        let mut padded = tail.to_vec();
        padded.resize(tail.len().div_ceil(4) * 4, 0);
        if fixed + padded.len() > kind.max_header_len() {
            return Err(StackError::InvalidOptions(format!(
                "{} options of {} bytes exceed the header limit",
                kind,
                padded.len()
            )));
        }
        self.tail = if self.current()[fixed..] == padded[..] {
            None
        } else {
            Some(padded)
        };
        Ok(())
    }

    /// Apply all queued edits in one pass and finalize lengths and checksums.
    pub fn commit(self) -> Result<Changeset> {
        let HeaderEditor {
            packet,
            index,
            layer,
            edits,
            tail,
        } = self;
        if edits.is_empty() && tail.is_none() {
            return Ok(Changeset::default());
        }

        let mut changes = Changeset::default();
        let frame_end = packet.layers().first().map(Layer::end);
        {
            let buf = packet.buffer_mut()?;
            if let Some(tail) = tail {
                // trailing bytes past the IP total length are not carried along
                if let Some(end) = frame_end {
                    buf.truncate(end);
                }
                let fixed = layer.kind.fixed_header_len();
                let new_header_len = fixed + tail.len();
                let delta = new_header_len as isize - layer.header_len as isize;
                relocate(buf, layer.offset + layer.header_len, delta)?;
                buf[layer.offset + fixed..layer.offset + new_header_len].copy_from_slice(&tail);
                let at = write_header_len(&mut buf[layer.offset..], layer.kind, new_header_len);
                changes.offsets.push(at);
                changes.size_delta = delta;
            }
            for (offset, edit) in edits {
                edit.apply(&mut buf[layer.offset + offset..]);
                changes.offsets.push(offset);
            }
        }

        let pseudo_touched = layer.kind == LayerKind::Ipv4
            && changes.offsets.iter().any(|&o| o == 9 || (12..20).contains(&o));
        packet.on_layer_committed(index, changes.size_delta, pseudo_touched)?;
        Ok(changes)
    }
}

/// Move everything from `from` to the end of the buffer by `delta` bytes.
fn relocate(buf: &mut bytes::BytesMut, from: usize, delta: isize) -> Result<()> {
    if from % 4 != 0 || delta % 4 != 0 {
        return Err(StackError::InvalidOptions(format!(
            "unaligned relocation from {} by {}",
            from, delta
        )));
    }
    let len = buf.len();
    match delta {
        0 => {}
        d if d > 0 => {
            let d = d as usize;
            buf.resize(len + d, 0);
            buf.copy_within(from..len, from + d);
        }
        d => {
            let d = d.unsigned_abs();
            buf.copy_within(from..len, from - d);
            buf.truncate(len - d);
        }
    }
    Ok(())
}

fn write_header_len(header: &mut [u8], kind: LayerKind, header_len: usize) -> usize {
    let words = (header_len / 4) as u8;
    match kind {
        LayerKind::Ipv4 => {
            header[0] = (header[0] & 0xF0) | words;
            0
        }
        LayerKind::Tcp => {
            header[12] = (header[12] & 0x0F) | (words << 4);
            12
        }
        _ => 0,
    }
}

/// How a [`PayloadEditor`] exposes the payload region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// The current payload, for in-place rewrites.
    InPlace,
    /// `limit` writable bytes after the header, for streaming a fresh payload
    /// in (e.g. a socket read). Finish with [`PayloadEditor::flip_and_commit`].
    WriteNow { limit: usize },
}

/// Editor over the innermost layer's payload. It can change the payload size
/// but never touches header fields directly.
///
/// Dropping it without committing restores the original payload length.
pub struct PayloadEditor<'a> {
    packet: &'a mut Packet,
    index: usize,
    layer: Layer,
    mode: PayloadMode,
    original_len: usize,
    committed: bool,
}

impl<'a> PayloadEditor<'a> {
    pub(crate) fn new(packet: &'a mut Packet, mode: PayloadMode) -> Result<Self> {
        let layers = packet.layers();
        let index = layers
            .len()
            .checked_sub(1)
            .ok_or(StackError::MissingLayer("payload owner"))?;
        let layer = layers[index];
        let buf = packet.buffer_mut()?;
        // trailing bytes past the IP total length are not payload
        buf.truncate(layer.end());
        let original_len = buf.len();
        if let PayloadMode::WriteNow { limit } = mode {
            buf.resize(layer.payload_offset() + limit, 0);
        }
        Ok(Self {
            packet,
            index,
            layer,
            mode,
            original_len,
            committed: false,
        })
    }

    pub fn mode(&self) -> PayloadMode {
        self.mode
    }

    /// Writable payload region.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let start = self.layer.payload_offset();
        match self.packet.buffer.as_mut() {
            Some(buf) => &mut buf[start..],
            None => &mut [],
        }
    }

    pub fn len(&self) -> usize {
        self.packet.len() - self.layer.payload_offset()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow (zero filled) or shrink the payload to `len` bytes.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        let start = self.layer.payload_offset();
        self.packet.buffer_mut()?.resize(start + len, 0);
        Ok(())
    }

    /// Keep the current payload size and finalize.
    pub fn commit(mut self) -> Result<Changeset> {
        self.finish()
    }

    /// Shrink the payload to the `written` bytes produced so far and finalize.
    pub fn flip_and_commit(mut self, written: usize) -> Result<Changeset> {
        if written > self.len() {
            return Err(StackError::InvalidPacket(format!(
                "wrote {} bytes into a {} byte payload window",
                written,
                self.len()
            )));
        }
        self.resize(written)?;
        self.finish()
    }

    fn finish(&mut self) -> Result<Changeset> {
        self.committed = true;
        let delta = self.packet.len() as isize - self.original_len as isize;
        self.packet.on_layer_committed(self.index, delta, false)?;
        Ok(Changeset {
            offsets: Vec::new(),
            size_delta: delta,
        })
    }
}

impl Drop for PayloadEditor<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(buf) = self.packet.buffer.as_mut() {
            buf.resize(self.original_len, 0);
        }
        // payload bytes may have been rewritten even if the size is back
        let _ = self.packet.on_layer_committed(self.index, 0, false);
    }
}
