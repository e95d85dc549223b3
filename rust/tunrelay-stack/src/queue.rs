//! Ordered data/command hand-off between the packet path and the selector path.
//!
//! A [`DataTransferQueue`] owns its receiver. Producers call
//! [`put_data`](DataTransferQueue::put_data) and
//! [`put_command`](DataTransferQueue::put_command); the receiver sees data
//! and commands in exactly the order they were put, whichever path each
//! item took:
//!
//! * fast path: nothing is queued, the receiver is ready, no listener wants
//!   a retained copy and auto-flush is on. The caller's buffer is moved
//!   straight into [`TransferReceiver::on_data_ready`].
//! * slow path: the bytes are copied into a fresh buffer which is queued,
//!   listeners and the receiver are told about the retained copy, and the
//!   original buffer is handed back to the caller.

use crate::error::Result;
use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Free-form per-buffer metadata delivered alongside the data.
pub type Attachments = HashMap<String, String>;

/// Consumer side of a [`DataTransferQueue`].
pub trait TransferReceiver<C> {
    /// A buffer is ready. The receiver owns it from here on.
    fn on_data_ready(&mut self, data: BytesMut, attachments: Attachments) -> Result<()>;

    /// A copy of `len` bytes was queued instead of being delivered now.
    fn on_buffer_retained(&mut self, _len: usize) {}

    /// An out-of-band signal, ordered with respect to data.
    fn on_command(&mut self, command: C) -> Result<()>;

    /// Whether the receiver can take another item right now.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Observer that may require buffers to be copied before delivery.
pub trait RetentionListener: Send + Sync {
    fn requires_retention(&self) -> bool {
        true
    }

    /// Called with the retained copy, before it is queued.
    fn on_buffer_retained(&self, data: &[u8]);
}

/// Outcome of [`DataTransferQueue::put_data`].
#[derive(Debug)]
pub enum Delivery {
    /// The buffer was moved to the receiver.
    Direct,
    /// A copy was queued; the original buffer is returned for reuse.
    Retained(BytesMut),
}

impl Delivery {
    pub fn is_direct(&self) -> bool {
        matches!(self, Delivery::Direct)
    }
}

enum Item<C> {
    Data(BytesMut, Attachments),
    Command(C),
}

pub struct DataTransferQueue<R, C>
where
    R: TransferReceiver<C>,
{
    receiver: R,
    pending: VecDeque<Item<C>>,
    pending_bytes: usize,
    listeners: Vec<Arc<dyn RetentionListener>>,
    auto_flush: bool,
}

impl<R, C> DataTransferQueue<R, C>
where
    R: TransferReceiver<C>,
{
    pub fn new(receiver: R) -> Self {
        Self {
            receiver,
            pending: VecDeque::new(),
            pending_bytes: 0,
            listeners: Vec::new(),
            auto_flush: true,
        }
    }

    pub fn with_listeners(mut self, listeners: Vec<Arc<dyn RetentionListener>>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn RetentionListener>) {
        self.listeners.push(listener);
    }

    pub fn set_auto_flush(&mut self, auto_flush: bool) {
        self.auto_flush = auto_flush;
    }

    pub fn receiver(&self) -> &R {
        &self.receiver
    }

    pub fn receiver_mut(&mut self) -> &mut R {
        &mut self.receiver
    }

    /// Queued items not yet delivered.
    pub fn depth(&self) -> usize {
        self.pending.len()
    }

    /// Data bytes queued and not yet delivered.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    fn fast_path_open(&self) -> bool {
        self.auto_flush
            && self.pending.is_empty()
            && self.receiver.is_ready()
            && !self.listeners.iter().any(|l| l.requires_retention())
    }

    pub fn put_data(&mut self, data: BytesMut, attachments: Attachments) -> Result<Delivery> {
        if self.fast_path_open() {
            self.receiver.on_data_ready(data, attachments)?;
            return Ok(Delivery::Direct);
        }

        let copy = BytesMut::from(&data[..]);
        for listener in &self.listeners {
            if listener.requires_retention() {
                listener.on_buffer_retained(&copy);
            }
        }
        self.receiver.on_buffer_retained(copy.len());
        self.pending_bytes += copy.len();
        self.pending.push_back(Item::Data(copy, attachments));
        if self.auto_flush {
            self.flush()?;
        }
        Ok(Delivery::Retained(data))
    }

    pub fn put_command(&mut self, command: C) -> Result<()> {
        if self.auto_flush && self.pending.is_empty() && self.receiver.is_ready() {
            return self.receiver.on_command(command);
        }
        self.pending.push_back(Item::Command(command));
        if self.auto_flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Deliver queued items in order while the receiver is ready. Returns the
    /// number delivered.
    pub fn flush(&mut self) -> Result<usize> {
        let mut delivered = 0;
        while self.receiver.is_ready() {
            let Some(item) = self.pending.pop_front() else {
                break;
            };
            match item {
                Item::Data(data, attachments) => {
                    self.pending_bytes -= data.len();
                    self.receiver.on_data_ready(data, attachments)?
                }
                Item::Command(command) => self.receiver.on_command(command)?,
            }
            delivered += 1;
        }
        Ok(delivered)
    }
}
