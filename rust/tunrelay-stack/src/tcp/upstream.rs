//! Real upstream TCP sockets.

use crate::error::{Result, StackError};
use crate::protect::SocketProtector;
use crate::queue::{Attachments, TransferReceiver};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use tracing::{debug, trace};

/// Out-of-band signals carried in order with upstream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamCommand {
    /// The client finished sending: shut down our write side.
    HalfClose,
    /// Upstream reached end of stream: shut down our read side.
    ReadClosed,
}

/// Outcome of [`connect`].
pub struct Dialed {
    pub stream: TcpStream,
    /// The connect finished synchronously.
    pub connected: bool,
}

/// Create a non-blocking socket, bind it to an ephemeral port, protect it
/// and start connecting to `remote`.
pub fn connect(remote: SocketAddrV4, protector: &dyn SocketProtector) -> Result<Dialed> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;

    let fd = socket.as_raw_fd();
    if !protector.protect(fd) {
        return Err(StackError::SocketUnprotected(fd));
    }

    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    let connected = match socket.connect(&SocketAddr::V4(remote).into()) {
        Ok(()) => true,
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(e) => return Err(e.into()),
    };
    trace!("upstream fd={} to {} connected={}", fd, remote, connected);

    let stream: std::net::TcpStream = socket.into();
    Ok(Dialed {
        stream: TcpStream::from_std(stream),
        connected,
    })
}

/// Check a pending non-blocking connect. `Ok(false)` means still in progress.
pub fn finish_connect(stream: &TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

/// Owner of the upstream stream and the write side of the flow.
///
/// Writes never block: whatever the socket does not take is kept as a
/// backlog and the writer reports itself not ready until it is drained.
pub struct UpstreamWriter {
    stream: Option<TcpStream>,
    backlog: BytesMut,
    written: u64,
    write_shut: bool,
    read_shut: bool,
}

impl UpstreamWriter {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            backlog: BytesMut::new(),
            written: 0,
            write_shut: false,
            read_shut: false,
        }
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    pub fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn write_closed(&self) -> bool {
        self.write_shut
    }

    pub fn read_closed(&self) -> bool {
        self.read_shut
    }

    /// Total bytes handed to the socket.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Write as much of `data` as the socket takes; returns bytes written.
    fn write_some(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(closed)?;
        let mut done = 0;
        while done < data.len() {
            match stream.write(&data[done..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.written += done as u64;
        Ok(done)
    }

    /// Push the backlog out. Returns true once it is empty.
    pub fn drain(&mut self) -> Result<bool> {
        if self.backlog.is_empty() {
            return Ok(true);
        }
        let pending = std::mem::take(&mut self.backlog);
        let n = self.write_some(&pending)?;
        self.backlog = pending;
        self.backlog.advance(n);
        Ok(self.backlog.is_empty())
    }

    /// Drop the stream, shutting it down first.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.backlog.clear();
    }
}

fn closed() -> StackError {
    StackError::TcpError("upstream socket closed".into())
}

impl TransferReceiver<UpstreamCommand> for UpstreamWriter {
    fn on_data_ready(&mut self, data: BytesMut, _attachments: Attachments) -> Result<()> {
        if self.write_shut {
            return Err(StackError::TcpError("data after half-close".into()));
        }
        let mut data = data;
        let n = self.write_some(&data)?;
        if n < data.len() {
            data.advance(n);
            trace!("upstream backlog {} bytes", data.len());
            self.backlog.unsplit(data);
        }
        Ok(())
    }

    fn on_command(&mut self, command: UpstreamCommand) -> Result<()> {
        match command {
            UpstreamCommand::HalfClose => {
                if self.write_shut {
                    return Ok(());
                }
                self.write_shut = true;
                let stream = self.stream.as_ref().ok_or_else(closed)?;
                match stream.shutdown(Shutdown::Write) {
                    Ok(()) => debug!("upstream write side shut after {} bytes", self.written),
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(())
            }
            UpstreamCommand::ReadClosed => {
                self.read_shut = true;
                if let Some(stream) = self.stream.as_ref() {
                    match stream.shutdown(Shutdown::Read) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.stream.is_some() && self.backlog.is_empty()
    }
}
