//! Tunnel device abstraction and the tasks that pump it.
//!
//! The tunnel-I/O thread runs a [`TaskRunner`](crate::runner::TaskRunner)
//! holding a [`TunReader`] (device -> uplink hooks -> dispatcher) and a
//! [`TunWriter`] (downlink queue -> downlink hooks -> device). Both work on a
//! non-blocking device so neither direction needs its own blocking thread.

use crate::dispatch::IpProtocolDispatcher;
use crate::error::{Result, StackError};
use crate::hooks::{Direction, HookTable};
use crate::packet::{LayerKind, Packet};
use crate::runner::Task;
use crate::stats::StackStats;
use bytes::BytesMut;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryRecvError, TrySendError};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Packets handled per task round in each direction.
const BATCH: usize = 64;

/// Consumer of whole packets.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, packet: Packet) -> Result<()>;
}

/// Producer of whole packets. `Ok(None)` means nothing is available right now.
pub trait PacketSource {
    fn next_packet(&mut self) -> Result<Option<Packet>>;
}

/// Device configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Interface name (for logging and for opening a new TUN)
    pub name: String,
    /// MTU (Maximum Transmission Unit)
    pub mtu: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "tun0".to_string(),
            mtu: 1500,
        }
    }
}

/// Trait for virtual network devices
pub trait VirtualDevice: Send + Sync {
    /// Read one packet. A non-blocking device with nothing to read returns
    /// [`StackError::DeviceNotReady`].
    fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one packet.
    fn write_packet(&self, data: &[u8]) -> Result<usize>;

    fn mtu(&self) -> usize;

    fn name(&self) -> &str;
}

/// TUN device backed by a file descriptor, switched to non-blocking mode.
pub struct FdDevice {
    file: File,
    config: DeviceConfig,
}

impl FdDevice {
    /// Take ownership of an already configured TUN descriptor (for example
    /// one handed over by a VPN service).
    ///
    /// # Safety
    /// `fd` must be an open descriptor that nothing else will close.
    pub unsafe fn from_raw_fd(fd: RawFd, config: DeviceConfig) -> Result<Self> {
        let file = File::from_raw_fd(fd);
        set_nonblocking(file.as_raw_fd())?;
        debug!("tunnel device {} attached to fd={}", config.name, fd);
        Ok(Self { file, config })
    }

    /// Create or attach to a TUN interface through `/dev/net/tun`.
    #[cfg(target_os = "linux")]
    pub fn open(config: DeviceConfig) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        const TUNSETIFF: u64 = 0x4004_54ca;

        #[repr(C)]
        struct IfReq {
            name: [libc::c_char; libc::IFNAMSIZ],
            flags: libc::c_short,
            _pad: [u8; 22],
        }

        if config.name.len() >= libc::IFNAMSIZ {
            return Err(StackError::Config(format!("interface name too long: {}", config.name)));
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(config.name.bytes()) {
            *dst = src as libc::c_char;
        }
        // SAFETY: req is a properly sized ifreq and the fd is open.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        debug!("opened tunnel device {}", config.name);
        Ok(Self { file, config })
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: plain fcntl calls on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn map_would_block(e: io::Error) -> StackError {
    if e.kind() == io::ErrorKind::WouldBlock {
        StackError::DeviceNotReady
    } else {
        StackError::Io(e)
    }
}

impl VirtualDevice for FdDevice {
    fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        (&self.file).read(buf).map_err(map_would_block)
    }

    fn write_packet(&self, data: &[u8]) -> Result<usize> {
        (&self.file).write(data).map_err(map_would_block)
    }

    fn mtu(&self) -> usize {
        self.config.mtu
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

/// What a [`ChannelSink`] does when its queue is full.
#[derive(Debug, Clone, Copy)]
pub enum Overflow {
    /// Drop the packet immediately.
    Drop,
    /// Wait up to the given time for room, then drop.
    Block(Duration),
}

/// [`PacketSink`] over a bounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    name: &'static str,
    tx: Sender<Packet>,
    overflow: Overflow,
}

impl ChannelSink {
    pub fn new(name: &'static str, tx: Sender<Packet>, overflow: Overflow) -> Self {
        Self { name, tx, overflow }
    }

    /// Packets waiting in the channel.
    pub fn depth(&self) -> usize {
        self.tx.len()
    }
}

impl PacketSink for ChannelSink {
    fn deliver(&self, packet: Packet) -> Result<()> {
        match self.overflow {
            Overflow::Drop => self.tx.try_send(packet).map_err(|e| match e {
                TrySendError::Full(_) => StackError::QueueFull(self.name),
                TrySendError::Disconnected(_) => StackError::ChannelClosed,
            }),
            Overflow::Block(wait) => self.tx.send_timeout(packet, wait).map_err(|e| match e {
                SendTimeoutError::Timeout(_) => StackError::QueueFull(self.name),
                SendTimeoutError::Disconnected(_) => StackError::ChannelClosed,
            }),
        }
    }
}

/// Reads packets from the device and hands them to the dispatcher.
///
/// Packets are carved off one shared read buffer with `split_to`; a fresh
/// region is reserved only once the remaining capacity drops below one MTU.
pub struct TunReader {
    device: Arc<dyn VirtualDevice>,
    hooks: Arc<HookTable>,
    dispatcher: Arc<IpProtocolDispatcher>,
    stats: Arc<StackStats>,
    buf: BytesMut,
}

impl TunReader {
    pub fn new(
        device: Arc<dyn VirtualDevice>,
        hooks: Arc<HookTable>,
        dispatcher: Arc<IpProtocolDispatcher>,
        stats: Arc<StackStats>,
    ) -> Self {
        Self {
            device,
            hooks,
            dispatcher,
            stats,
            buf: BytesMut::new(),
        }
    }
}

impl PacketSource for TunReader {
    fn next_packet(&mut self) -> Result<Option<Packet>> {
        let mtu = self.device.mtu();
        if self.buf.capacity() < mtu {
            self.buf.reserve(mtu * BATCH);
        }
        self.buf.resize(mtu, 0);
        match self.device.read_packet(&mut self.buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                let packet = self.buf.split_to(n);
                self.buf.clear();
                self.stats.record_received(n);
                Ok(Some(Packet::with_buffer(LayerKind::Ipv4, packet)))
            }
            Err(e) if e.is_would_block() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Task for TunReader {
    fn name(&self) -> &str {
        "tun-reader"
    }

    fn run_once(&mut self) -> Result<bool> {
        let mut worked = false;
        for _ in 0..BATCH {
            let Some(mut packet) = self.next_packet()? else {
                break;
            };
            worked = true;
            let version = packet.buffer().first().map(|b| b >> 4).unwrap_or(0);
            if version != 4 {
                trace!("dropping non-IPv4 packet (version {})", version);
                self.stats.record_invalid();
                continue;
            }
            if !self.hooks.run(Direction::Uplink, &mut packet) {
                self.stats.record_dropped();
                continue;
            }
            self.dispatcher.dispatch(packet);
        }
        Ok(worked)
    }

    fn terminate(&mut self) {
        debug!("tunnel reader on {} stopped", self.device.name());
    }
}

/// Drains the downlink queue into the device.
pub struct TunWriter {
    device: Arc<dyn VirtualDevice>,
    hooks: Arc<HookTable>,
    rx: Receiver<Packet>,
    stats: Arc<StackStats>,
    stalled: Option<Packet>,
}

impl TunWriter {
    pub fn new(
        device: Arc<dyn VirtualDevice>,
        hooks: Arc<HookTable>,
        rx: Receiver<Packet>,
        stats: Arc<StackStats>,
    ) -> Self {
        Self {
            device,
            hooks,
            rx,
            stats,
            stalled: None,
        }
    }

    fn next_outgoing(&mut self) -> Option<Packet> {
        if let Some(packet) = self.stalled.take() {
            return Some(packet);
        }
        loop {
            let mut packet = match self.rx.try_recv() {
                Ok(packet) => packet,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            };
            if self.hooks.run(Direction::Downlink, &mut packet) {
                return Some(packet);
            }
            self.stats.record_dropped();
        }
    }
}

impl Task for TunWriter {
    fn name(&self) -> &str {
        "tun-writer"
    }

    fn run_once(&mut self) -> Result<bool> {
        let mut worked = false;
        for _ in 0..BATCH {
            let Some(packet) = self.next_outgoing() else {
                break;
            };
            match self.device.write_packet(packet.buffer()) {
                Ok(n) => {
                    worked = true;
                    self.stats.record_sent(n);
                }
                Err(e) if e.is_would_block() => {
                    self.stalled = Some(packet);
                    break;
                }
                Err(StackError::Io(e)) if e.kind() == io::ErrorKind::InvalidInput => {
                    warn!("tunnel rejected a {} byte packet: {}", packet.len(), e);
                    self.stats.record_dropped();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(worked)
    }

    fn terminate(&mut self) {
        let dropped = self.rx.len() + usize::from(self.stalled.is_some());
        if dropped > 0 {
            debug!("tunnel writer stopped with {} packets unsent", dropped);
        }
    }
}

/// Mock device for testing
#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    pub struct MockDevice {
        config: DeviceConfig,
        read_queue: Mutex<VecDeque<Vec<u8>>>,
        write_queue: Mutex<VecDeque<Vec<u8>>>,
    }

    impl MockDevice {
        pub fn new(config: DeviceConfig) -> Self {
            Self {
                config,
                read_queue: Mutex::new(VecDeque::new()),
                write_queue: Mutex::new(VecDeque::new()),
            }
        }

        pub fn inject_packet(&self, data: Vec<u8>) {
            self.read_queue.lock().push_back(data);
        }

        pub fn get_written_packets(&self) -> Vec<Vec<u8>> {
            self.write_queue.lock().drain(..).collect()
        }
    }

    impl VirtualDevice for MockDevice {
        fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
            if let Some(packet) = self.read_queue.lock().pop_front() {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            } else {
                Err(StackError::DeviceNotReady)
            }
        }

        fn write_packet(&self, data: &[u8]) -> Result<usize> {
            self.write_queue.lock().push_back(data.to_vec());
            Ok(data.len())
        }

        fn mtu(&self) -> usize {
            self.config.mtu
        }

        fn name(&self) -> &str {
            &self.config.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockDevice;
    use super::*;
    use crate::hooks::{HookVerdict, PacketHook};
    use crate::packet::{build_ipv4_udp, TcpFlags};
    use crossbeam_channel::bounded;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Vec<u8>>>);

    impl PacketSink for Collect {
        fn deliver(&self, packet: Packet) -> Result<()> {
            self.0.lock().push(packet.buffer().to_vec());
            Ok(())
        }
    }

    fn datagram(port: u16) -> Vec<u8> {
        build_ipv4_udp(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(8, 8, 8, 8), port, 53, b"q").to_vec()
    }

    #[test]
    fn test_reader_dispatches_ipv4_only() {
        let device = Arc::new(MockDevice::new(DeviceConfig::default()));
        let stats = Arc::new(StackStats::new());
        let udp = Arc::new(Collect::default());
        let dispatcher = Arc::new(IpProtocolDispatcher::new(stats.clone()).with_udp(udp.clone()));
        let mut reader = TunReader::new(device.clone(), Arc::new(HookTable::new()), dispatcher, stats.clone());

        device.inject_packet(datagram(1000));
        device.inject_packet(vec![0x60, 0, 0, 0, 0, 0, 0, 0]);
        device.inject_packet(datagram(1001));

        assert!(reader.run_once().unwrap());
        assert!(!reader.run_once().unwrap());
        assert_eq!(*udp.0.lock(), vec![datagram(1000), datagram(1001)]);
        assert_eq!(stats.snapshot().packets_invalid, 1);
        assert_eq!(stats.snapshot().packets_received, 3);
    }

    #[test]
    fn test_reader_carves_packets_from_one_buffer() {
        let device = Arc::new(MockDevice::new(DeviceConfig::default()));
        let stats = Arc::new(StackStats::new());
        let dispatcher = Arc::new(IpProtocolDispatcher::new(stats.clone()));
        let mut reader = TunReader::new(device.clone(), Arc::new(HookTable::new()), dispatcher, stats);

        device.inject_packet(datagram(2000));
        device.inject_packet(datagram(2001));
        let mut first = reader.next_packet().unwrap().unwrap();
        let second = reader.next_packet().unwrap().unwrap();
        assert!(reader.next_packet().unwrap().is_none());

        assert_eq!(first.buffer(), &datagram(2000)[..]);
        assert_eq!(second.buffer(), &datagram(2001)[..]);
        let end = first.buffer().as_ptr() as usize + first.len();
        assert_eq!(end, second.buffer().as_ptr() as usize);

        // growing one packet never spills into its neighbour
        {
            let mut payload = first.payload_editor(crate::packet::PayloadMode::InPlace).unwrap();
            payload.resize(64).unwrap();
            payload.commit().unwrap();
        }
        assert_eq!(second.buffer(), &datagram(2001)[..]);
        assert_eq!(first.udp_view().unwrap().payload().len(), 64);
    }

    #[test]
    fn test_writer_runs_downlink_hooks() {
        struct DropTcp;
        impl PacketHook for DropTcp {
            fn name(&self) -> &str {
                "drop-tcp"
            }
            fn on_packet(&self, _: Direction, packet: &mut Packet) -> Result<HookVerdict> {
                Ok(if packet.tcp_view().is_some() { HookVerdict::Drop } else { HookVerdict::Continue })
            }
        }

        let device = Arc::new(MockDevice::new(DeviceConfig::default()));
        let hooks = Arc::new(HookTable::new());
        hooks.register(Direction::Downlink, 0, Arc::new(DropTcp));
        let (tx, rx) = bounded(8);
        let stats = Arc::new(StackStats::new());
        let mut writer = TunWriter::new(device.clone(), hooks, rx, stats.clone());

        let udp = datagram(7);
        tx.send(Packet::ipv4(BytesMut::from(&udp[..]))).unwrap();
        tx.send(Packet::ipv4(crate::packet::build_ipv4_tcp(
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            80,
            4000,
            1,
            1,
            TcpFlags::ack_only(),
            100,
            &[],
            None,
        )))
        .unwrap();

        assert!(writer.run_once().unwrap());
        let written = device.get_written_packets();
        assert_eq!(written, vec![udp]);
        assert_eq!(stats.snapshot().packets_dropped, 1);
        assert_eq!(stats.snapshot().packets_sent, 1);
    }

    #[test]
    fn test_channel_sink_drop_when_full() {
        let (tx, _rx) = bounded(1);
        let sink = ChannelSink::new("test", tx, Overflow::Drop);
        sink.deliver(Packet::ipv4(BytesMut::from(&datagram(1)[..]))).unwrap();
        assert!(matches!(
            sink.deliver(Packet::ipv4(BytesMut::from(&datagram(2)[..]))),
            Err(StackError::QueueFull("test"))
        ));
        assert_eq!(sink.depth(), 1);
    }
}
