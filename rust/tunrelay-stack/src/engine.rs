//! Engine assembly and thread lifecycle.
//!
//! ```text
//!            +-------------- tunnel-io (TaskRunner) ---------------+
//!  device -> | TunReader -> uplink hooks -> IpProtocolDispatcher   |
//!  device <- | TunWriter <- downlink hooks <- downlink queue       |
//!            +------------------|---------------------^------------+
//!                   tcp/udp uplink queues             |
//!                               v                     |
//!            tcp-transmitter / udp-transmitter   tcp-receiver / udp-receiver
//!                    (socket writes)               (selector loops)
//! ```

use crate::config::EngineConfig;
use crate::device::{ChannelSink, Overflow, PacketSink, TunReader, TunWriter, VirtualDevice};
use crate::dispatch::IpProtocolDispatcher;
use crate::error::{Result, StackError};
use crate::events::{EventBus, FlowEvent};
use crate::hooks::{Direction, HookTable, PacketHook};
use crate::monitor::{Monitor, MonitorSnapshot, ThreadBoard};
use crate::packet::Packet;
use crate::protect::{NoopProtector, SocketProtector};
use crate::queue::RetentionListener;
use crate::runner::TaskRunner;
use crate::selector::Selector;
use crate::stats::StackStats;
use crate::tcp::{TcpReceiver, TcpShared, TcpTransmitter};
use crate::udp::{UdpReceiver, UdpShared, UdpTransmitter};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

pub const THREAD_TUNNEL_IO: &str = "tunnel-io";
pub const THREAD_TCP_TRANSMITTER: &str = "tcp-transmitter";
pub const THREAD_TCP_RECEIVER: &str = "tcp-receiver";
pub const THREAD_UDP_TRANSMITTER: &str = "udp-transmitter";
pub const THREAD_UDP_RECEIVER: &str = "udp-receiver";

const THREADS: [&str; 5] = [
    THREAD_TUNNEL_IO,
    THREAD_TCP_TRANSMITTER,
    THREAD_TCP_RECEIVER,
    THREAD_UDP_TRANSMITTER,
    THREAD_UDP_RECEIVER,
];

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    protector: Arc<dyn SocketProtector>,
    hooks: Vec<(Direction, i32, Arc<dyn PacketHook>)>,
    listeners: Vec<Arc<dyn RetentionListener>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            protector: Arc::new(NoopProtector),
            hooks: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    pub fn session_capacity(mut self, capacity: usize) -> Self {
        self.config.tcp.session_capacity = capacity;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.udp.channel_capacity = capacity;
        self
    }

    pub fn protector(mut self, protector: Arc<dyn SocketProtector>) -> Self {
        self.protector = protector;
        self
    }

    pub fn hook(mut self, direction: Direction, priority: i32, hook: Arc<dyn PacketHook>) -> Self {
        self.hooks.push((direction, priority, hook));
        self
    }

    pub fn retention_listener(mut self, listener: Arc<dyn RetentionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<Engine> {
        Engine::new(self)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Selectors and queue ends handed to the worker threads on start.
struct Pending {
    tcp_selector: Selector,
    udp_selector: Selector,
    tcp_rx: Receiver<Packet>,
    udp_rx: Receiver<Packet>,
    downlink_rx: Receiver<Packet>,
}

/// The relay: owns the flow engines and the five worker threads.
pub struct Engine {
    config: EngineConfig,
    running: Arc<AtomicBool>,
    stats: Arc<StackStats>,
    events: EventBus,
    hooks: Arc<HookTable>,
    tcp: Arc<TcpShared>,
    udp: Arc<UdpShared>,
    dispatcher: Arc<IpProtocolDispatcher>,
    threads: Arc<ThreadBoard>,
    monitor: Monitor,
    pending: Mutex<Option<Pending>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    fn new(builder: EngineBuilder) -> Result<Self> {
        let EngineBuilder {
            config,
            protector,
            hooks: hook_list,
            listeners,
        } = builder;
        config.validate()?;

        let stats = Arc::new(StackStats::new());
        let events = EventBus::new(config.event_capacity);
        let running = Arc::new(AtomicBool::new(false));

        let tcp_selector = Selector::new()?;
        let udp_selector = Selector::new()?;

        let (tcp_tx, tcp_rx) = bounded(config.tcp.queue_capacity);
        let (udp_tx, udp_rx) = bounded(config.udp.queue_capacity);
        let (downlink_tx, downlink_rx) = bounded(config.tunnel.write_queue);
        let tcp_uplink = ChannelSink::new("tcp-uplink", tcp_tx, Overflow::Drop);
        let udp_uplink = ChannelSink::new("udp-uplink", udp_tx, Overflow::Drop);
        let downlink = ChannelSink::new(
            "downlink",
            downlink_tx,
            Overflow::Block(config.tunnel.write_wait()),
        );
        let downlink_sink: Arc<dyn PacketSink> = Arc::new(downlink.clone());

        let tcp = Arc::new(TcpShared::new(
            config.clone(),
            tcp_selector.handle(),
            downlink_sink.clone(),
            protector.clone(),
            events.clone(),
            stats.clone(),
            listeners,
        ));
        let udp = Arc::new(UdpShared::new(
            config.clone(),
            udp_selector.handle(),
            downlink_sink,
            protector,
            events.clone(),
            stats.clone(),
        ));

        let dispatcher = Arc::new(
            IpProtocolDispatcher::new(stats.clone())
                .with_tcp(Arc::new(tcp_uplink.clone()))
                .with_udp(Arc::new(udp_uplink.clone())),
        );

        let hooks = Arc::new(HookTable::new());
        for (direction, priority, hook) in hook_list {
            hooks.register(direction, priority, hook);
        }

        let threads = Arc::new(ThreadBoard::new(&THREADS));
        let monitor = Monitor {
            running: running.clone(),
            threads: threads.clone(),
            tcp: tcp.clone(),
            udp: udp.clone(),
            tcp_uplink,
            udp_uplink,
            downlink,
            stats: stats.clone(),
        };

        Ok(Self {
            config,
            running,
            stats,
            events,
            hooks,
            tcp,
            udp,
            dispatcher,
            threads,
            monitor,
            pending: Mutex::new(Some(Pending {
                tcp_selector,
                udp_selector,
                tcp_rx,
                udp_rx,
                downlink_rx,
            })),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker threads over `device`. An engine starts once.
    pub fn start(&self, device: Arc<dyn VirtualDevice>) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| StackError::Config("engine already started".into()))?;
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Starting relay on {} (mtu={}, tcp sessions={}, udp channels={})",
            device.name(),
            self.config.mtu,
            self.tcp.capacity(),
            self.udp.capacity()
        );

        let Pending {
            tcp_selector,
            udp_selector,
            tcp_rx,
            udp_rx,
            downlink_rx,
        } = pending;

        let runner = TaskRunner::new(self.running.clone())
            .with_idle_sleep(self.config.tunnel.idle_sleep())
            .add(Box::new(TunReader::new(
                device.clone(),
                self.hooks.clone(),
                self.dispatcher.clone(),
                self.stats.clone(),
            )))
            .add(Box::new(TunWriter::new(
                device,
                self.hooks.clone(),
                downlink_rx,
                self.stats.clone(),
            )));
        self.spawn(THREAD_TUNNEL_IO, move |_| runner.run())?;

        let transmitter = TcpTransmitter::new(self.tcp.clone());
        self.spawn(THREAD_TCP_TRANSMITTER, move |running| {
            transmitter.run(&tcp_rx, running)
        })?;

        let mut receiver = TcpReceiver::new(self.tcp.clone(), tcp_selector);
        self.spawn(THREAD_TCP_RECEIVER, move |running| receiver.run(running))?;

        let transmitter = UdpTransmitter::new(self.udp.clone());
        self.spawn(THREAD_UDP_TRANSMITTER, move |running| {
            transmitter.run(&udp_rx, running)
        })?;

        let mut receiver = UdpReceiver::new(self.udp.clone(), udp_selector);
        self.spawn(THREAD_UDP_RECEIVER, move |running| receiver.run(running))?;

        Ok(())
    }

    fn spawn<F>(&self, name: &'static str, body: F) -> Result<()>
    where
        F: FnOnce(&AtomicBool) -> Result<()> + Send + 'static,
    {
        let running = self.running.clone();
        let board = self.threads.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut guard = board.guard(name);
                debug!("thread {} started", name);
                if let Err(e) = body(&running) {
                    error!("thread {} failed: {}", name, e);
                    guard.fail();
                }
            })?;
        self.handles.lock().push(handle);
        Ok(())
    }

    /// Stop all threads and force-close every flow.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        for selector in [&self.tcp.selector, &self.udp.selector] {
            if let Err(e) = selector.wake() {
                debug!("selector wake failed: {}", e);
            }
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!("thread {} panicked", name);
            }
        }
        let tcp = self.tcp.close_all();
        let udp = self.udp.close_all();
        if was_running {
            info!("Relay stopped ({} tcp sessions, {} udp channels closed)", tcp, udp);
        }
    }

    /// Feed a packet as if it had been read from the tunnel.
    pub fn inject(&self, mut packet: Packet) {
        if self.hooks.run(Direction::Uplink, &mut packet) {
            self.dispatcher.dispatch(packet);
        } else {
            self.stats.record_dropped();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<StackStats> {
        &self.stats
    }

    pub fn hooks(&self) -> &Arc<HookTable> {
        &self.hooks
    }

    pub fn tcp(&self) -> &Arc<TcpShared> {
        &self.tcp
    }

    pub fn udp(&self) -> &Arc<UdpShared> {
        &self.udp
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    pub fn monitor(&self) -> Monitor {
        self.monitor.clone()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.monitor.snapshot()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
