// src/orchestrator.rs
//
// Wires transports to codecs, drives the CanDispatcher per tick, and owns
// the Settings snapshot. Grounded on the teacher's `io/gvret/tcp.rs`
// (accept-loop shape) and `io/serial/reader.rs` (non-blocking serial read
// shape), adapted to the server/responder direction spec.md requires.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;

use crate::buffer::OutputBuffer;
use crate::can::NUM_BUSES;
use crate::dispatch::{CanBus, CanDispatcher, NullCanBus};
use crate::elm::ElmInterpreter;
use crate::error::IoError;
use crate::gvret::{GvretCodec, GvretEvent};
use crate::settings::Settings;
use crate::transport::Transport;

/// Heartbeat payload and destination, per spec.md §6.
const HEARTBEAT_PAYLOAD: [u8; 4] = [0x1C, 0xEF, 0xAC, 0xED];
const HEARTBEAT_PORT: u16 = 17222;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// CAN bus that ELM327 PID requests are transmitted on. The original
/// firmware wires the ELM327 emulator to a single physical OBD connector;
/// spec.md doesn't name which bus index that corresponds to in a 5-bus
/// model, so this is a resolved Open Question (see DESIGN.md): PID
/// requests always target bus 0.
const ELM_TARGET_BUS: usize = 0;

fn now_us() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u32)
        .unwrap_or(0)
}

pub struct Orchestrator {
    settings: Settings,
    gvret_codec: GvretCodec,
    gvret_out: OutputBuffer,
    gvret_transport: Box<dyn Transport>,
    elm: ElmInterpreter,
    elm_out: OutputBuffer,
    elm_transport: Box<dyn Transport>,
    dispatcher: CanDispatcher,
    heartbeat_socket: Option<UdpSocket>,
    last_heartbeat: Instant,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        gvret_transport: Box<dyn Transport>,
        elm_transport: Box<dyn Transport>,
        buses: Vec<Box<dyn CanBus>>,
        heartbeat_socket: Option<UdpSocket>,
    ) -> Self {
        let mut dispatcher = CanDispatcher::new(buses);
        let errors = dispatcher.setup(&settings);
        for e in errors {
            crate::logging::tlog_warn!("[dispatch] setup error: {}", e);
        }
        Orchestrator {
            settings,
            gvret_codec: GvretCodec::new(),
            gvret_out: OutputBuffer::new(),
            gvret_transport,
            elm: ElmInterpreter::new(),
            elm_out: OutputBuffer::new(),
            elm_transport,
            dispatcher,
            heartbeat_socket,
            last_heartbeat: Instant::now(),
        }
    }

    /// Default bus set: `NullCanBus` everywhere. Real deployments should
    /// substitute platform CAN handles (e.g. `socketcan` on Linux) before
    /// constructing the `Orchestrator`.
    pub fn null_buses() -> Vec<Box<dyn CanBus>> {
        (0..NUM_BUSES).map(|_| Box::new(NullCanBus) as Box<dyn CanBus>).collect()
    }

    pub async fn bind_heartbeat() -> Result<UdpSocket, IoError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        Ok(socket)
    }

    /// Runs the single cooperative tick loop forever. Each iteration: feed
    /// available inbound bytes to both codecs, poll the CAN dispatcher,
    /// flush output buffers, and broadcast the heartbeat if due.
    pub async fn run(mut self) -> ! {
        let mut interval = tokio::time::interval(Duration::from_millis(5));
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&mut self) {
        self.drain_gvret().await;
        self.drain_elm().await;

        let now = now_us();
        self.dispatcher.poll_tick(&self.settings, &mut self.gvret_out, &mut self.elm, &mut self.elm_out, now);

        self.flush(now).await;
        self.maybe_heartbeat().await;
    }

    async fn drain_gvret(&mut self) {
        let mut buf = [0u8; 512];
        let n = match self.gvret_transport.try_read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                crate::logging::tlog_warn!("[gvret] transport read error: {}", e);
                return;
            }
        };
        for &byte in &buf[..n] {
            let now = now_us();
            if let Some(event) =
                self.gvret_codec.process_byte(byte, &mut self.gvret_out, &mut self.settings, now)
            {
                match event {
                    GvretEvent::SendFrame { bus, frame } => {
                        if let Err(e) = self.dispatcher.send_frame(bus, &frame) {
                            crate::logging::tlog_warn!("[gvret] bus {} send failed: {}", bus, e);
                        }
                    }
                    GvretEvent::CaptureFrame { bus, frame } => {
                        self.gvret_out.append_frame(&frame, bus as u8, now, self.settings.use_binary_serial_comm);
                    }
                }
            }
        }
    }

    async fn drain_elm(&mut self) {
        let mut buf = [0u8; 512];
        let n = match self.elm_transport.try_read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                crate::logging::tlog_warn!("[elm] transport read error: {}", e);
                return;
            }
        };
        for &byte in &buf[..n] {
            if let Some(frame) = self.elm.process_byte(byte, &mut self.elm_out) {
                if let Err(e) = self.dispatcher.send_frame(ELM_TARGET_BUS, &frame) {
                    crate::logging::tlog_warn!("[elm] bus {} send failed: {}", ELM_TARGET_BUS, e);
                }
            }
        }
    }

    async fn flush(&mut self, _now: u32) {
        if self.gvret_out.available() > 0 {
            let bytes = self.gvret_out.take_all();
            if let Err(e) = self.gvret_transport.write_all(&bytes).await {
                crate::logging::tlog_warn!("[gvret] flush failed: {}", e);
            }
        }
        if self.elm_out.available() > 0 {
            let bytes = self.elm_out.take_all();
            if let Err(e) = self.elm_transport.write_all(&bytes).await {
                crate::logging::tlog_warn!("[elm] flush failed: {}", e);
            }
        }
    }

    async fn maybe_heartbeat(&mut self) {
        if self.last_heartbeat.elapsed() < HEARTBEAT_INTERVAL {
            return;
        }
        self.last_heartbeat = Instant::now();
        let Some(socket) = self.heartbeat_socket.as_ref() else { return };
        let dest = format!("255.255.255.255:{}", HEARTBEAT_PORT);
        if let Err(e) = socket.send_to(&HEARTBEAT_PAYLOAD, dest).await {
            crate::logging::tlog_warn!("[heartbeat] send failed: {}", e);
        }
    }
}

/// Registers mDNS service advertisements per spec.md §6
/// (`_telnet._tcp:23`, `_ELM327._tcp:1000`). Failure to advertise is
/// logged, not fatal — discovery is a convenience, not a protocol
/// requirement.
pub fn advertise_mdns(daemon: &mdns_sd::ServiceDaemon, host_ip: std::net::Ipv4Addr, hostname: &str) {
    let services = [("_telnet._tcp.local.", 23u16), ("_ELM327._tcp.local.", 1000u16)];
    for (service_type, port) in services {
        let no_properties: &[(&str, &str)] = &[];
        match mdns_sd::ServiceInfo::new(service_type, hostname, hostname, host_ip, port, no_properties) {
            Ok(info) => {
                if let Err(e) = daemon.register(info) {
                    crate::logging::tlog_warn!("[mdns] failed to register {}: {}", service_type, e);
                }
            }
            Err(e) => crate::logging::tlog_warn!("[mdns] failed to build {} info: {}", service_type, e),
        }
    }
}
