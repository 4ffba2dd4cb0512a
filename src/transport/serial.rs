// src/transport/serial.rs
//
// Serial UART transport for the GVRET channel. `serialport` is synchronous,
// so reads/writes run on a blocking thread and bridge into the async
// Orchestrator loop through channels — the same shape as the teacher's
// `io/serial/reader.rs::run_source` (open with a short timeout, spawn_blocking
// a loop that drains a transmit channel then attempts a read), simplified
// here to a raw byte stream (no SLIP/Modbus framing — the GVRET/ELM codecs
// do their own framing on top).

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::IoError;
use crate::transport::Transport;

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const CHANNEL_CAPACITY: usize = 256;

pub struct SerialTransport {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: std_mpsc::SyncSender<Vec<u8>>,
    _blocking: tokio::task::JoinHandle<()>,
}

impl SerialTransport {
    pub fn open(port_path: &str, baud_rate: u32) -> Result<Self, IoError> {
        let port = serialport::new(port_path, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| IoError::protocol("serial", format!("opening {}: {}", port_path, e)))?;

        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = std_mpsc::sync_channel::<Vec<u8>>(CHANNEL_CAPACITY);

        let path = port_path.to_string();
        let blocking = tokio::task::spawn_blocking(move || {
            run_blocking_loop(port, outbound_rx, inbound_tx, path);
        });

        Ok(SerialTransport { inbound: inbound_rx, outbound: outbound_tx, _blocking: blocking })
    }
}

fn run_blocking_loop(
    mut port: Box<dyn serialport::SerialPort>,
    outbound_rx: std_mpsc::Receiver<Vec<u8>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    path: String,
) {
    use std::io::{Read, Write};
    let mut buf = [0u8; 256];
    loop {
        while let Ok(data) = outbound_rx.try_recv() {
            if let Err(e) = port.write_all(&data).and_then(|_| port.flush()) {
                crate::logging::tlog_warn!("[serial] write error on {}: {}", path, e);
            }
        }

        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if inbound_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    return;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                crate::logging::tlog_warn!("[serial] read error on {}: {}", path, e);
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        match self.inbound.try_recv() {
            Ok(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(0),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(IoError::protocol("serial", "reader task ended"))
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.outbound
            .try_send(data.to_vec())
            .map_err(|e| IoError::protocol("serial", format!("write channel full or closed: {}", e)))
    }

    fn is_connected(&self) -> bool {
        true
    }
}
