// src/transport/mod.rs
//
// Transport seam between the Orchestrator and whatever byte stream is
// carrying a codec's bytes. Grounded on the teacher's transport-layer
// modules (`io/gvret/tcp.rs` for the TCP accept-loop shape, `io/serial/
// reader.rs` for bridging a blocking `serialport` read loop into async
// code), adapted here to the server/responder direction the daemon needs
// (the teacher's versions are both client-direction readers).
//
// Bluetooth SPP is named in spec.md §6 as an external-collaborator
// transport but is not implemented: the teacher's `btleplug` dependency is
// a BLE GATT client, not an SPP server, and pulling it in would not
// actually provide Bluetooth serial port emulation. The `Transport` trait
// exists so the core never hardcodes "TCP"; a concrete SPP backend is a
// gap, not a silent stub.

pub mod serial;
pub mod tcp;

use async_trait::async_trait;

use crate::error::IoError;

#[async_trait]
pub trait Transport: Send {
    /// Non-blocking read: `Ok(0)` means no data available right now, not
    /// end-of-stream. Matches spec.md §5's "no operation may block; any
    /// I/O operation that would block returns 'no data'."
    async fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Whole-buffer write, matching the Orchestrator's flush contract.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), IoError>;

    /// True once a client is connected and `try_read`/`write_all` are
    /// meaningful. Transports with no notion of connection (e.g. a serial
    /// port, always "connected" once opened) return `true` unconditionally.
    fn is_connected(&self) -> bool;
}
