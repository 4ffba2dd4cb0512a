// src/transport/tcp.rs
//
// Single-client TCP transport (MAX_CLIENTS = 1 per spec.md §6) for either
// the GVRET telnet port (23) or the ELM text port (1000). Grounded on the
// teacher's `io/gvret/tcp.rs` accept-loop shape, inverted to the
// server/responder direction: our listener accepts a peer and answers its
// bytes rather than dialing out to read frames from one.

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::error::IoError;
use crate::transport::Transport;

pub struct TcpServerTransport {
    listener: TcpListener,
    stream: Option<TcpStream>,
    name: &'static str,
}

impl TcpServerTransport {
    pub async fn bind(addr: &str, name: &'static str) -> Result<Self, IoError> {
        let listener = TcpListener::bind(addr).await?;
        crate::logging::tlog_info!("[{}] listening on {}", name, addr);
        Ok(TcpServerTransport { listener, stream: None, name })
    }

    /// Accepts a new client if one has connected, replacing any existing
    /// connection (MAX_CLIENTS = 1: the newest connection wins). Resetting
    /// the caller's codec state on disconnect is the caller's
    /// responsibility, per spec.md §7 "Transport disconnect."
    ///
    /// Polled manually (rather than awaited) so the Orchestrator's single
    /// cooperative tick loop never blocks waiting on a new connection.
    pub fn poll_accept(&mut self) {
        use std::task::{Context, Poll};
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        if let Poll::Ready(Ok((stream, peer))) = self.listener.poll_accept(&mut cx) {
            crate::logging::tlog_info!("[{}] client connected: {}", self.name, peer);
            self.stream = Some(stream);
        }
    }
}

fn noop_waker() -> std::task::Waker {
    use std::task::{RawWaker, RawWakerVTable, Waker};
    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

#[async_trait]
impl Transport for TcpServerTransport {
    async fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        self.poll_accept();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };
        match stream.try_read(buf) {
            Ok(0) => {
                crate::logging::tlog_info!("[{}] client disconnected", self.name);
                self.stream = None;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.stream = None;
                Err(e.into())
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        use tokio::io::AsyncWriteExt;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        if let Err(e) = stream.write_all(data).await {
            crate::logging::tlog_warn!("[{}] write failed: {}", self.name, e);
            self.stream = None;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
