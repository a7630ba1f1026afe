//! TCP link to the hub.
//!
//! The socket is split and owned by two tasks:
//! - the reader frames replies with [`LinesCodec`] and forwards them as
//!   [`LinkEvent::Line`]
//! - the writer drains an mpsc channel of command lines
//!
//! Whichever task sees the socket fail first reports one
//! [`LinkEvent::Closed`]. The event loop owns the receiving end, so all
//! dispatching stays on its thread.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::dispatcher::Transport;
use crate::error::TransportError;

/// Something that happened on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Line(String),
    Closed(String),
}

/// Connected hub link; dropping it closes the socket.
pub struct HubLink {
    addr: String,
    tx: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl HubLink {
    /// Connect and start the reader and writer tasks.
    pub async fn connect(
        addr: &str,
        max_line_len: usize,
    ) -> Result<(HubLink, mpsc::UnboundedReceiver<LinkEvent>)> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to hub at {}", addr))?;
        stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
        info!("Connected to hub at {}", addr);

        let (read_half, write_half) = stream.into_split();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<LinkEvent>();
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let mut reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_line_len));
        let mut writer = FramedWrite::new(write_half, LinesCodec::new());

        {
            let events = event_tx.clone();
            let connected = connected.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let reason = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break "closed locally".to_string(),
                        next = reader.next() => match next {
                            Some(Ok(line)) => {
                                trace!("hub -> {}", line);
                                if events.send(LinkEvent::Line(line)).is_err() {
                                    break "event receiver dropped".to_string();
                                }
                            }
                            Some(Err(e)) => break format!("read failed: {}", e),
                            None => break "hub closed the connection".to_string(),
                        },
                    }
                };
                report_closed(&connected, &events, reason);
            });
        }

        {
            let events = event_tx;
            let connected = connected.clone();
            let cancel = cancel.clone();
            let mut line_rx = line_rx;
            tokio::spawn(async move {
                let reason = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break "closed locally".to_string(),
                        line = line_rx.recv() => match line {
                            Some(line) => {
                                if let Err(e) = writer.send(line.trim_end_matches(['\r', '\n'])).await {
                                    break format!("write failed: {}", e);
                                }
                            }
                            None => break "link dropped".to_string(),
                        },
                    }
                };
                report_closed(&connected, &events, reason);
            });
        }

        Ok((
            HubLink {
                addr: addr.to_string(),
                tx: line_tx,
                connected,
                cancel,
            },
            event_rx,
        ))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Stop both tasks. A `Closed` event follows unless the link already
    /// failed.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Transport for HubLink {
    fn send_line(&self, line: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        trace!("hub <- {}", line.trim_end());
        self.tx
            .send(line.to_string())
            .map_err(|_| TransportError::Closed("writer task stopped".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for HubLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn report_closed(
    connected: &AtomicBool,
    events: &mpsc::UnboundedSender<LinkEvent>,
    reason: String,
) {
    if connected.swap(false, Ordering::AcqRel) {
        debug!("Hub link closed: {}", reason);
        let _ = events.send(LinkEvent::Closed(reason));
    }
}

/// Reconnect delay for the given attempt: zero, then `initial` doubling up
/// to `max`.
pub fn backoff_for_attempt(initial: Duration, max: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
    std::cmp::min(initial.saturating_mul(multiplier), max)
}

/// In-process transport that records what was sent.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: RefCell<Vec<String>>,
    connected: Cell<bool>,
}

impl MemoryTransport {
    pub fn connected() -> Self {
        Self {
            sent: RefCell::new(Vec::new()),
            connected: Cell::new(true),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.set(connected);
    }

    /// Lines sent so far, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.sent.borrow().clone()
    }

    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }
}

impl Transport for MemoryTransport {
    fn send_line(&self, line: &str) -> Result<(), TransportError> {
        if !self.connected.get() {
            return Err(TransportError::NotConnected);
        }
        self.sent.borrow_mut().push(line.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }
}
