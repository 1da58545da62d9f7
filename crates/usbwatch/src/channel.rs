//! Bulk transfer channel
//!
//! Turns a polled USB read/write primitive into a buffered,
//! non-blocking channel. A background poll thread attempts one
//! non-blocking read per tick and appends whatever arrived to an
//! inbound buffer; the owner drains the buffer with [`read`] whenever
//! it likes. Writes go straight to the endpoint.
//!
//! [`read`]: TransferChannel::read

use crate::driver::BulkEndpoints;
use crate::error::{Error, Result};
use crate::types::Direction;
use async_channel::{Receiver, Sender, TrySendError, bounded};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default cadence of the background read poll.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default buffer size for a single read attempt.
const DEFAULT_READ_CHUNK: usize = 4096;

/// Notifications emitted by an open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The inbound buffer went from some state to "has new bytes".
    ReadyToRead,
    /// A write transfer completed; carries the accepted byte count.
    WriteComplete(usize),
}

/// How a channel should be opened.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub direction: Direction,
    /// Run the background read poll. Without it, nothing ever lands
    /// in the inbound buffer.
    pub polling: bool,
    pub poll_interval: Duration,
    pub read_chunk: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            direction: Direction::ReadWrite,
            polling: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Closed,
    Opening,
    Open,
}

/// A buffered, non-blocking bulk read/write session over one
/// exclusively owned endpoint pair.
///
/// State machine: `Closed → Opening → Open → Closed`. `read` and
/// `write` are only valid in `Open`; `close` is idempotent and always
/// succeeds from the caller's point of view.
pub struct TransferChannel<E: BulkEndpoints> {
    endpoints: Option<Arc<E>>,
    direction: Direction,
    state: SessionState,
    inbound: Arc<Mutex<VecDeque<u8>>>,
    events: Sender<ChannelEvent>,
    stop: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
}

impl<E: BulkEndpoints> TransferChannel<E> {
    /// Create a closed channel and the receiving end of its
    /// notifications.
    pub fn new() -> (Self, Receiver<ChannelEvent>) {
        let (events, rx) = bounded(256);
        (
            Self {
                endpoints: None,
                direction: Direction::ReadWrite,
                state: SessionState::Closed,
                inbound: Arc::new(Mutex::new(VecDeque::new())),
                events,
                stop: Arc::new(AtomicBool::new(false)),
                poller: None,
            },
            rx,
        )
    }

    /// Take ownership of an opened endpoint pair and move to `Open`.
    ///
    /// Device-unavailable and busy failures happen earlier, when the
    /// driver opens the endpoints; this fails only when the session
    /// itself is already open. Starts the poll worker when requested
    /// and the direction allows reading.
    pub fn open(&mut self, endpoints: E, options: ChannelOptions) -> Result<()> {
        if self.state != SessionState::Closed {
            return Err(Error::InvalidState("session already open"));
        }

        // Fallible work happens before any field is touched, so a
        // rejected open leaves the session exactly as it found it
        let endpoints = Arc::new(endpoints);
        let stop = Arc::new(AtomicBool::new(false));

        let poller = if options.polling && options.direction.can_read() {
            Some(spawn_poller(
                endpoints.clone(),
                self.inbound.clone(),
                self.events.clone(),
                stop.clone(),
                options.poll_interval,
                options.read_chunk,
            )?)
        } else {
            None
        };

        self.state = SessionState::Opening;
        self.direction = options.direction;
        self.stop = stop;
        self.poller = poller;
        self.endpoints = Some(endpoints);
        self.state = SessionState::Open;
        debug!("transfer session opened ({:?})", options.direction);
        Ok(())
    }

    /// Submit bytes to the write endpoint.
    ///
    /// Returns the count the endpoint accepted and emits
    /// [`ChannelEvent::WriteComplete`] once the transfer confirms. No
    /// automatic retry; that policy belongs to the caller.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if self.state != SessionState::Open {
            return Err(Error::InvalidState("session is closed"));
        }
        if !self.direction.can_write() {
            return Err(Error::InvalidState("session not open for writing"));
        }

        let endpoints = self.endpoints.as_ref().ok_or(Error::InvalidState("session is closed"))?;
        let accepted = endpoints.write(data)?;

        if let Err(e) = self.events.try_send(ChannelEvent::WriteComplete(accepted)) {
            warn!("dropping write-complete event: {}", e);
        }
        Ok(accepted)
    }

    /// Drain and return everything buffered so far, in arrival order.
    ///
    /// Never blocks; an empty buffer yields an empty vec, not an
    /// error.
    pub fn read(&self) -> Result<Vec<u8>> {
        if self.state != SessionState::Open {
            return Err(Error::InvalidState("session is closed"));
        }

        let mut inbound = self.inbound.lock().unwrap();
        Ok(inbound.drain(..).collect())
    }

    /// Bytes currently buffered and not yet consumed.
    pub fn bytes_available(&self) -> usize {
        self.inbound.lock().unwrap().len()
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Stop polling, then release the endpoints. Idempotent; cleanup
    /// failures are observability events only.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        // Stop ticking before releasing what the tick reads from
        self.stop.store(true, Ordering::Release);
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                warn!("poll worker panicked during shutdown");
            }
        }

        self.endpoints = None;
        self.state = SessionState::Closed;
        debug!("transfer session closed");
    }
}

impl<E: BulkEndpoints> Drop for TransferChannel<E> {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_poller<E: BulkEndpoints>(
    endpoints: Arc<E>,
    inbound: Arc<Mutex<VecDeque<u8>>>,
    events: Sender<ChannelEvent>,
    stop: Arc<AtomicBool>,
    interval: Duration,
    chunk: usize,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("bulk-poll".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; chunk.max(1)];
            while !stop.load(Ordering::Acquire) {
                match endpoints.try_read(&mut buf) {
                    Ok(0) => {}
                    Ok(len) => {
                        inbound.lock().unwrap().extend(&buf[..len]);
                        trace!("poll tick buffered {} bytes", len);
                        // ReadyToRead is a level signal: a full queue
                        // already holds a pending wake-up for these
                        // bytes. Never block the tick on delivery.
                        match events.try_send(ChannelEvent::ReadyToRead) {
                            Ok(()) | Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Closed(_)) => {
                                trace!("event receiver dropped, still buffering");
                            }
                        }
                    }
                    Err(e) => {
                        // One failed poll never closes the session
                        warn!("bulk read poll failed: {}", e);
                    }
                }
                std::thread::sleep(interval);
            }
        })
        .map_err(|e| Error::Init(format!("failed to spawn poll worker: {}", e)))
}
