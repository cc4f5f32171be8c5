/// Background draining of child output streams into line queues
use crate::types::{ReadResult, Result, StreamItem, StreamKind};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::thread;
use std::time::Duration;

/// Ordered, unbounded queue of lines from one stream of one run
///
/// Once the queue is dropped its monitor stops at the next line it reads
/// and never queues an end marker.
pub struct OutputQueue {
    sender: Sender<StreamItem>,
    receiver: Receiver<StreamItem>,
}

impl OutputQueue {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    /// Producer handle for a monitor
    pub fn sender(&self) -> Sender<StreamItem> {
        self.sender.clone()
    }

    /// Pop one item, waiting at most `timeout`
    pub fn pop(&self, timeout: Duration) -> ReadResult {
        if timeout.is_zero() {
            return match self.receiver.try_recv() {
                Ok(item) => item.into(),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => ReadResult::Timeout,
            };
        }

        match self.receiver.recv_timeout(timeout) {
            Ok(item) => item.into(),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                ReadResult::Timeout
            }
        }
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread draining one output stream of a running command
pub struct StreamMonitor {
    kind: StreamKind,
    handle: thread::JoinHandle<()>,
}

impl StreamMonitor {
    /// Start draining `source` into `queue`
    pub fn spawn<R>(kind: StreamKind, source: R, queue: Sender<StreamItem>) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("jailbox-{}", kind))
            .spawn(move || monitor_stream(kind, source, queue))?;
        Ok(Self { kind, handle })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// True once the end marker has been queued
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the stream to close
    pub fn join(self) {
        if let Err(e) = self.handle.join() {
            log::error!("{} monitor panicked: {:?}", self.kind, e);
        }
    }
}

/// Read lines until the stream closes, then queue exactly one end marker
pub fn monitor_stream<R: Read>(kind: StreamKind, source: R, queue: Sender<StreamItem>) {
    let mut reader = BufReader::new(source);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                if queue.send(StreamItem::Line(strip_line_ending(&buffer))).is_err() {
                    log::debug!("{} queue dropped, stopping monitor", kind);
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("Error reading {}: {}", kind, e);
                break;
            }
        }
    }

    log::debug!("{} closed", kind);
    let _ = queue.send(StreamItem::EndOfStream);
}

/// Drop every trailing `\r` and `\n`
fn strip_line_ending(bytes: &[u8]) -> String {
    let mut end = bytes.len();
    while end > 0 && matches!(bytes[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
