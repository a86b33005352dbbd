//! The ServiceInfo chunk pipes.
//!
//! **Chunk-out** (producer side): a writer supplies logical KVs through
//! [`ServiceInfoWriter::next_service_info`] and streaming
//! [`ServiceInfoWriter::write`]; the paired [`ServiceInfoReader`] hands
//! out MTU-bounded frames. Keys are never split across frames; values
//! are, across successive frames repeating the key. A forced message
//! boundary closes the current frame even when it is not full.
//!
//! The pipe is single-producer/single-consumer. Its buffer is bounded
//! and guarded by one mutex and a single condition variable: a writer
//! that outruns the reader blocks, a reader that outruns the writer
//! blocks (or reports `Pending` through the non-blocking entry point the
//! responder uses).
//!
//! **Chunk-in** (consumer side): [`ChunkIn`] accepts MTU-bounded frames
//! and reassembles one byte stream per logical KV, in producer order.
//! Continuation is signalled by key repetition in consecutive KVs.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use fdo_cbor::canonical::head_len;

use crate::{Result, ServiceInfoError};

/// One `[key, value]` pair inside a ServiceInfo frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kv {
    /// `module:message` key.
    pub key: String,
    /// Value chunk bytes.
    pub value: ByteBuf,
}

impl Kv {
    /// Construct a KV pair.
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value: ByteBuf::from(value),
        }
    }
}

/// A frame: the KVs carried by one ServiceInfo message.
pub type Frame = Vec<Kv>;

/// Encoded length of a frame as it will appear inside the message body.
pub fn frame_encoded_len(frame: &Frame) -> Result<usize> {
    Ok(fdo_cbor::to_vec(frame)?.len())
}

/// Outcome of a frame read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A frame ready to send.
    Frame(Frame),
    /// Nothing buffered yet and the writer is still open (non-blocking
    /// reads only).
    Pending,
    /// The writer closed and everything has been drained.
    Ended,
}

/// Maximum KVs per frame, keeping the outer array head at one byte.
const MAX_KVS_PER_FRAME: usize = 23;

/// Minimum value budget per the chunking rule: with less than this many
/// bytes left after overhead, the frame is closed (or, if empty,
/// `SizeTooSmall` is returned).
const MIN_VALUE_BUDGET: usize = 24;

enum Item {
    Kv {
        key: String,
        data: Vec<u8>,
        emitted: usize,
    },
    Boundary,
}

struct PipeState {
    queue: VecDeque<Item>,
    buffered: usize,
    writer_closed: bool,
    reader_closed: bool,
}

struct Shared {
    state: Mutex<PipeState>,
    cond: Condvar,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Create a chunk-out pipe with the given buffer capacity in bytes.
pub fn chunk_out(capacity: usize) -> (ServiceInfoWriter, ServiceInfoReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState {
            queue: VecDeque::new(),
            buffered: 0,
            writer_closed: false,
            reader_closed: false,
        }),
        cond: Condvar::new(),
        capacity: capacity.max(1),
    });
    (
        ServiceInfoWriter {
            shared: Arc::clone(&shared),
        },
        ServiceInfoReader { shared },
    )
}

/// Producer half of the chunk-out pipe.
pub struct ServiceInfoWriter {
    shared: Arc<Shared>,
}

impl ServiceInfoWriter {
    /// Start a new logical KV for `module:message`.
    pub fn next_service_info(&mut self, module: &str, message: &str) -> Result<()> {
        let mut state = self.shared.lock();
        if state.reader_closed {
            return Err(ServiceInfoError::Closed);
        }
        state.queue.push_back(Item::Kv {
            key: format!("{module}:{message}"),
            data: Vec::new(),
            emitted: 0,
        });
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Append value bytes to the current logical KV, blocking while the
    /// buffer is full.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.shared.lock();
        while state.buffered >= self.shared.capacity && !state.reader_closed {
            state = match self.shared.cond.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        if state.reader_closed {
            return Err(ServiceInfoError::Closed);
        }
        match state.queue.back_mut() {
            Some(Item::Kv { data, .. }) => data.extend_from_slice(bytes),
            _ => {
                return Err(ServiceInfoError::Module(
                    "write without next_service_info".into(),
                ))
            }
        }
        state.buffered += bytes.len();
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Convenience: a whole logical KV in one call.
    pub fn write_kv(&mut self, module: &str, message: &str, value: &[u8]) -> Result<()> {
        self.next_service_info(module, message)?;
        self.write(value)
    }

    /// Whether anything written has not yet been drained by the reader.
    pub fn has_pending(&self) -> bool {
        !self.shared.lock().queue.is_empty()
    }

    /// Close the current MTU frame even if it is not full, so the next
    /// logical KV starts on a fresh frame.
    pub fn force_new_message(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.reader_closed {
            return Err(ServiceInfoError::Closed);
        }
        state.queue.push_back(Item::Boundary);
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Finish the stream. Buffered data remains readable.
    pub fn close(self) {
        // Drop runs the close.
    }
}

impl Drop for ServiceInfoWriter {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.writer_closed = true;
        self.shared.cond.notify_all();
    }
}

/// Consumer half of the chunk-out pipe.
pub struct ServiceInfoReader {
    shared: Arc<Shared>,
}

impl ServiceInfoReader {
    /// Read the next frame, blocking until data is available or the
    /// writer closes.
    pub fn read_frame(&mut self, mtu: usize) -> Result<ReadOutcome> {
        self.read_inner(mtu, true)
    }

    /// Read the next frame without blocking; returns
    /// [`ReadOutcome::Pending`] when the writer is open but nothing is
    /// buffered.
    pub fn try_read_frame(&mut self, mtu: usize) -> Result<ReadOutcome> {
        self.read_inner(mtu, false)
    }

    /// Whether more frames may follow (data buffered or writer still
    /// open).
    pub fn has_more(&self) -> bool {
        let state = self.shared.lock();
        !(state.queue.is_empty() && state.writer_closed)
    }

    fn read_inner(&mut self, mtu: usize, block: bool) -> Result<ReadOutcome> {
        let mut state = self.shared.lock();
        let mut frame: Frame = Vec::new();
        // One byte for the outer array head; MAX_KVS_PER_FRAME keeps
        // that exact.
        let mut used = 1usize;

        loop {
            let queue_len = state.queue.len();
            let writer_closed = state.writer_closed;

            // Inspect (and for a chunk emission, advance) the front item
            // inside a bounded borrow, then act on the queue afterwards.
            let step = match state.queue.front_mut() {
                None => Step::Empty,
                Some(Item::Boundary) => Step::Boundary,
                Some(Item::Kv { key, data, emitted }) => {
                    // The writer only appends to the back item, so the
                    // front item is complete once it is not alone or the
                    // writer closed.
                    let done = queue_len > 1 || writer_closed;
                    let pending = data.len() - *emitted;
                    let key_len = head_len(key.len() as u64) + key.len();

                    if pending == 0 {
                        if !done {
                            Step::WaitMore
                        } else if *emitted > 0 {
                            Step::Pop { emit_empty: None, used_add: 0 }
                        } else {
                            // Empty-value logical KV: 1 (kv array head)
                            // + key + 1 (empty bstr head).
                            let kv_overhead = 1 + key_len + 1;
                            if used + kv_overhead > mtu {
                                Step::OutOfBudget
                            } else {
                                Step::Pop {
                                    emit_empty: Some(key.clone()),
                                    used_add: kv_overhead,
                                }
                            }
                        }
                    } else {
                        let avail = mtu.saturating_sub(used + 1 + key_len);
                        if avail < MIN_VALUE_BUDGET {
                            Step::OutOfBudget
                        } else {
                            let chunk_len = max_chunk(avail).min(pending);
                            let chunk = data[*emitted..*emitted + chunk_len].to_vec();
                            *emitted += chunk_len;
                            let used_add = 1 + key_len + head_len(chunk_len as u64) + chunk_len;
                            Step::Emit {
                                key: key.clone(),
                                chunk,
                                used_add,
                            }
                        }
                    }
                }
            };

            match step {
                Step::Empty => {
                    if writer_closed {
                        return if frame.is_empty() {
                            Ok(ReadOutcome::Ended)
                        } else {
                            Ok(ReadOutcome::Frame(frame))
                        };
                    }
                    if !frame.is_empty() {
                        return Ok(ReadOutcome::Frame(frame));
                    }
                    if !block {
                        return Ok(ReadOutcome::Pending);
                    }
                    state = match self.shared.cond.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                Step::Boundary => {
                    state.queue.pop_front();
                    if !frame.is_empty() {
                        return Ok(ReadOutcome::Frame(frame));
                    }
                }
                Step::WaitMore => {
                    if !frame.is_empty() {
                        return Ok(ReadOutcome::Frame(frame));
                    }
                    if !block {
                        return Ok(ReadOutcome::Pending);
                    }
                    state = match self.shared.cond.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                Step::Pop { emit_empty, used_add } => {
                    if let Some(key) = emit_empty {
                        frame.push(Kv::new(key, Vec::new()));
                        used += used_add;
                    }
                    state.queue.pop_front();
                    if frame.len() >= MAX_KVS_PER_FRAME {
                        return Ok(ReadOutcome::Frame(frame));
                    }
                }
                Step::Emit { key, chunk, used_add } => {
                    let len = chunk.len();
                    frame.push(Kv::new(key, chunk));
                    used += used_add;
                    state.buffered -= len;
                    self.shared.cond.notify_all();
                    if frame.len() >= MAX_KVS_PER_FRAME {
                        return Ok(ReadOutcome::Frame(frame));
                    }
                }
                Step::OutOfBudget => {
                    if frame.is_empty() {
                        return Err(ServiceInfoError::SizeTooSmall);
                    }
                    return Ok(ReadOutcome::Frame(frame));
                }
            }
        }
    }
}

impl Drop for ServiceInfoReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.reader_closed = true;
        self.shared.cond.notify_all();
    }
}

enum Step {
    Empty,
    Boundary,
    WaitMore,
    Pop {
        emit_empty: Option<String>,
        used_add: usize,
    },
    Emit {
        key: String,
        chunk: Vec<u8>,
        used_add: usize,
    },
    OutOfBudget,
}

/// Largest value chunk whose head plus body fit in `avail` bytes,
/// bounded by the two-byte length-prefix limit.
fn max_chunk(avail: usize) -> usize {
    let short = avail.saturating_sub(1).min(23);
    let mid = avail.saturating_sub(2).min(255);
    let long = avail.saturating_sub(3).min(65535);
    short.max(mid).max(long)
}

/// Frame reassembler (device-side consumer in the original design; the
/// owner responder uses it to reassemble DeviceServiceInfo). Held in
/// session state between requests, so it is plain serializable data.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChunkIn {
    partial: Option<Kv>,
    complete: VecDeque<Kv>,
}

impl ChunkIn {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one frame's KVs.
    pub fn push_frame(&mut self, kvs: &[Kv]) {
        for kv in kvs {
            match &mut self.partial {
                Some(current) if current.key == kv.key => {
                    current.value.extend_from_slice(&kv.value);
                }
                Some(current) => {
                    let finished = std::mem::replace(
                        current,
                        Kv::new(kv.key.clone(), kv.value.to_vec()),
                    );
                    self.complete.push_back(finished);
                }
                None => {
                    self.partial = Some(Kv::new(kv.key.clone(), kv.value.to_vec()));
                }
            }
        }
    }

    /// Signal end of stream: the trailing partial KV becomes complete.
    pub fn finish(&mut self) {
        if let Some(kv) = self.partial.take() {
            self.complete.push_back(kv);
        }
    }

    /// Next complete logical KV, in producer order.
    pub fn next_complete(&mut self) -> Option<Kv> {
        self.complete.pop_front()
    }
}
