//! Owner-side FSIM modules.
//!
//! Each module is a stateless object paired with an explicit,
//! serializable [`ModuleCursor`] kept in the session between requests —
//! no hidden coroutine state, so a protocol run never depends on
//! process-lifetime objects. The TO2 responder polls the active module
//! for its next messages, routes device replies back through
//! [`OwnerModule::receive`], and closes every cursor after Done2.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha384};
use tracing::debug;

use crate::pipe::ServiceInfoWriter;
use crate::{Result, ServiceInfoError};

/// Progress report from a module poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleStep {
    /// The module has more to send.
    Continue,
    /// The module has sent everything.
    Done,
}

/// Module-defined cursor state, CBOR inside.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModuleCursor {
    /// Serialized module state.
    pub state: ByteBuf,
}

impl ModuleCursor {
    fn load<T: serde::de::DeserializeOwned + Default>(&self) -> Result<T> {
        if self.state.is_empty() {
            Ok(T::default())
        } else {
            Ok(fdo_cbor::from_slice(&self.state)?)
        }
    }

    fn store<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.state = ByteBuf::from(fdo_cbor::to_vec(value)?);
        Ok(())
    }
}

/// An owner ServiceInfo module.
pub trait OwnerModule: Send + Sync {
    /// Module name as it appears in keys (e.g. `fdo.download`).
    fn name(&self) -> &str;

    /// Produce the next message: at most one logical KV per call, its
    /// value no larger than `budget` bytes, so the responder can bound
    /// every outgoing frame to one MTU. Report whether more remain.
    fn poll(
        &self,
        cursor: &mut ModuleCursor,
        writer: &mut ServiceInfoWriter,
        budget: usize,
    ) -> Result<ModuleStep>;

    /// Accept a device message addressed to this module.
    fn receive(&self, cursor: &mut ModuleCursor, message: &str, value: &[u8]) -> Result<()>;

    /// Release resources at the end of the run. Default: nothing.
    fn close(&self, cursor: &mut ModuleCursor) {
        let _ = cursor;
    }
}

/// `fdo.download`: push one file to the device.
///
/// Preamble (`active`, `name`, `length`, `sha-384`), then `data` chunks,
/// then `done` with the total length. The device acks with `done`
/// carrying the byte count it received.
pub struct DownloadModule {
    filename: String,
    payload: Vec<u8>,
}

/// Cursor state for [`DownloadModule`]. `step` walks the preamble
/// (active, name, length, sha-384), then data, then the final done
/// message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct DownloadState {
    step: u32,
    offset: u64,
    acked: Option<u64>,
}

const STEP_ACTIVE: u32 = 0;
const STEP_NAME: u32 = 1;
const STEP_LENGTH: u32 = 2;
const STEP_SHA: u32 = 3;
const STEP_DATA: u32 = 4;
const STEP_DONE: u32 = 5;
const STEP_FINISHED: u32 = 6;

impl DownloadModule {
    /// Serve `payload` under `filename`.
    pub fn new(filename: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            payload,
        }
    }
}

/// Module name for downloads.
pub const DOWNLOAD_MODULE: &str = "fdo.download";

impl OwnerModule for DownloadModule {
    fn name(&self) -> &str {
        DOWNLOAD_MODULE
    }

    fn poll(
        &self,
        cursor: &mut ModuleCursor,
        writer: &mut ServiceInfoWriter,
        budget: usize,
    ) -> Result<ModuleStep> {
        let mut state: DownloadState = cursor.load()?;
        match state.step {
            STEP_ACTIVE => {
                writer.write_kv(DOWNLOAD_MODULE, "active", &fdo_cbor::to_vec(&true)?)?;
                state.step = STEP_NAME;
            }
            STEP_NAME => {
                writer.write_kv(DOWNLOAD_MODULE, "name", &fdo_cbor::to_vec(&self.filename)?)?;
                state.step = STEP_LENGTH;
            }
            STEP_LENGTH => {
                writer.write_kv(
                    DOWNLOAD_MODULE,
                    "length",
                    &fdo_cbor::to_vec(&(self.payload.len() as u64))?,
                )?;
                state.step = STEP_SHA;
            }
            STEP_SHA => {
                let digest = Sha384::digest(&self.payload);
                writer.write_kv(
                    DOWNLOAD_MODULE,
                    "sha-384",
                    &fdo_cbor::to_vec(&ByteBuf::from(digest.to_vec()))?,
                )?;
                state.step = if self.payload.is_empty() { STEP_DONE } else { STEP_DATA };
            }
            STEP_DATA => {
                let offset = state.offset as usize;
                // The encoded value wraps the chunk in a byte string;
                // keep head bytes inside the budget.
                let chunk_len = budget.saturating_sub(3).max(1).min(self.payload.len() - offset);
                let chunk = &self.payload[offset..offset + chunk_len];
                writer.write_kv(
                    DOWNLOAD_MODULE,
                    "data",
                    &fdo_cbor::to_vec(&ByteBuf::from(chunk.to_vec()))?,
                )?;
                state.offset += chunk_len as u64;
                if state.offset as usize >= self.payload.len() {
                    state.step = STEP_DONE;
                }
            }
            STEP_DONE => {
                writer.write_kv(
                    DOWNLOAD_MODULE,
                    "done",
                    &fdo_cbor::to_vec(&(self.payload.len() as u64))?,
                )?;
                state.step = STEP_FINISHED;
                debug!(file = %self.filename, bytes = self.payload.len(), "download sent");
            }
            _ => {
                return Ok(ModuleStep::Done);
            }
        }
        cursor.store(&state)?;
        if state.step == STEP_FINISHED {
            Ok(ModuleStep::Done)
        } else {
            Ok(ModuleStep::Continue)
        }
    }

    fn receive(&self, cursor: &mut ModuleCursor, message: &str, value: &[u8]) -> Result<()> {
        match message {
            "active" => Ok(()),
            "done" => {
                let mut state: DownloadState = cursor.load()?;
                let received: u64 = fdo_cbor::from_slice(value)?;
                if received != self.payload.len() as u64 {
                    return Err(ServiceInfoError::Module(format!(
                        "device received {received} of {} bytes",
                        self.payload.len()
                    )));
                }
                state.acked = Some(received);
                cursor.store(&state)?;
                debug!(file = %self.filename, "download acknowledged");
                Ok(())
            }
            other => Err(ServiceInfoError::Module(format!(
                "unexpected download message {other:?}"
            ))),
        }
    }
}

impl DownloadModule {
    /// Whether the device acknowledged the complete payload.
    pub fn is_acked(&self, cursor: &ModuleCursor) -> bool {
        cursor
            .load::<DownloadState>()
            .map(|s| s.acked == Some(self.payload.len() as u64))
            .unwrap_or(false)
    }
}

/// Close every module cursor at the end of a run.
pub fn cleanup_modules(modules: &[std::sync::Arc<dyn OwnerModule>], cursors: &mut [ModuleCursor]) {
    for (module, cursor) in modules.iter().zip(cursors.iter_mut()) {
        module.close(cursor);
    }
}
