//! The mandatory `devmod` module.
//!
//! The device enumerates its descriptors (OS, architecture, version, …)
//! and then publishes a paginated `devmod:modules` list whose chunks
//! carry `[start, count, name, …]` sized to the MTU. Emission is
//! data-driven: a static descriptor table replaces the original's
//! reflection walk.
//!
//! The owner side accumulates incoming devmod KVs into a snapshot that
//! is persisted per GUID once TO2 completes.

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use fdo_cbor::canonical::head_len;

use crate::pipe::ServiceInfoWriter;
use crate::{Result, ServiceInfoError};

/// Module name.
pub const MODULE: &str = "devmod";

/// A device's devmod snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Devmod {
    /// Operating system name.
    pub os: String,
    /// CPU architecture.
    pub arch: String,
    /// OS version string.
    pub version: String,
    /// Device model description.
    pub device: String,
    /// Serial number, when the device discloses one.
    pub sn: Option<String>,
    /// Filesystem path separator.
    pub pathsep: String,
    /// File separator.
    pub sep: String,
    /// Newline sequence.
    pub nl: String,
    /// ServiceInfo modules the device supports.
    pub modules: Vec<String>,
}

/// Descriptor table: wire message name, required flag, getter. The
/// serial number is the one optional descriptor.
const DESCRIPTORS: &[(&str, bool, fn(&Devmod) -> Option<Value>)] = &[
    ("os", true, |d| Some(Value::Text(d.os.clone()))),
    ("arch", true, |d| Some(Value::Text(d.arch.clone()))),
    ("version", true, |d| Some(Value::Text(d.version.clone()))),
    ("device", true, |d| Some(Value::Text(d.device.clone()))),
    ("sn", false, |d| d.sn.clone().map(Value::Text)),
    ("pathsep", true, |d| Some(Value::Text(d.pathsep.clone()))),
    ("sep", true, |d| Some(Value::Text(d.sep.clone()))),
    ("nl", true, |d| Some(Value::Text(d.nl.clone()))),
];

impl Devmod {
    /// A plausible Linux device snapshot, for tests and simulators.
    pub fn linux(device: &str, modules: Vec<String>) -> Self {
        Self {
            os: "Linux".into(),
            arch: "x86_64".into(),
            version: "6.1".into(),
            device: device.into(),
            sn: None,
            pathsep: "/".into(),
            sep: ":".into(),
            nl: "\n".into(),
            modules,
        }
    }

    /// Emit the full devmod stream: `active`, the descriptor table, then
    /// the paginated modules list starting on a fresh frame so its chunk
    /// boundaries are predictable.
    pub fn emit(&self, writer: &mut ServiceInfoWriter, mtu: usize) -> Result<()> {
        writer.write_kv(MODULE, "active", &fdo_cbor::to_vec(&true)?)?;
        for (message, required, getter) in DESCRIPTORS {
            match getter(self) {
                Some(value) => {
                    writer.write_kv(MODULE, message, &fdo_cbor::to_vec(&value)?)?;
                }
                None if *required => {
                    return Err(ServiceInfoError::Module(format!(
                        "missing required devmod descriptor {message}"
                    )))
                }
                None => {}
            }
        }
        writer.write_kv(MODULE, "nummodules", &fdo_cbor::to_vec(&(self.modules.len() as u64))?)?;

        for chunk in paginate_modules(&self.modules, mtu)? {
            writer.force_new_message()?;
            writer.write_kv(MODULE, "modules", &chunk)?;
        }
        Ok(())
    }
}

/// Split the modules list into encoded `[start, count, name, …]` chunks
/// whose value encoding fits the MTU's per-KV value budget.
fn paginate_modules(modules: &[String], mtu: usize) -> Result<Vec<Vec<u8>>> {
    let key = format!("{MODULE}:modules");
    let key_len = head_len(key.len() as u64) + key.len();
    // Outer array head + KV head + key + a conservative 3-byte value
    // head.
    let budget = mtu
        .checked_sub(1 + 1 + key_len + 3)
        .ok_or(ServiceInfoError::SizeTooSmall)?;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < modules.len() {
        let mut names = Vec::new();
        // Running size: array head (recomputed), start, count, names.
        let mut end = start;
        while end < modules.len() {
            let candidate_count = names.len() + 1;
            let name = &modules[end];
            let name_len = head_len(name.len() as u64) + name.len();
            let size: usize = head_len((candidate_count + 2) as u64)
                + head_len(start as u64)
                + head_len(candidate_count as u64)
                + names
                    .iter()
                    .map(|n: &&String| head_len(n.len() as u64) + n.len())
                    .sum::<usize>()
                + name_len;
            if size > budget {
                break;
            }
            names.push(name);
            end += 1;
        }
        if names.is_empty() {
            return Err(ServiceInfoError::SizeTooSmall);
        }

        let mut items = vec![
            Value::Integer((start as u64).into()),
            Value::Integer((names.len() as u64).into()),
        ];
        items.extend(names.iter().map(|n| Value::Text((*n).clone())));
        chunks.push(fdo_cbor::to_vec(&Value::Array(items))?);
        start = end;
    }
    Ok(chunks)
}

/// Owner-side accumulator for incoming devmod KVs. Plain serializable
/// data held in the session between requests.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DevmodAccumulator {
    active: bool,
    os: Option<String>,
    arch: Option<String>,
    version: Option<String>,
    device: Option<String>,
    sn: Option<String>,
    pathsep: Option<String>,
    sep: Option<String>,
    nl: Option<String>,
    nummodules: Option<u64>,
    modules: Vec<String>,
}

impl DevmodAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the device has activated devmod.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether every required descriptor has arrived and the modules
    /// list matches the announced count.
    pub fn is_complete(&self) -> bool {
        self.active
            && self.os.is_some()
            && self.arch.is_some()
            && self.version.is_some()
            && self.device.is_some()
            && self.pathsep.is_some()
            && self.sep.is_some()
            && self.nl.is_some()
            && self.nummodules.is_some_and(|n| n == self.modules.len() as u64)
    }

    /// Accept one complete logical devmod KV.
    pub fn accept(&mut self, message: &str, value: &[u8]) -> Result<()> {
        match message {
            "active" => {
                let active: bool = fdo_cbor::from_slice(value)?;
                if !active {
                    return Err(ServiceInfoError::Module("device deactivated devmod".into()));
                }
                self.active = true;
            }
            "os" => self.os = Some(fdo_cbor::from_slice(value)?),
            "arch" => self.arch = Some(fdo_cbor::from_slice(value)?),
            "version" => self.version = Some(fdo_cbor::from_slice(value)?),
            "device" => self.device = Some(fdo_cbor::from_slice(value)?),
            "sn" => self.sn = Some(fdo_cbor::from_slice(value)?),
            "pathsep" => self.pathsep = Some(fdo_cbor::from_slice(value)?),
            "sep" => self.sep = Some(fdo_cbor::from_slice(value)?),
            "nl" => self.nl = Some(fdo_cbor::from_slice(value)?),
            "nummodules" => self.nummodules = Some(fdo_cbor::from_slice(value)?),
            "modules" => self.accept_modules(value)?,
            // Unknown descriptors are ignored, matching how devices may
            // report more than this server tracks.
            _ => {}
        }
        Ok(())
    }

    /// Decode a reassembled modules stream: one or more back-to-back
    /// `[start, count, name, …]` arrays.
    fn accept_modules(&mut self, mut value: &[u8]) -> Result<()> {
        while !value.is_empty() {
            let mut cursor = std::io::Cursor::new(value);
            let chunk: Value = ciborium::from_reader(&mut cursor)
                .map_err(|e| ServiceInfoError::Module(format!("bad modules chunk: {e}")))?;
            let consumed = cursor.position() as usize;
            value = &value[consumed..];

            let items = chunk
                .as_array()
                .ok_or_else(|| ServiceInfoError::Module("modules chunk is not an array".into()))?;
            if items.len() < 2 {
                return Err(ServiceInfoError::Module("modules chunk too short".into()));
            }
            let start = value_as_u64(&items[0])?;
            let count = value_as_u64(&items[1])?;
            if items.len() as u64 != count + 2 {
                return Err(ServiceInfoError::Module("modules chunk count mismatch".into()));
            }
            if start as usize != self.modules.len() {
                return Err(ServiceInfoError::Module("modules chunk out of order".into()));
            }
            for item in &items[2..] {
                let name = item
                    .as_text()
                    .ok_or_else(|| ServiceInfoError::Module("module name is not text".into()))?;
                self.modules.push(name.to_string());
            }
        }
        Ok(())
    }

    /// Produce the final snapshot; fails while required descriptors are
    /// missing.
    pub fn snapshot(&self) -> Result<Devmod> {
        if !self.active {
            return Err(ServiceInfoError::Module("devmod was never activated".into()));
        }
        let require = |field: &Option<String>, name: &str| {
            field
                .clone()
                .ok_or_else(|| ServiceInfoError::Module(format!("missing devmod descriptor {name}")))
        };
        Ok(Devmod {
            os: require(&self.os, "os")?,
            arch: require(&self.arch, "arch")?,
            version: require(&self.version, "version")?,
            device: require(&self.device, "device")?,
            sn: self.sn.clone(),
            pathsep: require(&self.pathsep, "pathsep")?,
            sep: require(&self.sep, "sep")?,
            nl: require(&self.nl, "nl")?,
            modules: self.modules.clone(),
        })
    }
}

fn value_as_u64(value: &Value) -> Result<u64> {
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| ServiceInfoError::Module("expected unsigned integer".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{chunk_out, ChunkIn, ReadOutcome};

    fn module_names(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("fdo.module{i:02}")).collect()
    }

    fn roundtrip(devmod: &Devmod, mtu: usize) -> (DevmodAccumulator, Vec<usize>) {
        let (mut writer, mut reader) = chunk_out(1 << 16);
        devmod.emit(&mut writer, mtu).expect("emit");
        writer.close();

        let mut chunk_in = ChunkIn::new();
        let mut frame_lens = Vec::new();
        loop {
            match reader.read_frame(mtu).expect("read") {
                ReadOutcome::Frame(frame) => {
                    frame_lens.push(crate::pipe::frame_encoded_len(&frame).expect("len"));
                    chunk_in.push_frame(&frame);
                }
                ReadOutcome::Ended => break,
                ReadOutcome::Pending => continue,
            }
        }
        chunk_in.finish();

        let mut acc = DevmodAccumulator::new();
        while let Some(kv) = chunk_in.next_complete() {
            let message = kv.key.strip_prefix("devmod:").expect("devmod key");
            acc.accept(message, &kv.value).expect("accept");
        }
        (acc, frame_lens)
    }

    #[test]
    fn test_devmod_roundtrip() {
        let devmod = Devmod::linux("test-box", module_names(4));
        let (acc, _) = roundtrip(&devmod, 1300);
        let snapshot = acc.snapshot().expect("snapshot");
        assert_eq!(snapshot, devmod);
    }

    #[test]
    fn test_thirty_modules_at_mtu_256() {
        // 30 names averaging 12 bytes at wire MTU 256. The TO2 layer
        // reserves the encrypted-tunnel wrapper from the plaintext
        // budget, so devmod sees roughly 208 bytes per frame; that
        // spreads the list over at least 3 chunks, each within the MTU,
        // names in order.
        let devmod = Devmod::linux("chunky", module_names(30));
        let (acc, frame_lens) = roundtrip(&devmod, 208);

        assert!(frame_lens.len() >= 3, "got {} frames", frame_lens.len());
        for len in frame_lens {
            assert!(len <= 256, "frame of {len} bytes exceeds MTU");
        }
        let snapshot = acc.snapshot().expect("snapshot");
        assert_eq!(snapshot.modules, module_names(30));
    }

    #[test]
    fn test_missing_descriptor_rejected() {
        let mut acc = DevmodAccumulator::new();
        acc.accept("active", &fdo_cbor::to_vec(&true).expect("encode")).expect("accept");
        acc.accept("os", &fdo_cbor::to_vec(&"Linux").expect("encode")).expect("accept");
        assert!(acc.snapshot().is_err());
    }

    #[test]
    fn test_inactive_devmod_rejected() {
        let acc = DevmodAccumulator::new();
        assert!(acc.snapshot().is_err());
        let mut acc = DevmodAccumulator::new();
        assert!(acc.accept("active", &fdo_cbor::to_vec(&false).expect("encode")).is_err());
    }

    #[test]
    fn test_out_of_order_modules_chunk_rejected() {
        let mut acc = DevmodAccumulator::new();
        let chunk = fdo_cbor::to_vec(&Value::Array(vec![
            Value::Integer(5.into()),
            Value::Integer(1.into()),
            Value::Text("fdo.x".into()),
        ]))
        .expect("encode");
        assert!(acc.accept("modules", &chunk).is_err());
    }

    #[test]
    fn test_unknown_descriptor_ignored() {
        let mut acc = DevmodAccumulator::new();
        acc.accept("tmp", &fdo_cbor::to_vec(&"/tmp").expect("encode")).expect("accept");
    }
}
