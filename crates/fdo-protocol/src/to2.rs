//! TO2 responder (device ↔ owner, messages 60–71).
//!
//! Four stages:
//!
//! 1. **Hello and proof of voucher** (60/61): suite negotiation, owner
//!    signature over the voucher header, key-exchange party-A message.
//! 2. **Voucher replay** (62/63): the device pulls each entry, strictly
//!    sequentially, and validates the chain locally.
//! 3. **Setup** (64/65): device proof, shared-secret derivation, and
//!    the signed replacement credentials.
//! 4. **Encrypted ServiceInfo** (66–71): everything from
//!    DeviceServiceInfoReady onward travels through the SEK/SVK tunnel.
//!    The device streams devmod, the owner streams its modules, and the
//!    run ends with the Done/Done2 nonce echoes and the voucher
//!    replaced.
//!
//! Tie-breaks: the owner picks the first suite it supports in the
//! device's preference order; any error inside the encrypted phase
//! surfaces as a plaintext ErrorMsg with no decryption detail.

use ciborium::value::Value;
use serde_bytes::ByteBuf;
use tracing::{debug, info, warn};

use fdo_cbor::RawCbor;
use fdo_cose::{encrypt0, Sign1, SignKey, VerifyKey};
use fdo_crypto::cipher::{CipherSuite, CtrState};
use fdo_crypto::hash::hash;
use fdo_crypto::kdf::derive_session_keys;
use fdo_crypto::kex::OwnerKex;
use fdo_serviceinfo::{chunk_out, cleanup_modules, Kv, ModuleCursor, ModuleStep, ReadOutcome};
use fdo_types::{Guid, KeyEncoding, Nonce, PROTOCOL_VERSION};
use fdo_voucher::{OvHeader, OwnershipVoucher};

use crate::context::{ServerContext, To2Config};
use crate::dispatch::Outcome;
use crate::messages::{
    parse_kex_offer, DeviceServiceInfo, DeviceServiceInfoReady, GetOvNextEntry, HelloDevice,
    OvNextEntry, OwnerServiceInfo, OwnerServiceInfoReady, ProveDevice, ProveDevicePayload,
    ProveOvHdr, ProveOvHdrPayload, SetupDevice, SetupDevicePayload, To2Done, To2Done2, CUPH_NONCE,
    CUPH_OWNER_PUBKEY, MSG_TO2_DEVICE_SERVICE_INFO, MSG_TO2_DEVICE_SERVICE_INFO_READY,
    MSG_TO2_DONE, MSG_TO2_DONE2, MSG_TO2_GET_OV_NEXT_ENTRY, MSG_TO2_HELLO_DEVICE,
    MSG_TO2_OV_NEXT_ENTRY, MSG_TO2_OWNER_SERVICE_INFO, MSG_TO2_OWNER_SERVICE_INFO_READY,
    MSG_TO2_PROVE_DEVICE, MSG_TO2_PROVE_OV_HDR, MSG_TO2_SETUP_DEVICE,
};
use crate::session::{Phase, Session};
use crate::{ProtocolError, Result};

/// Bytes reserved per message for the Encrypt0 (and Mac0) wrapper when
/// budgeting plaintext ServiceInfo frames against the negotiated MTU.
pub fn tunnel_overhead(cipher: CipherSuite) -> usize {
    if cipher.is_ae() {
        48
    } else {
        128
    }
}

pub(crate) fn handle(
    ctx: &ServerContext,
    session: &mut Session,
    msg_type: u8,
    body: &[u8],
) -> Result<Outcome> {
    match msg_type {
        MSG_TO2_HELLO_DEVICE => hello_device(ctx, session, body),
        MSG_TO2_GET_OV_NEXT_ENTRY => get_ov_next_entry(ctx, session, body),
        MSG_TO2_PROVE_DEVICE => prove_device(ctx, session, body),
        MSG_TO2_DEVICE_SERVICE_INFO_READY => device_service_info_ready(ctx, session, body),
        MSG_TO2_DEVICE_SERVICE_INFO => device_service_info(ctx, session, body),
        MSG_TO2_DONE => done(ctx, session, body),
        other => Err(ProtocolError::InvalidMessage(format!(
            "unexpected TO2 message {other}"
        ))),
    }
}

fn load_voucher(ctx: &ServerContext, guid: &Guid) -> Result<OwnershipVoucher> {
    let bytes = ctx.vouchers.get(guid)?;
    Ok(OwnershipVoucher::parse(&bytes)?)
}

fn owner_rsa_key(key: &SignKey) -> Option<&rsa::RsaPrivateKey> {
    match key {
        SignKey::RsaPkcs(k) | SignKey::RsaPss(k) => Some(k),
        _ => None,
    }
}

fn hello_device(ctx: &ServerContext, session: &mut Session, body: &[u8]) -> Result<Outcome> {
    let to2 = ctx.require_to2()?;
    let msg: HelloDevice = fdo_cbor::from_slice(body)?;

    let voucher = load_voucher(ctx, &msg.guid)?;
    let tail_pk = voucher.validate_chain(ctx.keys.mfg_trust_roots.as_deref())?;
    if voucher.num_entries() == 0 {
        return Err(ProtocolError::InvalidMessage(
            "voucher must carry at least one ownership entry for onboarding".into(),
        ));
    }
    let owner_key = ctx.keys.require_owner()?;
    let owner_pk = owner_key.public_key(tail_pk.enc)?;
    if owner_pk != tail_pk {
        return Err(ProtocolError::InvalidMessage(
            "configured owner key does not match the voucher tail".into(),
        ));
    }

    // First mutually supported suite in the device's preference order;
    // unimplemented registry entries are refused, never substituted.
    let owner_has_rsa = owner_rsa_key(owner_key).is_some();
    let kex_suite = parse_kex_offer(&msg.kex_suites)
        .into_iter()
        .find(|s| {
            s.implemented()
                && (owner_has_rsa
                    || !matches!(
                        s,
                        fdo_crypto::kex::KexSuite::Asymkex2048 | fdo_crypto::kex::KexSuite::Asymkex3072
                    ))
        })
        .ok_or_else(|| ProtocolError::MessageBody("no mutually supported key-exchange suite".into()))?;
    let cipher = msg
        .cipher_suites
        .iter()
        .filter_map(|v| CipherSuite::from_i64(*v))
        .find(CipherSuite::implemented)
        .ok_or_else(|| ProtocolError::MessageBody("no mutually supported cipher suite".into()))?;

    let (kex_state, xa) = OwnerKex::begin(kex_suite)?;
    let nonce_prove_dv = Nonce::generate();
    let alg = voucher.hash_alg();

    let payload = ProveOvHdrPayload {
        header: RawCbor::new(voucher.header_bytes().to_vec()),
        num_entries: voucher.num_entries() as u16,
        hmac: voucher.header_hmac().clone(),
        nonce_prove_ov: msg.nonce_prove_ov,
        sig_info: msg.sig_info,
        xa_kex: ByteBuf::from(xa),
        hello_hash: hash(alg, body),
        max_owner_message_size: to2.max_message_size,
    };
    let sign1 = Sign1::create(
        fdo_cbor::canonical_to_vec(&payload)?,
        owner_key,
        vec![
            (CUPH_NONCE, Value::Bytes(nonce_prove_dv.as_bytes().to_vec())),
            (CUPH_OWNER_PUBKEY, Value::Bytes(fdo_cbor::to_vec(&owner_pk)?)),
        ],
        b"",
    )?;

    session.guid = Some(msg.guid);
    session.nonce_prove_ov = Some(msg.nonce_prove_ov);
    session.nonce_prove_dv = Some(nonce_prove_dv);
    session.kex = Some(kex_state);
    session.cipher = Some(cipher);
    session.num_entries = voucher.num_entries() as u16;
    session.max_device_message_size = msg.max_device_message_size;
    session.phase = Phase::To2Entries;

    info!(guid = %msg.guid, kex = %kex_suite, cipher = ?cipher, "TO2 started");
    Ok(Outcome {
        msg_type: MSG_TO2_PROVE_OV_HDR,
        body: fdo_cbor::to_vec(&ProveOvHdr {
            sign1: RawCbor::new(sign1.into_bytes()),
        })?,
        done: false,
    })
}

fn get_ov_next_entry(ctx: &ServerContext, session: &mut Session, body: &[u8]) -> Result<Outcome> {
    session.expect_phase(Phase::To2Entries, MSG_TO2_GET_OV_NEXT_ENTRY)?;
    let msg: GetOvNextEntry = fdo_cbor::from_slice(body)?;
    if msg.entry_num != session.next_entry || msg.entry_num >= session.num_entries {
        return Err(ProtocolError::InvalidMessage(format!(
            "entry {} requested out of order",
            msg.entry_num
        )));
    }

    let voucher = load_voucher(ctx, &session.require_guid()?)?;
    let entry = voucher
        .entry(msg.entry_num as usize)
        .ok_or_else(|| ProtocolError::Internal("voucher shrank during replay".into()))?
        .clone();
    session.next_entry += 1;

    Ok(Outcome {
        msg_type: MSG_TO2_OV_NEXT_ENTRY,
        body: fdo_cbor::to_vec(&OvNextEntry {
            entry_num: msg.entry_num,
            entry,
        })?,
        done: false,
    })
}

fn prove_device(ctx: &ServerContext, session: &mut Session, body: &[u8]) -> Result<Outcome> {
    session.expect_phase(Phase::To2Entries, MSG_TO2_PROVE_DEVICE)?;
    if session.next_entry != session.num_entries {
        return Err(ProtocolError::InvalidMessage(
            "voucher replay incomplete before ProveDevice".into(),
        ));
    }
    let to2 = ctx.require_to2()?;
    let msg: ProveDevice = fdo_cbor::from_slice(body)?;
    let guid = session.require_guid()?;
    let voucher = load_voucher(ctx, &guid)?;
    let header = voucher.header()?;

    let chain = voucher.cert_chain().ok_or_else(|| {
        ProtocolError::InvalidMessage("voucher has no device certificate chain".into())
    })?;
    let verifier = VerifyKey::from_cert_chain_leaf(chain)?;
    let sign1 = Sign1::from_bytes(msg.sign1.as_slice())?;
    let payload_bytes = sign1.verify(&verifier, b"")?;
    let payload: ProveDevicePayload = fdo_cbor::from_slice(payload_bytes)?;

    let expected = session
        .nonce_prove_dv
        .ok_or_else(|| ProtocolError::Internal("TO2 session lost its nonce".into()))?;
    if payload.nonce_prove_dv != expected {
        return Err(ProtocolError::InvalidMessage("ProveDevice nonce mismatch".into()));
    }
    let nonce_setup_dv = match sign1.unprotected_value(CUPH_NONCE) {
        Some(Value::Bytes(bytes)) => Nonce::from_slice(bytes)
            .map_err(|_| ProtocolError::InvalidMessage("malformed SetupDevice nonce".into()))?,
        _ => {
            return Err(ProtocolError::InvalidMessage(
                "ProveDevice missing SetupDevice nonce".into(),
            ))
        }
    };

    // Derive the session secrets.
    let kex_state = session
        .kex
        .take()
        .ok_or_else(|| ProtocolError::Internal("TO2 session lost its key exchange".into()))?;
    let cipher = session
        .cipher
        .ok_or_else(|| ProtocolError::Internal("TO2 session lost its cipher suite".into()))?;
    let owner_key = ctx.keys.require_owner()?;
    let shared = kex_state.finish(&payload.xb_kex, owner_rsa_key(owner_key))?;
    session.session_keys = Some(derive_session_keys(kex_state.suite, cipher, &shared)?);
    if cipher.uses_ctr_state() {
        session.ctr_out = Some(CtrState::generate());
    }

    // Replacement credentials.
    let replacement_guid = if to2.reuse_credential {
        guid
    } else {
        Guid::generate()
    };
    let owner2 = ctx.keys.owner2()?;
    let owner2_pk = owner2.public_key(KeyEncoding::X509)?;
    let rv_info = to2
        .replacement_rv_info
        .clone()
        .unwrap_or_else(|| header.rv_info.clone());

    let replacement_header = OvHeader {
        prot_ver: PROTOCOL_VERSION,
        guid: replacement_guid,
        rv_info: rv_info.clone(),
        device_info: header.device_info.clone(),
        mfg_pubkey: owner2_pk.clone(),
        cert_chain_hash: header.cert_chain_hash.clone(),
    };
    session.replacement_header = Some(RawCbor::from_serialize(&replacement_header)?);
    session.replacement_guid = Some(replacement_guid);
    session.nonce_setup_dv = Some(nonce_setup_dv);
    session.module_cursors = vec![ModuleCursor::default(); to2.modules.len()];
    session.phase = Phase::To2ServiceInfoReady;

    let setup_payload = SetupDevicePayload {
        rv_info,
        guid: replacement_guid,
        nonce_setup_dv,
        owner2_pk,
    };
    let setup_sign1 = Sign1::create(fdo_cbor::canonical_to_vec(&setup_payload)?, owner2, vec![], b"")?;

    debug!(guid = %guid, replacement = %replacement_guid, "device proven, tunnel keys derived");
    Ok(Outcome {
        msg_type: MSG_TO2_SETUP_DEVICE,
        body: fdo_cbor::to_vec(&SetupDevice {
            sign1: RawCbor::new(setup_sign1.into_bytes()),
        })?,
        done: false,
    })
}

fn open_tunnel(session: &mut Session, body: &[u8]) -> Result<Vec<u8>> {
    let cipher = session
        .cipher
        .ok_or_else(|| ProtocolError::Internal("tunnel without cipher suite".into()))?;
    let keys = session
        .session_keys
        .as_ref()
        .ok_or_else(|| ProtocolError::Internal("tunnel without session keys".into()))?;
    Ok(encrypt0::open(cipher, keys, body, b"")?)
}

fn seal_tunnel(session: &mut Session, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = session
        .cipher
        .ok_or_else(|| ProtocolError::Internal("tunnel without cipher suite".into()))?;
    let Session {
        session_keys,
        ctr_out,
        ..
    } = session;
    let keys = session_keys
        .as_ref()
        .ok_or_else(|| ProtocolError::Internal("tunnel without session keys".into()))?;
    Ok(encrypt0::seal(cipher, keys, ctr_out.as_mut(), plaintext, b"")?)
}

fn device_service_info_ready(
    ctx: &ServerContext,
    session: &mut Session,
    body: &[u8],
) -> Result<Outcome> {
    session.expect_phase(Phase::To2ServiceInfoReady, MSG_TO2_DEVICE_SERVICE_INFO_READY)?;
    let to2 = ctx.require_to2()?;
    let plaintext = open_tunnel(session, body)?;
    let msg: DeviceServiceInfoReady = fdo_cbor::from_slice(&plaintext)?;

    match (&msg.replacement_hmac, to2.reuse_credential) {
        (Some(hmac), false) => {
            if hmac.alg != hmac.alg.hmac_variant() || hmac.value.len() != hmac.alg.digest_len() {
                return Err(ProtocolError::InvalidMessage("malformed replacement HMAC".into()));
            }
        }
        (None, false) => {
            return Err(ProtocolError::InvalidMessage(
                "replacement HMAC required without credential reuse".into(),
            ))
        }
        (Some(_), true) => {
            return Err(ProtocolError::InvalidMessage(
                "replacement HMAC sent under credential reuse".into(),
            ))
        }
        (None, true) => {}
    }
    session.replacement_hmac = msg.replacement_hmac;
    session.mtu_owner_to_device = msg
        .max_owner_service_info_size
        .unwrap_or(1300)
        .clamp(256, u16::MAX);
    session.phase = Phase::To2ServiceInfo;

    let reply = OwnerServiceInfoReady {
        max_device_service_info_size: Some(to2.max_message_size),
    };
    let sealed = seal_tunnel(session, &fdo_cbor::to_vec(&reply)?)?;
    Ok(Outcome {
        msg_type: MSG_TO2_OWNER_SERVICE_INFO_READY,
        body: sealed,
        done: false,
    })
}

fn device_service_info(ctx: &ServerContext, session: &mut Session, body: &[u8]) -> Result<Outcome> {
    session.expect_phase(Phase::To2ServiceInfo, MSG_TO2_DEVICE_SERVICE_INFO)?;
    let to2 = ctx.require_to2()?;
    let plaintext = open_tunnel(session, body)?;
    let msg: DeviceServiceInfo = fdo_cbor::from_slice(&plaintext)?;

    session.chunk_in.push_frame(&msg.service_info);
    if !msg.is_more {
        session.chunk_in.finish();
    }
    while let Some(kv) = session.chunk_in.next_complete() {
        let (module, message) = kv.key.split_once(':').ok_or_else(|| {
            ProtocolError::InvalidMessage(format!("malformed service info key {:?}", kv.key))
        })?;
        if module == fdo_serviceinfo::devmod::MODULE {
            session.devmod.accept(message, &kv.value)?;
        } else if let Some(index) = to2.modules.iter().position(|m| m.name() == module) {
            to2.modules[index].receive(&mut session.module_cursors[index], message, &kv.value)?;
        } else {
            warn!(module, message, "service info for unconfigured module ignored");
        }
    }

    if !session.devmod_persisted && session.devmod.is_complete() {
        let snapshot = session.devmod.snapshot()?;
        ctx.devmods
            .put_devmod(&session.require_guid()?, &fdo_cbor::to_vec(&snapshot)?)?;
        session.devmod_persisted = true;
        debug!(guid = %session.require_guid()?, modules = snapshot.modules.len(), "devmod recorded");
    }

    let service_info = if msg.is_more {
        // The device wants to keep sending; leave the channel to it.
        Vec::new()
    } else {
        produce_owner_frame(to2, session)?
    };
    let is_done = session.modules_done && !msg.is_more;

    let reply = OwnerServiceInfo {
        is_more: false,
        is_done,
        service_info,
    };
    let sealed = seal_tunnel(session, &fdo_cbor::to_vec(&reply)?)?;
    Ok(Outcome {
        msg_type: MSG_TO2_OWNER_SERVICE_INFO,
        body: sealed,
        done: false,
    })
}

/// Poll the active module for at most one frame's worth of messages.
fn produce_owner_frame(to2: &To2Config, session: &mut Session) -> Result<Vec<Kv>> {
    if session.modules_done || !session.devmod_persisted {
        if !session.devmod_persisted && session.devmod.is_active() {
            debug!("waiting for complete devmod before module streaming");
        }
        if to2.modules.is_empty() || session.modules_done {
            session.modules_done = true;
        }
        return Ok(Vec::new());
    }
    let cipher = session
        .cipher
        .ok_or_else(|| ProtocolError::Internal("tunnel without cipher suite".into()))?;
    let effective = (session.mtu_owner_to_device as usize).saturating_sub(tunnel_overhead(cipher));
    // Reserve key and head overhead out of the per-message value budget.
    let budget = effective.saturating_sub(48).max(32);

    let (mut writer, mut reader) = chunk_out(1 << 16);
    loop {
        if session.active_module >= to2.modules.len() {
            session.modules_done = true;
            break;
        }
        let module = &to2.modules[session.active_module];
        let step = module.poll(
            &mut session.module_cursors[session.active_module],
            &mut writer,
            budget,
        )?;
        if step == ModuleStep::Done {
            session.active_module += 1;
        }
        if writer.has_pending() {
            break;
        }
    }
    writer.close();

    match reader.try_read_frame(effective)? {
        ReadOutcome::Frame(frame) => Ok(frame),
        _ => Ok(Vec::new()),
    }
}

fn done(ctx: &ServerContext, session: &mut Session, body: &[u8]) -> Result<Outcome> {
    session.expect_phase(Phase::To2ServiceInfo, MSG_TO2_DONE)?;
    let to2 = ctx.require_to2()?;
    let plaintext = open_tunnel(session, body)?;
    let msg: To2Done = fdo_cbor::from_slice(&plaintext)?;

    let expected = session
        .nonce_prove_dv
        .ok_or_else(|| ProtocolError::Internal("TO2 session lost its nonce".into()))?;
    if msg.nonce_prove_dv != expected {
        return Err(ProtocolError::InvalidMessage("Done nonce mismatch".into()));
    }
    let nonce_setup_dv = session
        .nonce_setup_dv
        .ok_or_else(|| ProtocolError::Internal("TO2 session lost its setup nonce".into()))?;

    let guid = session.require_guid()?;
    if !to2.reuse_credential {
        let replacement_guid = session
            .replacement_guid
            .ok_or_else(|| ProtocolError::Internal("TO2 session lost its replacement GUID".into()))?;
        let header = session
            .replacement_header
            .take()
            .ok_or_else(|| ProtocolError::Internal("TO2 session lost its replacement header".into()))?;
        let hmac = session
            .replacement_hmac
            .take()
            .ok_or_else(|| ProtocolError::InvalidMessage("device never sent a replacement HMAC".into()))?;

        let original = load_voucher(ctx, &guid)?;
        let replacement =
            OwnershipVoucher::new(header, hmac, original.cert_chain().cloned());
        ctx.vouchers
            .replace(&guid, &replacement_guid, &replacement.to_bytes()?)?;
        info!(old = %guid, new = %replacement_guid, "voucher replaced");
    } else {
        info!(%guid, "credential reused, voucher unchanged");
    }

    cleanup_modules(&to2.modules, &mut session.module_cursors);

    let reply = To2Done2 { nonce_setup_dv };
    let sealed = seal_tunnel(session, &fdo_cbor::to_vec(&reply)?)?;
    Ok(Outcome {
        msg_type: MSG_TO2_DONE2,
        body: sealed,
        done: true,
    })
}
