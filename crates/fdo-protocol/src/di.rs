//! DI responder (Device Initialization, messages 10–13).
//!
//! `AwaitAppStart → AwaitSetHmac → Done`. AppStart carries the device's
//! manufacturing info and attestation CSR; the responder issues the
//! device certificate chain, assembles a voucher header with a fresh
//! GUID, and hands the exact header bytes back for the device to HMAC.
//! SetHMAC completes the voucher (empty entry list), runs the optional
//! pre-persist hook, validates, and stores it.

use tracing::info;

use fdo_cbor::RawCbor;
use fdo_crypto::cert::cert_chain_hash;
use fdo_types::{Guid, KeyEncoding, PROTOCOL_VERSION};
use fdo_voucher::{OvHeader, OwnershipVoucher};

use crate::context::ServerContext;
use crate::dispatch::Outcome;
use crate::messages::{
    AppStart, DiDone, SetCredentials, SetHmac, MSG_DI_APP_START, MSG_DI_DONE,
    MSG_DI_SET_CREDENTIALS, MSG_DI_SET_HMAC,
};
use crate::session::{Phase, Session};
use crate::{ProtocolError, Result};

pub(crate) fn handle(
    ctx: &ServerContext,
    session: &mut Session,
    msg_type: u8,
    body: &[u8],
) -> Result<Outcome> {
    match msg_type {
        MSG_DI_APP_START => app_start(ctx, session, body),
        MSG_DI_SET_HMAC => set_hmac(ctx, session, body),
        other => Err(ProtocolError::InvalidMessage(format!(
            "unexpected DI message {other}"
        ))),
    }
}

fn app_start(ctx: &ServerContext, session: &mut Session, body: &[u8]) -> Result<Outcome> {
    let di = ctx.require_di()?;
    let msg: AppStart = fdo_cbor::from_slice(body)?;
    let info = msg.mfg_info.value();

    let chain = di.ca.sign_device_certificate(&info.csr)?;
    let chain_hash = cert_chain_hash(di.hash_alg, &chain);

    let guid = Guid::generate();
    let header = OvHeader {
        prot_ver: PROTOCOL_VERSION,
        guid,
        rv_info: di.rv_info.clone(),
        device_info: info.device_info.clone(),
        mfg_pubkey: ctx.keys.require_mfg()?.public_key(KeyEncoding::X509)?,
        cert_chain_hash: Some(chain_hash),
    };
    let header_raw = RawCbor::from_serialize(&header)?;

    session.guid = Some(guid);
    session.di_header = Some(header_raw.clone());
    session.di_cert_chain = Some(chain);
    session.phase = Phase::DiSetHmac;

    info!(%guid, serial = %info.serial, "device initialization started");
    Ok(Outcome {
        msg_type: MSG_DI_SET_CREDENTIALS,
        body: fdo_cbor::to_vec(&SetCredentials { header: header_raw })?,
        done: false,
    })
}

fn set_hmac(ctx: &ServerContext, session: &mut Session, body: &[u8]) -> Result<Outcome> {
    session.expect_phase(Phase::DiSetHmac, MSG_DI_SET_HMAC)?;
    let di = ctx.require_di()?;
    let msg: SetHmac = fdo_cbor::from_slice(body)?;
    if msg.hmac.alg != msg.hmac.alg.hmac_variant() {
        return Err(ProtocolError::InvalidMessage(
            "header HMAC must use an HMAC algorithm".into(),
        ));
    }
    if msg.hmac.value.len() != msg.hmac.alg.digest_len() {
        return Err(ProtocolError::InvalidMessage("header HMAC length mismatch".into()));
    }

    let guid = session.require_guid()?;
    let header = session
        .di_header
        .take()
        .ok_or_else(|| ProtocolError::Internal("DI session lost its header".into()))?;
    let chain = session.di_cert_chain.take();

    let mut voucher = OwnershipVoucher::new(header, msg.hmac, chain);
    if let Some(hook) = &di.before_voucher_persist {
        voucher = hook(voucher)?;
    }
    // Nothing reaches the voucher table unvalidated.
    voucher.validate_chain(None)?;
    ctx.vouchers.insert(&guid, &voucher.to_bytes()?)?;

    info!(%guid, entries = voucher.num_entries(), "voucher persisted");
    Ok(Outcome {
        msg_type: MSG_DI_DONE,
        body: fdo_cbor::to_vec(&DiDone {})?,
        done: true,
    })
}
