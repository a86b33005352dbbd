//! TO0 responder (owner → rendezvous, messages 20–23).
//!
//! Two-round exchange: the rendezvous hands out a nonce, the owner
//! proves possession of the voucher's current owner key by signing the
//! `To1d` blob, and the blob is stored keyed by GUID with an explicit
//! TTL. Verification covers the full voucher chain, the `To1d`
//! signature against the chain's tail key, the `to0d` hash link, and
//! the nonce echo.

use tracing::info;

use fdo_crypto::hash::hash;
use fdo_cose::{x5chain_public_key, Sign1, VerifyKey};
use fdo_store::RvBlob;
use fdo_types::Nonce;
use serde_bytes::ByteBuf;

use crate::context::ServerContext;
use crate::dispatch::Outcome;
use crate::messages::{
    AcceptOwner, OwnerSign, To0HelloAck, To1dPayload, MSG_TO0_ACCEPT_OWNER, MSG_TO0_HELLO,
    MSG_TO0_HELLO_ACK, MSG_TO0_OWNER_SIGN,
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
        MSG_TO0_HELLO => hello(session),
        MSG_TO0_OWNER_SIGN => owner_sign(ctx, session, body),
        other => Err(ProtocolError::InvalidMessage(format!(
            "unexpected TO0 message {other}"
        ))),
    }
}

fn hello(session: &mut Session) -> Result<Outcome> {
    let nonce = Nonce::generate();
    session.nonce_to0_sign = Some(nonce);
    session.phase = Phase::To0OwnerSign;
    Ok(Outcome {
        msg_type: MSG_TO0_HELLO_ACK,
        body: fdo_cbor::to_vec(&To0HelloAck { nonce_to0_sign: nonce })?,
        done: false,
    })
}

fn owner_sign(ctx: &ServerContext, session: &mut Session, body: &[u8]) -> Result<Outcome> {
    session.expect_phase(Phase::To0OwnerSign, MSG_TO0_OWNER_SIGN)?;
    let msg: OwnerSign = fdo_cbor::from_slice(body)?;
    let to0d = msg.to0d.value();

    let expected_nonce = session
        .nonce_to0_sign
        .ok_or_else(|| ProtocolError::Internal("TO0 session lost its nonce".into()))?;
    if to0d.nonce != expected_nonce {
        return Err(ProtocolError::InvalidMessage("TO0 nonce mismatch".into()));
    }

    // (a) the voucher chain must hold end to end.
    let owner_pk = to0d
        .voucher
        .validate_chain(ctx.keys.mfg_trust_roots.as_deref())?;

    // (b) the To1d blob must be signed by the chain's tail key.
    let to1d = Sign1::from_bytes(msg.to1d.as_slice())?;
    let verifier = VerifyKey::from_public_key(&owner_pk)?;
    let payload_bytes = to1d.verify(&verifier, b"")?;
    let payload: To1dPayload = fdo_cbor::from_slice(payload_bytes)?;
    if payload.nonce != expected_nonce {
        return Err(ProtocolError::InvalidMessage("To1d nonce mismatch".into()));
    }
    if payload.rv_addrs.is_empty() || payload.rv_addrs.iter().any(|a| a.is_unroutable()) {
        return Err(ProtocolError::InvalidMessage("To1d has no routable owner address".into()));
    }

    // (c) the to0d hash link must cover the exact received bytes.
    let computed = hash(payload.to0d_hash.alg, msg.to0d.raw());
    if !computed.matches(&payload.to0d_hash) {
        return Err(ProtocolError::InvalidMessage("to0d hash mismatch".into()));
    }

    let header = to0d.voucher.header()?;
    let chain = to0d
        .voucher
        .cert_chain()
        .ok_or_else(|| ProtocolError::InvalidMessage("voucher has no device certificate chain".into()))?;
    let device_pk = x5chain_public_key(chain)?;

    let wait_seconds = to0d.wait_seconds.min(ctx.to0.max_wait_seconds);
    let blob = RvBlob {
        to1d: ByteBuf::from(msg.to1d.as_slice().to_vec()),
        device_pk,
    };
    ctx.rv_blobs
        .put_rv_blob(&header.guid, &blob, wait_seconds, ctx.now())?;

    info!(guid = %header.guid, wait_seconds, "rendezvous blob accepted");
    Ok(Outcome {
        msg_type: MSG_TO0_ACCEPT_OWNER,
        body: fdo_cbor::to_vec(&AcceptOwner { wait_seconds })?,
        done: true,
    })
}
