//! TO1 responder (device → rendezvous, messages 30–33).
//!
//! The device presents its GUID, signs the challenge nonce with its
//! attestation key, and receives the owner's `To1d` blob byte-identical
//! to what TO0 stored. A missing or expired blob is a resource-not-found
//! error at both steps.

use tracing::info;

use fdo_cose::{Sign1, VerifyKey};
use fdo_types::Nonce;

use crate::context::ServerContext;
use crate::dispatch::Outcome;
use crate::messages::{
    HelloRv, HelloRvAck, ProveToRv, RvRedirect, MSG_TO1_HELLO_RV, MSG_TO1_HELLO_RV_ACK,
    MSG_TO1_PROVE_TO_RV, MSG_TO1_RV_REDIRECT,
};
use crate::session::{Phase, Session};
use crate::{ProtocolError, Result};
use fdo_cbor::RawCbor;

pub(crate) fn handle(
    ctx: &ServerContext,
    session: &mut Session,
    msg_type: u8,
    body: &[u8],
) -> Result<Outcome> {
    match msg_type {
        MSG_TO1_HELLO_RV => hello_rv(ctx, session, body),
        MSG_TO1_PROVE_TO_RV => prove_to_rv(ctx, session, body),
        other => Err(ProtocolError::InvalidMessage(format!(
            "unexpected TO1 message {other}"
        ))),
    }
}

fn hello_rv(ctx: &ServerContext, session: &mut Session, body: &[u8]) -> Result<Outcome> {
    let msg: HelloRv = fdo_cbor::from_slice(body)?;
    // Fail fast when no owner has published for this GUID.
    ctx.rv_blobs.get_rv_blob(&msg.guid, ctx.now())?;

    let nonce = Nonce::generate();
    session.guid = Some(msg.guid);
    session.nonce_to1_proof = Some(nonce);
    session.phase = Phase::To1Prove;

    Ok(Outcome {
        msg_type: MSG_TO1_HELLO_RV_ACK,
        body: fdo_cbor::to_vec(&HelloRvAck {
            nonce_to1_proof: nonce,
            sig_info: msg.sig_info,
        })?,
        done: false,
    })
}

fn prove_to_rv(ctx: &ServerContext, session: &mut Session, body: &[u8]) -> Result<Outcome> {
    session.expect_phase(Phase::To1Prove, MSG_TO1_PROVE_TO_RV)?;
    let msg: ProveToRv = fdo_cbor::from_slice(body)?;
    let guid = session.require_guid()?;
    let blob = ctx.rv_blobs.get_rv_blob(&guid, ctx.now())?;

    let sign1 = Sign1::from_bytes(msg.token.as_slice())?;
    let verifier = VerifyKey::from_public_key(&blob.device_pk)?;
    let payload = sign1.verify(&verifier, b"")?;
    let proven: Nonce = fdo_cbor::from_slice(payload)?;

    let expected = session
        .nonce_to1_proof
        .ok_or_else(|| ProtocolError::Internal("TO1 session lost its nonce".into()))?;
    if proven != expected {
        return Err(ProtocolError::InvalidMessage("TO1 proof nonce mismatch".into()));
    }

    info!(%guid, "device resolved its owner");
    Ok(Outcome {
        msg_type: MSG_TO1_RV_REDIRECT,
        body: fdo_cbor::to_vec(&RvRedirect {
            to1d: RawCbor::new(blob.to1d.into_vec()),
        })?,
        done: true,
    })
}
