//! Transport dispatch: message-number routing, bearer-token session
//! binding, and ErrorMsg generation.
//!
//! The transport hands every incoming `(msg_type, body, token)` here.
//! Opening messages mint a fresh token and session; every other message
//! must present the token from the previous response. Within a session
//! messages are strictly ordered; the surrounding transport must not
//! dispatch two requests for one token concurrently.
//!
//! Every responder failure becomes a wire `ErrorMsg` (255) and destroys
//! the session. Failures inside the encrypted TO2 phase produce the
//! same plaintext ErrorMsg as any other failure, with no
//! decryption-specific detail.

use rand::RngCore;
use serde_bytes::ByteBuf;
use tracing::{debug, warn};

use fdo_store::Token;

use crate::context::{ServerContext, Service};
use crate::messages::{self, ErrorMsg};
use crate::session::{Phase, Session};
use crate::{di, to0, to1, to2, Cancel, ProtocolError, Result};

/// An incoming protocol request.
pub struct Request<'a> {
    /// FDO message number from the URL.
    pub msg_type: u8,
    /// CBOR body.
    pub body: &'a [u8],
    /// Bearer token, absent on opening messages.
    pub token: Option<&'a str>,
}

/// The response handed back to the transport.
pub struct Response {
    /// FDO message number for the `Message-Type` header.
    pub msg_type: u8,
    /// CBOR body.
    pub body: Vec<u8>,
    /// Token for the client's next request.
    pub token: Token,
}

impl Response {
    /// Whether this response is the wire error message.
    pub fn is_error(&self) -> bool {
        self.msg_type == fdo_types::MSG_ERROR
    }
}

/// What a responder produced.
pub(crate) struct Outcome {
    pub msg_type: u8,
    pub body: Vec<u8>,
    /// Whether the protocol run completed and the session must go.
    pub done: bool,
}

/// Route one request. Never fails: protocol errors come back as the
/// wire ErrorMsg with the session destroyed.
pub fn dispatch(ctx: &ServerContext, req: &Request<'_>, cancel: &Cancel) -> Response {
    let opening = matches!(
        req.msg_type,
        messages::MSG_DI_APP_START
            | messages::MSG_TO0_HELLO
            | messages::MSG_TO1_HELLO_RV
            | messages::MSG_TO2_HELLO_DEVICE
    );
    let token = if opening {
        ctx.sessions.new_token()
    } else {
        match req.token {
            Some(t) if !t.is_empty() => Token::from_string(t.to_string()),
            _ => {
                return error_response(ctx, req.msg_type, &ProtocolError::InvalidToken, Token::generate())
            }
        }
    };

    match handle(ctx, req, cancel, opening, &token) {
        Ok(response) => response,
        Err(err) => {
            // Terminal: the session is gone no matter what failed.
            let _ = ctx.sessions.delete(&token);
            error_response(ctx, req.msg_type, &err, token)
        }
    }
}

fn handle(
    ctx: &ServerContext,
    req: &Request<'_>,
    cancel: &Cancel,
    opening: bool,
    token: &Token,
) -> Result<Response> {
    if cancel.is_cancelled() {
        return Err(ProtocolError::Internal("request cancelled".into()));
    }
    let service = service_for(req.msg_type)
        .ok_or_else(|| ProtocolError::InvalidMessage(format!("unknown message type {}", req.msg_type)))?;
    if !ctx.serves(service) {
        return Err(ProtocolError::InvalidMessage(format!(
            "message {} not served here",
            req.msg_type
        )));
    }

    let now = ctx.now();
    let mut session = if opening {
        Session::new(opening_phase(req.msg_type))
    } else {
        Session::from_bytes(&ctx.sessions.get(token, now)?)?
    };

    debug!(msg_type = req.msg_type, token = %token, "dispatching");
    let outcome = match service {
        Service::Manufacturing => di::handle(ctx, &mut session, req.msg_type, req.body)?,
        Service::Rendezvous => {
            if req.msg_type < messages::MSG_TO1_HELLO_RV {
                to0::handle(ctx, &mut session, req.msg_type, req.body)?
            } else {
                to1::handle(ctx, &mut session, req.msg_type, req.body)?
            }
        }
        Service::Owner => to2::handle(ctx, &mut session, req.msg_type, req.body)?,
    };

    if cancel.is_cancelled() {
        return Err(ProtocolError::Internal("request cancelled".into()));
    }
    if outcome.done {
        ctx.sessions.delete(token)?;
    } else {
        ctx.sessions.put(token, session.to_bytes()?, now)?;
    }
    Ok(Response {
        msg_type: outcome.msg_type,
        body: outcome.body,
        token: token.clone(),
    })
}

fn service_for(msg_type: u8) -> Option<Service> {
    match msg_type {
        10..=13 => Some(Service::Manufacturing),
        20..=23 | 30..=33 => Some(Service::Rendezvous),
        60..=71 => Some(Service::Owner),
        _ => None,
    }
}

fn opening_phase(msg_type: u8) -> Phase {
    match msg_type {
        messages::MSG_TO0_HELLO => Phase::To0OwnerSign,
        messages::MSG_TO1_HELLO_RV => Phase::To1Prove,
        messages::MSG_TO2_HELLO_DEVICE => Phase::To2Entries,
        _ => Phase::DiSetHmac,
    }
}

fn error_response(
    ctx: &ServerContext,
    prev_msg: u8,
    err: &ProtocolError,
    token: Token,
) -> Response {
    let mut correlation_id = [0u8; 16];
    RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut correlation_id);
    warn!(
        code = err.code().name(),
        prev_msg,
        correlation_id = %hex::encode(correlation_id),
        error = %err,
        "protocol error"
    );

    let msg = ErrorMsg {
        code: err.code(),
        prev_msg,
        message: err.code().name().to_string(),
        timestamp: ctx.now(),
        correlation_id: ByteBuf::from(correlation_id.to_vec()),
    };
    // Encoding an ErrorMsg cannot realistically fail; fall back to an
    // empty body rather than panicking inside the error path.
    let body = fdo_cbor::to_vec(&msg).unwrap_or_default();
    Response {
        msg_type: fdo_types::MSG_ERROR,
        body,
        token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_routing() {
        assert_eq!(service_for(10), Some(Service::Manufacturing));
        assert_eq!(service_for(23), Some(Service::Rendezvous));
        assert_eq!(service_for(33), Some(Service::Rendezvous));
        assert_eq!(service_for(60), Some(Service::Owner));
        assert_eq!(service_for(71), Some(Service::Owner));
        assert_eq!(service_for(200), None);
    }
}
