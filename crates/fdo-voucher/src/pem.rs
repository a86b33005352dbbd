//! PEM transfer encoding for vouchers.
//!
//! The control plane moves vouchers between services as PEM blocks with
//! the `OWNERSHIP VOUCHER` label. The base64 body wraps at 64 columns;
//! the decoded bytes are the voucher's exact CBOR encoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::voucher::OwnershipVoucher;
use crate::{Result, VoucherError};

const PEM_BEGIN: &str = "-----BEGIN OWNERSHIP VOUCHER-----";
const PEM_END: &str = "-----END OWNERSHIP VOUCHER-----";
const PEM_WIDTH: usize = 64;

/// Encode a voucher as a PEM block.
pub fn encode(voucher: &OwnershipVoucher) -> Result<String> {
    let body = STANDARD.encode(voucher.to_bytes()?);
    let mut out = String::with_capacity(body.len() + body.len() / PEM_WIDTH + 80);
    out.push_str(PEM_BEGIN);
    out.push('\n');
    for chunk in body.as_bytes().chunks(PEM_WIDTH) {
        // base64 output is ASCII, so the chunk is valid UTF-8.
        out.push_str(std::str::from_utf8(chunk).map_err(|_| VoucherError::Pem)?);
        out.push('\n');
    }
    out.push_str(PEM_END);
    out.push('\n');
    Ok(out)
}

/// Decode a PEM block back into a voucher (parsing and version checks
/// included; chain validation is the caller's next step).
pub fn decode(pem: &str) -> Result<OwnershipVoucher> {
    let mut body = String::new();
    let mut inside = false;
    let mut seen_end = false;
    for line in pem.lines() {
        let line = line.trim();
        if line == PEM_BEGIN {
            inside = true;
        } else if line == PEM_END {
            if !inside {
                return Err(VoucherError::Pem);
            }
            inside = false;
            seen_end = true;
        } else if inside {
            body.push_str(line);
        }
    }
    if inside || !seen_end || body.is_empty() {
        return Err(VoucherError::Pem);
    }
    let bytes = STANDARD.decode(body).map_err(|_| VoucherError::Pem)?;
    OwnershipVoucher::parse(&bytes)
}
