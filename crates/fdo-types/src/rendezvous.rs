//! Rendezvous directives and owner redirect addresses.
//!
//! `RendezvousInfo` is burned into the voucher header at DI and tells the
//! device how to reach a rendezvous server; each directive is an ordered
//! list of `[variable, value]` instructions and directives are alternatives
//! tried in order. `RvTo2Addr` entries are the owner-advertised TO2
//! endpoints distributed through rendezvous in the `To1d` blob.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_repr::{Deserialize_repr, Serialize_repr};

/// FDO rendezvous variable registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum RvVar {
    /// Instruction applies to the device only.
    DevOnly = 0,
    /// Instruction applies to the owner only.
    OwnerOnly = 1,
    /// IP address (bstr, 4 or 16 bytes).
    IpAddress = 2,
    /// Device-side port.
    DevPort = 3,
    /// Owner-side port.
    OwnerPort = 4,
    /// DNS name (tstr).
    Dns = 5,
    /// Server certificate hash.
    SvCertHash = 6,
    /// CA certificate hash.
    ClCertHash = 7,
    /// Ask the user before dialing.
    UserInput = 8,
    /// WiFi SSID for pre-network devices.
    WifiSsid = 9,
    /// WiFi password.
    WifiPw = 10,
    /// Transport medium selector.
    Medium = 11,
    /// Transport protocol selector (see [`RvProtocol`]).
    Protocol = 12,
    /// Delay in seconds before contacting the server.
    Delaysec = 13,
    /// Skip the rendezvous server entirely (TO2-only devices).
    Bypass = 14,
}

/// Transport protocol values for [`RvVar::Protocol`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum RvProtocol {
    Rest = 0,
    Http = 1,
    Https = 2,
    Tcp = 3,
    Tls = 4,
    CoapTcp = 5,
    CoapUdp = 6,
}

/// One `[variable, value]` instruction. The value is a nested
/// CBOR-encoded item (`bstr .cbor`), interpreted per variable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousInstr {
    /// Which variable this instruction sets.
    pub variable: RvVar,
    /// CBOR-encoded value bytes.
    pub value: ByteBuf,
}

impl RendezvousInstr {
    /// Construct from a variable and already-encoded CBOR value bytes.
    pub fn new(variable: RvVar, value: Vec<u8>) -> Self {
        Self {
            variable,
            value: ByteBuf::from(value),
        }
    }
}

/// An ordered list of instructions forming one alternative.
pub type RendezvousDirective = Vec<RendezvousInstr>;

/// Ordered list of directives; the device tries each in turn.
pub type RendezvousInfo = Vec<RendezvousDirective>;

/// One owner TO2 endpoint: `[ip, dns, port, protocol]` with `ip`/`dns`
/// nullable but not both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RvTo2Addr {
    /// Raw IP address bytes (4 for IPv4, 16 for IPv6), if given.
    pub ip: Option<ByteBuf>,
    /// DNS name, if given.
    pub dns: Option<String>,
    /// TCP port.
    pub port: u16,
    /// Transport protocol.
    pub protocol: RvProtocol,
}

impl RvTo2Addr {
    /// An HTTP endpoint by DNS name.
    pub fn http_dns(dns: impl Into<String>, port: u16) -> Self {
        Self {
            ip: None,
            dns: Some(dns.into()),
            port,
            protocol: RvProtocol::Http,
        }
    }

    /// True when neither an IP nor a DNS name is present.
    pub fn is_unroutable(&self) -> bool {
        self.ip.is_none() && self.dns.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instr_holds_raw_value() {
        let instr = RendezvousInstr::new(RvVar::Dns, vec![0x63, b'f', b'o', b'o']);
        assert_eq!(instr.variable, RvVar::Dns);
        assert_eq!(instr.value.len(), 4);
    }

    #[test]
    fn test_rv_to2_addr_routability() {
        let addr = RvTo2Addr::http_dns("owner.example", 8043);
        assert!(!addr.is_unroutable());
        assert_eq!(addr.port, 8043);

        let bad = RvTo2Addr {
            ip: None,
            dns: None,
            port: 80,
            protocol: RvProtocol::Http,
        };
        assert!(bad.is_unroutable());
    }
}
