//! End-to-end onboarding scenarios.
//!
//! Three simulated services (manufacturing, rendezvous, owner), each
//! with its own in-memory store and a shared controllable clock, plus a
//! device harness that plays the client half of every protocol:
//!
//! 1. DI round trip: certificate issuance, header HMAC, voucher
//!    persisted with an empty entry list.
//! 2. Extend-and-validate: two ownership transfers, tail key tracking,
//!    bit-flip detection at entry 0.
//! 3. TO0 → TO1: blob published, returned byte-identical, gone after
//!    its TTL.
//! 4. Full TO2 with ECDH256 + A128GCM: entry replay, key exchange,
//!    encrypted devmod and a 1,500-byte `fdo.download` at MTU 1,300,
//!    voucher replacement.
//! 5. Cipher negotiation refusal of the unimplemented CCM suite.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ciborium::value::Value;
use serde_bytes::ByteBuf;

use fdo_cbor::{CborBstr, RawCbor};
use fdo_cose::{encrypt0, Sign1, SignKey, VerifyKey};
use fdo_crypto::cert::DeviceAttestation;
use fdo_crypto::cert::ManufacturerCa;
use fdo_crypto::cipher::CipherSuite;
use fdo_crypto::hash::{hash, hmac};
use fdo_crypto::kdf::{derive_session_keys, SessionKeys};
use fdo_crypto::kex::{device_respond, KexSuite};
use fdo_protocol::messages::*;
use fdo_protocol::{dispatch, Cancel, DiConfig, KeyRing, Request, ServerContext, Service, To0Config, To2Config};
use fdo_serviceinfo::{chunk_out, ChunkIn, Devmod, DownloadModule, Kv, ReadOutcome};
use fdo_store::memory::MemoryStore;
use fdo_store::Token;
use fdo_types::{
    ErrorCode, Guid, Hash, HashAlg, KeyEncoding, KeyType, Nonce, PublicKey, RendezvousInstr,
    RvTo2Addr, RvVar, PROTOCOL_VERSION,
};
use fdo_voucher::{OvHeader, OwnershipVoucher};

/// Reserved wrapper bytes per encrypted frame (matches the responder's
/// budget for A128GCM).
const TUNNEL_OVERHEAD: usize = 48;
const MTU: usize = 1300;

struct TestClock(Arc<AtomicU64>);

impl TestClock {
    fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1_000_000)))
    }

    fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    fn as_fn(&self) -> Arc<dyn Fn() -> u64 + Send + Sync> {
        let inner = Arc::clone(&self.0);
        Arc::new(move || inner.load(Ordering::SeqCst))
    }
}

struct TestEnv {
    clock: TestClock,
    mfg_key: Arc<SignKey>,
    owner_key: Arc<SignKey>,
    mfg_store: Arc<MemoryStore>,
    owner_store: Arc<MemoryStore>,
    mfg: ServerContext,
    rv: ServerContext,
}

fn rv_info() -> Vec<Vec<RendezvousInstr>> {
    vec![vec![RendezvousInstr::new(
        RvVar::Dns,
        fdo_cbor::to_vec(&"rv.example").expect("encode"),
    )]]
}

fn env() -> TestEnv {
    let clock = TestClock::new();
    let mfg_key = Arc::new(SignKey::generate_es256());
    let owner_key = Arc::new(SignKey::generate_es256());
    let ca = Arc::new(ManufacturerCa::generate("FDO Test CA").expect("ca"));

    let mfg_store = Arc::new(MemoryStore::new());
    let mfg = ServerContext {
        services: vec![Service::Manufacturing],
        sessions: mfg_store.clone(),
        vouchers: mfg_store.clone(),
        rv_blobs: mfg_store.clone(),
        devmods: mfg_store.clone(),
        keys: KeyRing {
            mfg_key: Some(Arc::clone(&mfg_key)),
            owner_key: None,
            owner2_key: None,
            mfg_trust_roots: None,
        },
        di: Some(DiConfig {
            rv_info: rv_info(),
            hash_alg: HashAlg::Sha256,
            ca,
            before_voucher_persist: None,
        }),
        to0: To0Config::default(),
        to2: None,
        clock: clock.as_fn(),
    };

    let rv_store = Arc::new(MemoryStore::new());
    let rv = ServerContext {
        services: vec![Service::Rendezvous],
        sessions: rv_store.clone(),
        vouchers: rv_store.clone(),
        rv_blobs: rv_store.clone(),
        devmods: rv_store,
        keys: KeyRing::empty(),
        di: None,
        to0: To0Config::default(),
        to2: None,
        clock: clock.as_fn(),
    };

    let owner_store = Arc::new(MemoryStore::new());
    TestEnv {
        clock,
        mfg_key,
        owner_key,
        mfg_store,
        owner_store,
        mfg,
        rv,
    }
}

fn owner_ctx(env: &TestEnv, to2: To2Config) -> ServerContext {
    ServerContext {
        services: vec![Service::Owner],
        sessions: env.owner_store.clone(),
        vouchers: env.owner_store.clone(),
        rv_blobs: env.owner_store.clone(),
        devmods: env.owner_store.clone(),
        keys: KeyRing {
            mfg_key: None,
            owner_key: Some(Arc::clone(&env.owner_key)),
            owner2_key: None,
            mfg_trust_roots: None,
        },
        di: None,
        to0: To0Config::default(),
        to2: Some(to2),
        clock: env.clock.as_fn(),
    }
}

fn send(ctx: &ServerContext, msg_type: u8, body: Vec<u8>, token: Option<&Token>) -> fdo_protocol::Response {
    let req = Request {
        msg_type,
        body: &body,
        token: token.map(Token::as_str),
    };
    dispatch(ctx, &req, &Cancel::new())
}

fn expect_error(resp: &fdo_protocol::Response) -> ErrorMsg {
    assert!(resp.is_error(), "expected ErrorMsg, got message {}", resp.msg_type);
    fdo_cbor::from_slice(&resp.body).expect("decode error message")
}

/// The device's half of the protocols.
struct DeviceSim {
    key: SignKey,
    hmac_secret: Vec<u8>,
    guid: Guid,
    device_info: String,
    cert_chain_hash: Option<Hash>,
}

impl DeviceSim {
    /// Run DI against the manufacturing service; returns the simulator
    /// and the persisted voucher.
    fn run_di(env: &TestEnv) -> (Self, OwnershipVoucher) {
        Self::run_di_expect_entries(env, 0)
    }

    /// Run DI expecting the persisted voucher to carry `entries`
    /// ownership entries (non-zero when a pre-persist hook extends it).
    fn run_di_expect_entries(env: &TestEnv, entries: usize) -> (Self, OwnershipVoucher) {
        let attestation = DeviceAttestation::generate("SN-0042").expect("attestation");
        let key = SignKey::es256_from_pkcs8_der(&attestation.key_der).expect("device key");

        let app_start = AppStart {
            mfg_info: CborBstr::new(DeviceMfgInfo {
                key_type: KeyType::SecP256,
                serial: "SN-0042".into(),
                device_info: "integration-device".into(),
                csr: ByteBuf::from(attestation.csr_der),
            })
            .expect("wrap"),
        };
        let resp = send(&env.mfg, MSG_DI_APP_START, fdo_cbor::to_vec(&app_start).expect("encode"), None);
        assert_eq!(resp.msg_type, MSG_DI_SET_CREDENTIALS);
        let creds: SetCredentials = fdo_cbor::from_slice(&resp.body).expect("decode");
        let header: OvHeader = creds.header.decode().expect("header");
        assert_eq!(header.prot_ver, PROTOCOL_VERSION);
        assert_eq!(header.device_info, "integration-device");

        let hmac_secret = b"device-hmac-secret".to_vec();
        let header_hmac =
            hmac(HashAlg::Sha256, &hmac_secret, creds.header.as_slice()).expect("hmac");
        let resp2 = send(
            &env.mfg,
            MSG_DI_SET_HMAC,
            fdo_cbor::to_vec(&SetHmac {
                hmac: header_hmac.clone(),
            })
            .expect("encode"),
            Some(&resp.token),
        );
        assert_eq!(resp2.msg_type, MSG_DI_DONE);

        let voucher_bytes = fdo_store::VoucherStore::get(&*env.mfg_store, &header.guid).expect("stored");
        let voucher = OwnershipVoucher::parse(&voucher_bytes).expect("parse");
        assert_eq!(voucher.num_entries(), entries);
        assert!(voucher.header_hmac().matches(&header_hmac));

        let sim = DeviceSim {
            key,
            hmac_secret,
            guid: header.guid,
            device_info: header.device_info.clone(),
            cert_chain_hash: header.cert_chain_hash.clone(),
        };
        (sim, voucher)
    }

    /// Run TO1 and return the To1d bytes.
    fn run_to1(&self, env: &TestEnv) -> Result<Vec<u8>, ErrorMsg> {
        let hello = HelloRv {
            guid: self.guid,
            sig_info: SigInfo::es256(),
        };
        let resp = send(&env.rv, MSG_TO1_HELLO_RV, fdo_cbor::to_vec(&hello).expect("encode"), None);
        if resp.is_error() {
            return Err(expect_error(&resp));
        }
        assert_eq!(resp.msg_type, MSG_TO1_HELLO_RV_ACK);
        let ack: HelloRvAck = fdo_cbor::from_slice(&resp.body).expect("decode");

        let proof = Sign1::create(
            fdo_cbor::to_vec(&ack.nonce_to1_proof).expect("encode"),
            &self.key,
            vec![],
            b"",
        )
        .expect("sign");
        let resp2 = send(
            &env.rv,
            MSG_TO1_PROVE_TO_RV,
            fdo_cbor::to_vec(&ProveToRv {
                token: RawCbor::new(proof.into_bytes()),
            })
            .expect("encode"),
            Some(&resp.token),
        );
        if resp2.is_error() {
            return Err(expect_error(&resp2));
        }
        assert_eq!(resp2.msg_type, MSG_TO1_RV_REDIRECT);
        let redirect: RvRedirect = fdo_cbor::from_slice(&resp2.body).expect("decode");
        Ok(redirect.to1d.into_vec())
    }
}

/// Owner-side TO0 publication.
fn run_to0(env: &TestEnv, voucher: &OwnershipVoucher, wait_seconds: u32) -> (Vec<u8>, u32) {
    let resp = send(&env.rv, MSG_TO0_HELLO, fdo_cbor::to_vec(&To0Hello {}).expect("encode"), None);
    assert_eq!(resp.msg_type, MSG_TO0_HELLO_ACK);
    let ack: To0HelloAck = fdo_cbor::from_slice(&resp.body).expect("decode");

    let to0d = CborBstr::new(To0d {
        voucher: voucher.clone(),
        wait_seconds,
        nonce: ack.nonce_to0_sign,
    })
    .expect("wrap");
    let payload = To1dPayload {
        rv_addrs: vec![RvTo2Addr::http_dns("owner.example", 8043)],
        to0d_hash: hash(HashAlg::Sha256, to0d.raw()),
        nonce: ack.nonce_to0_sign,
    };
    let to1d = Sign1::create(
        fdo_cbor::canonical_to_vec(&payload).expect("encode"),
        &env.owner_key,
        vec![],
        b"",
    )
    .expect("sign");
    let to1d_bytes = to1d.as_bytes().to_vec();

    let resp2 = send(
        &env.rv,
        MSG_TO0_OWNER_SIGN,
        fdo_cbor::to_vec(&OwnerSign {
            to0d,
            to1d: RawCbor::new(to1d.into_bytes()),
        })
        .expect("encode"),
        Some(&resp.token),
    );
    assert_eq!(resp2.msg_type, MSG_TO0_ACCEPT_OWNER, "TO0 rejected");
    let accept: AcceptOwner = fdo_cbor::from_slice(&resp2.body).expect("decode");
    (to1d_bytes, accept.wait_seconds)
}

/// Device-side TO2 tunnel state.
struct Tunnel {
    cipher: CipherSuite,
    keys: SessionKeys,
}

impl Tunnel {
    fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        encrypt0::seal(self.cipher, &self.keys, None, plaintext, b"").expect("seal")
    }

    fn open(&self, body: &[u8]) -> Vec<u8> {
        encrypt0::open(self.cipher, &self.keys, body, b"").expect("open")
    }
}

struct To2Result {
    replacement_guid: Guid,
    replacement_hmac: Hash,
    owner2_pk: PublicKey,
    downloaded: Vec<u8>,
    encrypted_data_frames: usize,
}

/// Drive a complete TO2 run as the device.
fn run_to2(owner: &ServerContext, sim: &DeviceSim, voucher: &OwnershipVoucher) -> To2Result {
    let nonce_prove_ov = Nonce::generate();
    let hello = HelloDevice {
        max_device_message_size: MTU as u16,
        guid: sim.guid,
        nonce_prove_ov,
        kex_suites: vec!["ECDH256".into()],
        cipher_suites: vec![CipherSuite::A128Gcm as i64],
        sig_info: SigInfo::es256(),
    };
    let resp = send(owner, MSG_TO2_HELLO_DEVICE, fdo_cbor::to_vec(&hello).expect("encode"), None);
    assert_eq!(resp.msg_type, MSG_TO2_PROVE_OV_HDR, "TO2 hello failed");
    let token = resp.token.clone();

    // --- ProveOVHdr: verify the owner against the voucher tail. ---
    let prove: ProveOvHdr = fdo_cbor::from_slice(&resp.body).expect("decode");
    let sign1 = Sign1::from_bytes(prove.sign1.as_slice()).expect("parse");
    let tail_pk = voucher.current_owner_key().expect("tail");
    let payload_bytes = sign1
        .verify(&VerifyKey::from_public_key(&tail_pk).expect("verifier"), b"")
        .expect("owner signature");
    let payload: ProveOvHdrPayload = fdo_cbor::from_slice(payload_bytes).expect("decode");
    assert_eq!(payload.nonce_prove_ov, nonce_prove_ov);
    assert_eq!(payload.header.as_slice(), voucher.header_bytes());
    assert_eq!(payload.num_entries as usize, voucher.num_entries());
    let nonce_prove_dv = match sign1.unprotected_value(CUPH_NONCE) {
        Some(Value::Bytes(bytes)) => Nonce::from_slice(bytes).expect("nonce"),
        other => unreachable!("missing CUPHNonce: {other:?}"),
    };

    // --- Entry replay, strictly sequential. ---
    let mut token = token;
    for i in 0..payload.num_entries {
        let resp = send(
            owner,
            MSG_TO2_GET_OV_NEXT_ENTRY,
            fdo_cbor::to_vec(&GetOvNextEntry { entry_num: i }).expect("encode"),
            Some(&token),
        );
        assert_eq!(resp.msg_type, MSG_TO2_OV_NEXT_ENTRY);
        token = resp.token.clone();
        let entry: OvNextEntry = fdo_cbor::from_slice(&resp.body).expect("decode");
        assert_eq!(entry.entry_num, i);
        assert_eq!(
            entry.entry.as_slice(),
            voucher.entry(i as usize).expect("entry").as_slice(),
            "entry bytes must replay verbatim"
        );
    }

    // --- ProveDevice: party-B key exchange under the device key. ---
    let kex = device_respond(KexSuite::Ecdh256, &payload.xa_kex, None).expect("kex");
    let nonce_setup_dv = Nonce::generate();
    let pd_payload = ProveDevicePayload {
        nonce_prove_dv,
        xb_kex: ByteBuf::from(kex.xb),
    };
    let pd_sign1 = Sign1::create(
        fdo_cbor::canonical_to_vec(&pd_payload).expect("encode"),
        &sim.key,
        vec![(CUPH_NONCE, Value::Bytes(nonce_setup_dv.as_bytes().to_vec()))],
        b"",
    )
    .expect("sign");
    let resp = send(
        owner,
        MSG_TO2_PROVE_DEVICE,
        fdo_cbor::to_vec(&ProveDevice {
            sign1: RawCbor::new(pd_sign1.into_bytes()),
        })
        .expect("encode"),
        Some(&token),
    );
    assert_eq!(resp.msg_type, MSG_TO2_SETUP_DEVICE, "ProveDevice failed");
    token = resp.token.clone();

    let tunnel = Tunnel {
        cipher: CipherSuite::A128Gcm,
        keys: derive_session_keys(KexSuite::Ecdh256, CipherSuite::A128Gcm, &kex.shared)
            .expect("derive"),
    };

    // --- SetupDevice: replacement credentials, owner2-signed. ---
    let setup: SetupDevice = fdo_cbor::from_slice(&resp.body).expect("decode");
    let setup_sign1 = Sign1::from_bytes(setup.sign1.as_slice()).expect("parse");
    let sp: SetupDevicePayload =
        fdo_cbor::from_slice(setup_sign1.payload().expect("payload")).expect("decode");
    setup_sign1
        .verify(&VerifyKey::from_public_key(&sp.owner2_pk).expect("verifier"), b"")
        .expect("owner2 signature");
    assert_eq!(sp.nonce_setup_dv, nonce_setup_dv);

    // Reconstruct the replacement header exactly as the owner froze it.
    let replacement_header = OvHeader {
        prot_ver: PROTOCOL_VERSION,
        guid: sp.guid,
        rv_info: sp.rv_info.clone(),
        device_info: sim.device_info.clone(),
        mfg_pubkey: sp.owner2_pk.clone(),
        cert_chain_hash: sim.cert_chain_hash.clone(),
    };
    let replacement_header_bytes =
        fdo_cbor::canonical_to_vec(&replacement_header).expect("encode");
    let replacement_hmac =
        hmac(HashAlg::Sha256, &sim.hmac_secret, &replacement_header_bytes).expect("hmac");

    // --- Encrypted phase. ---
    let ready = DeviceServiceInfoReady {
        replacement_hmac: Some(replacement_hmac.clone()),
        max_owner_service_info_size: Some(MTU as u16),
    };
    let resp = send(
        owner,
        MSG_TO2_DEVICE_SERVICE_INFO_READY,
        tunnel.seal(&fdo_cbor::to_vec(&ready).expect("encode")),
        Some(&token),
    );
    assert_eq!(resp.msg_type, MSG_TO2_OWNER_SERVICE_INFO_READY, "ready failed");
    token = resp.token.clone();
    let owner_ready: OwnerServiceInfoReady = fdo_cbor::from_slice(&tunnel.open(&resp.body)).expect("decode");
    assert_eq!(owner_ready.max_device_service_info_size, Some(MTU as u16));

    // Stream devmod under the negotiated MTU.
    let effective = MTU - TUNNEL_OVERHEAD;
    let devmod = Devmod::linux("integration-device", vec!["fdo.download".into()]);
    let (mut writer, mut reader) = chunk_out(1 << 16);
    devmod.emit(&mut writer, effective).expect("emit");
    writer.close();
    let mut frames = Vec::new();
    loop {
        match reader.read_frame(effective).expect("read") {
            ReadOutcome::Frame(frame) => frames.push(frame),
            ReadOutcome::Ended => break,
            ReadOutcome::Pending => continue,
        }
    }

    let mut owner_in = ChunkIn::new();
    let mut downloaded = Vec::new();
    let mut encrypted_data_frames = 0usize;
    let mut download_done: Option<u64> = None;
    let mut owner_done = false;

    let total = frames.len();
    for (i, frame) in frames.into_iter().enumerate() {
        let msg = DeviceServiceInfo {
            is_more: i + 1 < total,
            service_info: frame,
        };
        let resp = send(
            owner,
            MSG_TO2_DEVICE_SERVICE_INFO,
            tunnel.seal(&fdo_cbor::to_vec(&msg).expect("encode")),
            Some(&token),
        );
        assert_eq!(resp.msg_type, MSG_TO2_OWNER_SERVICE_INFO, "devmod frame rejected");
        token = resp.token.clone();
        let reply: OwnerServiceInfo = fdo_cbor::from_slice(&tunnel.open(&resp.body)).expect("decode");
        assert!(!reply.is_done, "owner finished before streaming");
        // The reply to the final devmod frame may already carry the
        // first module message.
        if !reply.service_info.is_empty() {
            owner_in.push_frame(&reply.service_info);
        }
    }

    // Poll the owner until it reports done, acking the download when it
    // completes.
    let mut pending_ack: Option<Vec<Kv>> = None;
    for _ in 0..256 {
        let service_info = pending_ack.take().unwrap_or_default();
        let msg = DeviceServiceInfo {
            is_more: false,
            service_info,
        };
        let resp = send(
            owner,
            MSG_TO2_DEVICE_SERVICE_INFO,
            tunnel.seal(&fdo_cbor::to_vec(&msg).expect("encode")),
            Some(&token),
        );
        assert_eq!(resp.msg_type, MSG_TO2_OWNER_SERVICE_INFO, "service info poll failed");
        token = resp.token.clone();
        let reply: OwnerServiceInfo = fdo_cbor::from_slice(&tunnel.open(&resp.body)).expect("decode");

        if !reply.service_info.is_empty() {
            let carries_data = reply.service_info.iter().any(|kv| kv.key == "fdo.download:data");
            if carries_data {
                encrypted_data_frames += 1;
            }
            owner_in.push_frame(&reply.service_info);
        }
        // Complete KVs arrive frame-aligned from the one-KV-per-poll
        // owner modules.
        let mut flush = ChunkIn::new();
        std::mem::swap(&mut flush, &mut owner_in);
        flush.finish();
        while let Some(kv) = flush.next_complete() {
            match kv.key.as_str() {
                "fdo.download:data" => {
                    let chunk: ByteBuf = fdo_cbor::from_slice(&kv.value).expect("decode chunk");
                    downloaded.extend_from_slice(&chunk);
                }
                "fdo.download:done" => {
                    download_done = Some(fdo_cbor::from_slice(&kv.value).expect("decode len"));
                }
                _ => {}
            }
        }
        if let Some(len) = download_done.take() {
            pending_ack = Some(vec![Kv::new(
                "fdo.download:done",
                fdo_cbor::to_vec(&len).expect("encode"),
            )]);
        }

        if reply.is_done {
            owner_done = true;
            break;
        }
    }
    assert!(owner_done, "owner never reported ServiceInfo done");

    // --- Done / Done2. ---
    let resp = send(
        owner,
        MSG_TO2_DONE,
        tunnel.seal(&fdo_cbor::to_vec(&To2Done { nonce_prove_dv }).expect("encode")),
        Some(&token),
    );
    assert_eq!(resp.msg_type, MSG_TO2_DONE2, "Done failed");
    let done2: To2Done2 = fdo_cbor::from_slice(&tunnel.open(&resp.body)).expect("decode");
    assert_eq!(done2.nonce_setup_dv, nonce_setup_dv);

    To2Result {
        replacement_guid: sp.guid,
        replacement_hmac,
        owner2_pk: sp.owner2_pk,
        downloaded,
        encrypted_data_frames,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn di_round_trip_persists_voucher() {
    let env = env();
    let (sim, voucher) = DeviceSim::run_di(&env);

    assert_eq!(voucher.num_entries(), 0);
    let owner = voucher.validate_chain(None).expect("validate");
    assert_eq!(
        owner,
        env.mfg_key.public_key(KeyEncoding::X509).expect("mfg pk")
    );
    // The header the device HMACed is the header that was stored.
    let stored_header = voucher.header().expect("header");
    assert_eq!(stored_header.guid, sim.guid);
    assert!(stored_header.cert_chain_hash.is_some());
}

#[test]
fn di_pre_persist_hook_extends_to_first_owner() {
    let mut env = env();
    let owner_pk = env.owner_key.public_key(KeyEncoding::X509).expect("pk");
    let mfg_key = Arc::clone(&env.mfg_key);
    let hook_owner_pk = owner_pk.clone();
    if let Some(di) = env.mfg.di.as_mut() {
        di.before_voucher_persist = Some(Arc::new(move |voucher| {
            voucher
                .extend(&mfg_key, &hook_owner_pk)
                .map_err(|e| fdo_protocol::ProtocolError::Internal(e.to_string()))
        }));
    }

    let (sim, voucher) = DeviceSim::run_di_expect_entries(&env, 1);
    assert_eq!(voucher.num_entries(), 1);
    assert_eq!(voucher.validate_chain(None).expect("validate"), owner_pk);
    assert_eq!(voucher.header().expect("header").guid, sim.guid);
}

#[test]
fn voucher_extend_and_validate() {
    let env = env();
    let (_, v0) = DeviceSim::run_di(&env);

    let k1 = SignKey::generate_es256();
    let k2 = SignKey::generate_es256();
    let k1_pk = k1.public_key(KeyEncoding::X509).expect("pk");
    let k2_pk = k2.public_key(KeyEncoding::X509).expect("pk");

    let v1 = v0.extend(&env.mfg_key, &k1_pk).expect("extend 1");
    let v2 = v1.extend(&k1, &k2_pk).expect("extend 2");

    assert_eq!(v2.validate_chain(None).expect("validate"), k2_pk);
    assert_eq!(v2.current_owner_key().expect("owner"), k2_pk);

    // Flip one bit inside entry 0's signature region.
    let mut bytes = v2.to_bytes().expect("encode");
    let entry0 = v2.entry(0).expect("entry");
    let entry0_sig_byte = entry0.as_slice().len() - 10;
    // Locate entry 0's bytes inside the encoded voucher and flip there.
    let needle = &entry0.as_slice()[entry0_sig_byte..];
    let pos = bytes
        .windows(needle.len())
        .position(|w| w == needle)
        .expect("entry bytes present");
    bytes[pos] ^= 0x01;

    let tampered = OwnershipVoucher::parse(&bytes).expect("parse");
    let result = tampered.validate_chain(None);
    assert!(
        matches!(
            result,
            Err(fdo_voucher::VoucherError::Chain(
                fdo_voucher::ChainError::SignatureMismatch(0)
            ))
        ),
        "expected SignatureMismatch(0), got {result:?}"
    );
}

#[test]
fn to0_to1_roundtrip_and_ttl_expiry() {
    let env = env();
    let (sim, v0) = DeviceSim::run_di(&env);

    // The owner must hold the tail key, so extend to it first.
    let owner_pk = env.owner_key.public_key(KeyEncoding::X509).expect("pk");
    let voucher = v0.extend(&env.mfg_key, &owner_pk).expect("extend");

    let (published_to1d, granted) = run_to0(&env, &voucher, 3600);
    assert_eq!(granted, 3600);

    // The device receives the blob byte-identical.
    let to1d = sim.run_to1(&env).expect("to1");
    assert_eq!(to1d, published_to1d);

    // One second past the TTL the blob is gone.
    env.clock.advance(3601);
    let err = sim.run_to1(&env).expect_err("expired blob must not resolve");
    assert_eq!(err.code, ErrorCode::ResourceNotFound);
}

#[test]
fn to2_happy_path_ecdh256_a128gcm() {
    let env = env();
    let (sim, v0) = DeviceSim::run_di(&env);

    let owner_pk = env.owner_key.public_key(KeyEncoding::X509).expect("pk");
    let voucher = v0.extend(&env.mfg_key, &owner_pk).expect("extend");
    fdo_store::VoucherStore::insert(&*env.owner_store, &sim.guid, &voucher.to_bytes().expect("encode"))
        .expect("seed owner store");

    let payload = vec![0xA7u8; 1500];
    let owner = owner_ctx(
        &env,
        To2Config {
            reuse_credential: false,
            replacement_rv_info: None,
            modules: vec![Arc::new(DownloadModule::new("fw.bin", payload.clone()))],
            max_message_size: MTU as u16,
        },
    );

    let result = run_to2(&owner, &sim, &voucher);

    // The full payload arrived, across at least two encrypted frames.
    assert_eq!(result.downloaded, payload);
    assert!(
        result.encrypted_data_frames >= 2,
        "expected >= 2 data frames, got {}",
        result.encrypted_data_frames
    );

    // The voucher was replaced: old GUID gone, replacement present,
    // rooted at the owner2 key with the device's replacement HMAC.
    assert_ne!(result.replacement_guid, sim.guid);
    assert!(fdo_store::VoucherStore::get(&*env.owner_store, &sim.guid).is_err());
    let replaced_bytes =
        fdo_store::VoucherStore::get(&*env.owner_store, &result.replacement_guid).expect("replacement");
    let replaced = OwnershipVoucher::parse(&replaced_bytes).expect("parse");
    assert_eq!(replaced.num_entries(), 0);
    assert!(replaced.header_hmac().matches(&result.replacement_hmac));
    let new_header = replaced.header().expect("header");
    assert_eq!(new_header.mfg_pubkey, result.owner2_pk);
    assert_eq!(new_header.guid, result.replacement_guid);

    // Devmod was recorded for the device.
    let devmod_bytes =
        fdo_store::DevmodStore::get_devmod(&*env.owner_store, &sim.guid).expect("devmod");
    let devmod: Devmod = fdo_cbor::from_slice(&devmod_bytes).expect("decode");
    assert_eq!(devmod.device, "integration-device");
    assert_eq!(devmod.modules, vec!["fdo.download".to_string()]);
}

#[test]
fn cipher_negotiation_failure_tears_session_down() {
    let env = env();
    let (sim, v0) = DeviceSim::run_di(&env);
    let owner_pk = env.owner_key.public_key(KeyEncoding::X509).expect("pk");
    let voucher = v0.extend(&env.mfg_key, &owner_pk).expect("extend");
    fdo_store::VoucherStore::insert(&*env.owner_store, &sim.guid, &voucher.to_bytes().expect("encode"))
        .expect("seed owner store");
    let owner = owner_ctx(&env, To2Config::default());

    // The CCM suites are registry entries but unimplemented; offering
    // only one of them must be refused, not substituted.
    let hello = HelloDevice {
        max_device_message_size: MTU as u16,
        guid: sim.guid,
        nonce_prove_ov: Nonce::generate(),
        kex_suites: vec!["ECDH256".into()],
        cipher_suites: vec![CipherSuite::AesCcm16_128_128 as i64],
        sig_info: SigInfo::es256(),
    };
    let resp = send(&owner, MSG_TO2_HELLO_DEVICE, fdo_cbor::to_vec(&hello).expect("encode"), None);
    let err = expect_error(&resp);
    assert_eq!(err.code, ErrorCode::MessageBody);
    assert_eq!(err.prev_msg, MSG_TO2_HELLO_DEVICE);

    // The session is gone: reusing the token is an invalid-token error.
    let resp2 = send(
        &owner,
        MSG_TO2_GET_OV_NEXT_ENTRY,
        fdo_cbor::to_vec(&GetOvNextEntry { entry_num: 0 }).expect("encode"),
        Some(&resp.token),
    );
    let err2 = expect_error(&resp2);
    assert_eq!(err2.code, ErrorCode::InvalidToken);
}

#[test]
fn session_expiry_returns_invalid_token() {
    let env = env();
    let (sim, v0) = DeviceSim::run_di(&env);
    let owner_pk = env.owner_key.public_key(KeyEncoding::X509).expect("pk");
    let voucher = v0.extend(&env.mfg_key, &owner_pk).expect("extend");
    fdo_store::VoucherStore::insert(&*env.owner_store, &sim.guid, &voucher.to_bytes().expect("encode"))
        .expect("seed owner store");
    let owner = owner_ctx(&env, To2Config::default());

    let hello = HelloDevice {
        max_device_message_size: MTU as u16,
        guid: sim.guid,
        nonce_prove_ov: Nonce::generate(),
        kex_suites: vec!["ECDH256".into()],
        cipher_suites: vec![CipherSuite::A128Gcm as i64],
        sig_info: SigInfo::es256(),
    };
    let resp = send(&owner, MSG_TO2_HELLO_DEVICE, fdo_cbor::to_vec(&hello).expect("encode"), None);
    assert_eq!(resp.msg_type, MSG_TO2_PROVE_OV_HDR);

    // Past the session TTL the token no longer resolves.
    env.clock.advance(31);
    let resp2 = send(
        &owner,
        MSG_TO2_GET_OV_NEXT_ENTRY,
        fdo_cbor::to_vec(&GetOvNextEntry { entry_num: 0 }).expect("encode"),
        Some(&resp.token),
    );
    let err = expect_error(&resp2);
    assert_eq!(err.code, ErrorCode::InvalidToken);
}

#[test]
fn concurrent_to2_sessions_have_independent_tunnels() {
    let env = env();
    let (sim_a, v_a) = DeviceSim::run_di(&env);
    let (sim_b, v_b) = DeviceSim::run_di(&env);
    let owner_pk = env.owner_key.public_key(KeyEncoding::X509).expect("pk");

    let voucher_a = v_a.extend(&env.mfg_key, &owner_pk).expect("extend a");
    let voucher_b = v_b.extend(&env.mfg_key, &owner_pk).expect("extend b");
    fdo_store::VoucherStore::insert(&*env.owner_store, &sim_a.guid, &voucher_a.to_bytes().expect("encode"))
        .expect("seed a");
    fdo_store::VoucherStore::insert(&*env.owner_store, &sim_b.guid, &voucher_b.to_bytes().expect("encode"))
        .expect("seed b");
    let owner = owner_ctx(&env, To2Config::default());

    // Interleave two sessions up to key derivation.
    let open = |sim: &DeviceSim, voucher: &OwnershipVoucher| {
        let nonce = Nonce::generate();
        let hello = HelloDevice {
            max_device_message_size: MTU as u16,
            guid: sim.guid,
            nonce_prove_ov: nonce,
            kex_suites: vec!["ECDH256".into()],
            cipher_suites: vec![CipherSuite::A128Gcm as i64],
            sig_info: SigInfo::es256(),
        };
        let resp = send(&owner, MSG_TO2_HELLO_DEVICE, fdo_cbor::to_vec(&hello).expect("encode"), None);
        assert_eq!(resp.msg_type, MSG_TO2_PROVE_OV_HDR);
        let prove: ProveOvHdr = fdo_cbor::from_slice(&resp.body).expect("decode");
        let sign1 = Sign1::from_bytes(prove.sign1.as_slice()).expect("parse");
        let tail = voucher.current_owner_key().expect("tail");
        let payload_bytes = sign1
            .verify(&VerifyKey::from_public_key(&tail).expect("verifier"), b"")
            .expect("verify");
        let payload: ProveOvHdrPayload = fdo_cbor::from_slice(payload_bytes).expect("decode");
        let kex = device_respond(KexSuite::Ecdh256, &payload.xa_kex, None).expect("kex");
        derive_session_keys(KexSuite::Ecdh256, CipherSuite::A128Gcm, &kex.shared).expect("derive")
    };

    let keys_a = open(&sim_a, &voucher_a);
    let keys_b = open(&sim_b, &voucher_b);
    assert_ne!(keys_a.sek(), keys_b.sek(), "sessions must not share keys");

    // A message sealed for session A cannot be opened with session B's
    // keys.
    let sealed = encrypt0::seal(CipherSuite::A128Gcm, &keys_a, None, b"session a", b"").expect("seal");
    assert!(encrypt0::open(CipherSuite::A128Gcm, &keys_b, &sealed, b"").is_err());
}
