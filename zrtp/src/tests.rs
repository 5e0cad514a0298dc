use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::application::*;
use crate::cache::{CacheEntry, CachedSecret, FileCache, SecretCache};
use crate::crypto_impl::TestCrypto;
use crate::kdf::{kdf, SecretBuf};
use crate::packet::{frame, preparse, Message, MessageType, SasRelayBody};
use crate::profile::{LicenseMode, Profile, SignalingRole};
use crate::proto::*;
use crate::protocol::seal_body;
use crate::registry::*;
use crate::result::{AttackType, Error, ProtocolError};
use crate::session::*;
use crate::{Config, Context, PacketAction};

type Handle = StreamHandle<TestCrypto>;

struct Endpoint {
    ctx: Context<TestCrypto>,
    cache: Arc<FileCache>,
    time: Cell<i64>,
    outbox: RefCell<Vec<Vec<u8>>>,
    sent: RefCell<Vec<MessageType>>,
    events: RefCell<Vec<ProtocolEvent>>,
    security: RefCell<Vec<SecurityEvent>>,
    secure_count: Cell<u32>,
    cache_failures: Cell<u32>,
}

impl Endpoint {
    fn new(license: LicenseMode, is_mitm: bool, id: u8) -> Self {
        let cache = Arc::new(FileCache::in_memory());
        Self::with_cache(license, is_mitm, id, cache.clone(), cache)
    }

    fn with_cache(license: LicenseMode, is_mitm: bool, id: u8, cache: Arc<FileCache>, store: Arc<dyn SecretCache>) -> Self {
        let mut config = Config::new([id; ZID_SIZE]);
        config.license = license;
        config.is_mitm = is_mitm;
        config.cache = Some(store);
        Self {
            ctx: Context::new(config, rand_core::OsRng).unwrap(),
            cache,
            time: Cell::new(1000),
            outbox: RefCell::new(Vec::new()),
            sent: RefCell::new(Vec::new()),
            events: RefCell::new(Vec::new()),
            security: RefCell::new(Vec::new()),
            secure_count: Cell::new(0),
            cache_failures: Cell::new(0),
        }
    }

    fn start(&self, profile: Option<Profile>, ssrc: u32) -> (Arc<Session<TestCrypto>>, Handle) {
        let session = self.ctx.session_init(profile, SignalingRole::Unknown, 0).unwrap();
        let handle = self.ctx.stream_attach(&session).unwrap();
        self.ctx.stream_start(self, &handle, ssrc).unwrap();
        (session, handle)
    }

    fn saw(&self, event: ProtocolEvent) -> bool {
        self.events.borrow().contains(&event)
    }

    fn sent(&self, t: MessageType) -> usize {
        self.sent.borrow().iter().filter(|s| **s == t).count()
    }
}

impl ApplicationLayer<TestCrypto> for &Endpoint {
    fn time(&mut self) -> i64 {
        self.time.get()
    }
    fn unix_time(&mut self) -> u32 {
        1_700_000_000 + (self.time.get() / 1000) as u32
    }
    fn send_packet(&mut self, _: &Handle, packet: &[u8]) -> bool {
        if let Ok(m) = preparse(packet).and_then(|p| Message::decode(p.message)) {
            self.sent.borrow_mut().push(m.message_type());
        }
        self.outbox.borrow_mut().push(packet.to_vec());
        true
    }
    fn on_protocol_event(&mut self, _: &Handle, event: ProtocolEvent) {
        self.events.borrow_mut().push(event);
    }
    fn on_security_event(&mut self, _: &Handle, event: SecurityEvent) {
        self.security.borrow_mut().push(event);
    }
    fn on_is_secure(&mut self, _: &Handle) {
        self.secure_count.set(self.secure_count.get() + 1);
    }
    #[cfg(feature = "logging")]
    fn event_log(&mut self, event: crate::LogEvent<'_, TestCrypto>) {
        if matches!(event, crate::LogEvent::CacheWriteFailed(_)) {
            self.cache_failures.set(self.cache_failures.get() + 1);
        }
    }
}

/// Keeps records in memory but fails every Preshared counter update.
struct StuckCounters(Arc<FileCache>);

impl SecretCache for StuckCounters {
    fn get(&self, a: &Zid, b: &Zid, previous: bool) -> Option<CachedSecret> {
        self.0.get(a, b, previous)
    }
    fn put(&self, a: &Zid, b: &Zid, secret: &CachedSecret) -> Result<(), Error> {
        self.0.put(a, b, secret)
    }
    fn get_mitm(&self, a: &Zid, b: &Zid) -> Option<CachedSecret> {
        self.0.get_mitm(a, b)
    }
    fn put_mitm(&self, a: &Zid, b: &Zid, secret: &CachedSecret) -> Result<(), Error> {
        self.0.put_mitm(a, b, secret)
    }
    fn get_verified(&self, a: &Zid, b: &Zid) -> Option<bool> {
        self.0.get_verified(a, b)
    }
    fn set_verified(&self, a: &Zid, b: &Zid, verified: bool) -> Result<(), Error> {
        self.0.set_verified(a, b, verified)
    }
    fn get_presh_counter(&self, a: &Zid, b: &Zid) -> Option<u32> {
        self.0.get_presh_counter(a, b)
    }
    fn set_presh_counter(&self, _: &Zid, _: &Zid, _: u32) -> Result<(), Error> {
        Err(Error::PersistenceFailure(std::io::ErrorKind::PermissionDenied))
    }
    fn get_secure_since(&self, a: &Zid, b: &Zid) -> Option<u32> {
        self.0.get_secure_since(a, b)
    }
    fn foreach(&self, mitm: bool, visitor: &mut dyn FnMut(&CacheEntry) -> bool) {
        self.0.foreach(mitm, visitor)
    }
    fn store(&self) -> Result<(), Error> {
        self.0.store()
    }
}

/// Exchange packets until both sides fall silent. `filter` sees every packet with `true` if
/// it comes from `a`, and drops it by returning false.
fn pump_filtered(a: &Endpoint, ha: &Handle, b: &Endpoint, hb: &Handle, filter: &mut dyn FnMut(bool, &mut Vec<u8>) -> bool) -> Vec<Error> {
    let mut errors = Vec::new();
    for _ in 0..64 {
        if a.outbox.borrow().is_empty() && b.outbox.borrow().is_empty() {
            break;
        }
        for (from_a, src, dst, handle) in [(true, a, b, hb), (false, b, a, ha)] {
            let packets = std::mem::take(&mut *src.outbox.borrow_mut());
            for mut p in packets {
                if !filter(from_a, &mut p) {
                    continue;
                }
                match dst.ctx.process_srtp(dst, handle, &mut p) {
                    Ok(action) => assert_eq!(action, PacketAction::Drop),
                    Err(e) => errors.push(e),
                }
            }
        }
    }
    errors
}

fn pump(a: &Endpoint, ha: &Handle, b: &Endpoint, hb: &Handle) -> Vec<Error> {
    pump_filtered(a, ha, b, hb, &mut |_, _| true)
}

fn rtp(seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut p = vec![0x80, 0x00];
    p.extend_from_slice(&seq.to_be_bytes());
    p.extend_from_slice(&160u32.to_be_bytes());
    p.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    p.extend_from_slice(payload);
    p
}

fn with_preshared(license: LicenseMode) -> Profile {
    let mut p = Profile::default_for(license);
    p.pk_schemes.push(PkType::Preshared);
    p
}

fn message_of(packet: &[u8]) -> Option<Message> {
    preparse(packet).and_then(|p| Message::decode(p.message)).ok()
}

#[test]
fn dh_handshake_agrees_on_sas_and_keys() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let (sa, ha) = a.start(None, 0xa);
    let (sb, hb) = b.start(None, 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());

    assert_eq!(ha.state(), StreamState::Secure);
    assert_eq!(hb.state(), StreamState::Secure);
    let (ia, ib) = (a.ctx.session_get(&sa), b.ctx.session_get(&sb));
    assert!(ia.sas_is_ready && ib.sas_is_ready);
    assert_eq!((&ia.sas1, &ia.sas2, ia.sas_bin), (&ib.sas1, &ib.sas2, ib.sas_bin));
    assert_eq!(ia.peer_zid, Some([2u8; ZID_SIZE]));
    assert_eq!(ib.peer_zid, Some([1u8; ZID_SIZE]));
    assert_eq!(ia.peer_client_id, DEFAULT_CLIENT_ID);
    assert_eq!((ia.pk, ia.cipher, ia.auth_tag, ia.sas_scheme), (ib.pk, ib.cipher, ib.auth_tag, ib.sas_scheme));
    assert_eq!(ia.cached, 0);
    assert_eq!(a.ctx.stream_get(&ha).unwrap().mode, StreamMode::Dh);
    for e in [&a, &b] {
        assert!(e.saw(ProtocolEvent::IsSecure) && e.saw(ProtocolEvent::IsSecureDone));
        assert_eq!(e.secure_count.get(), 1);
        assert!(e.security.borrow().is_empty());
    }

    let plain = rtp(7, b"twenty bytes of audio");
    let mut p = plain.clone();
    assert_eq!(a.ctx.process_rtp(&ha, &mut p), Ok(PacketAction::Forward));
    assert_ne!(p, plain);
    assert_eq!(b.ctx.process_srtp(&b, &hb, &mut p), Ok(PacketAction::Forward));
    assert_eq!(p, plain);
    let mut p = plain.clone();
    assert_eq!(b.ctx.process_rtp(&hb, &mut p), Ok(PacketAction::Forward));
    assert_eq!(a.ctx.process_srtp(&a, &ha, &mut p), Ok(PacketAction::Forward));
    assert_eq!(p, plain);

    // Neither profile allows going clear.
    assert_eq!(a.ctx.stream_clear(&a, &ha), Err(Error::WrongState));

    // Both sides stored the same retained secret.
    let ra = a.cache.get(&[1u8; ZID_SIZE], &[2u8; ZID_SIZE], false).unwrap();
    let rb = b.cache.get(&[2u8; ZID_SIZE], &[1u8; ZID_SIZE], false).unwrap();
    assert_eq!(ra.value, rb.value);
}

#[test]
fn sas_is_derived_from_session_key() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let (sa, ha) = a.start(None, 0xa);
    let (sb, hb) = b.start(None, 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());

    for (session, handle) in [(&sa, &ha), (&sb, &hb)] {
        let inner = handle.stream().inner.lock().unwrap();
        let st = session.state.lock().unwrap();
        assert!(!st.zrtpsess.is_empty());
        let expected = kdf::<TestCrypto>(st.negotiated.hash, st.zrtpsess.as_bytes(), LABEL_SAS, &inner.kdf_context, SAS_HASH_SIZE);
        assert_eq!(st.sas_hash.as_ref().map(|h| &h[..]), Some(expected.as_bytes()));
    }
    assert_eq!(sa.state.lock().unwrap().sas_hash, sb.state.lock().unwrap().sas_hash);
}

#[test]
fn second_stream_joins_in_multistream_mode() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let (sa, ha) = a.start(None, 0xa);
    let (sb, hb) = b.start(None, 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());
    let sas = a.ctx.session_get(&sa).sas1;
    a.sent.borrow_mut().clear();
    b.sent.borrow_mut().clear();

    let ha2 = a.ctx.stream_attach(&sa).unwrap();
    let hb2 = b.ctx.stream_attach(&sb).unwrap();
    a.ctx.stream_start(&a, &ha2, 0xa2).unwrap();
    b.ctx.stream_start(&b, &hb2, 0xb2).unwrap();
    assert!(pump(&a, &ha2, &b, &hb2).is_empty());

    assert_eq!(ha2.state(), StreamState::Secure);
    assert_eq!(hb2.state(), StreamState::Secure);
    assert_eq!(a.ctx.stream_get(&ha2).unwrap().mode, StreamMode::Multistream);
    assert_eq!(b.ctx.stream_get(&hb2).unwrap().mode, StreamMode::Multistream);
    assert!(a.sent(MessageType::Commit) + b.sent(MessageType::Commit) >= 1);
    for e in [&a, &b] {
        assert_eq!(e.sent(MessageType::DhPart1) + e.sent(MessageType::DhPart2), 0);
    }
    assert_eq!(a.ctx.session_get(&sa).sas1, sas);
    assert_eq!(b.ctx.session_get(&sb).sas1, sas);

    let plain = rtp(3, b"second stream audio");
    let mut p = plain.clone();
    assert_eq!(a.ctx.process_rtp(&ha2, &mut p), Ok(PacketAction::Forward));
    assert_ne!(p, plain);
    assert_eq!(b.ctx.process_srtp(&b, &hb2, &mut p), Ok(PacketAction::Forward));
    assert_eq!(p, plain);
    let mut p = plain.clone();
    assert_eq!(b.ctx.process_rtp(&hb2, &mut p), Ok(PacketAction::Forward));
    assert_ne!(p, plain);
    assert_eq!(a.ctx.process_srtp(&a, &ha2, &mut p), Ok(PacketAction::Forward));
    assert_eq!(p, plain);

    // The first stream keeps its own keys.
    assert_eq!(ha.state(), StreamState::Secure);
    assert_eq!(hb.state(), StreamState::Secure);
}

#[test]
fn failed_counter_update_is_logged() {
    let cache = Arc::new(FileCache::in_memory());
    let a = Endpoint::with_cache(LicenseMode::Active, false, 1, cache.clone(), Arc::new(StuckCounters(cache)));
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let (_sa, ha) = a.start(None, 0xa);
    let (_sb, hb) = b.start(None, 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());

    assert_eq!(ha.state(), StreamState::Secure);
    assert!(a.cache.get(&[1u8; ZID_SIZE], &[2u8; ZID_SIZE], false).is_some());
    assert_eq!(a.cache.get_presh_counter(&[1u8; ZID_SIZE], &[2u8; ZID_SIZE]), Some(0));
    // A first call has no verified flag to clear yet, which is not a failure.
    assert_eq!(b.cache_failures.get(), 0);
    #[cfg(feature = "logging")]
    assert_eq!(a.cache_failures.get(), 1);
}

#[test]
fn crossing_commits_leave_one_initiator() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let (_sa, ha) = a.start(None, 0xa);
    let (_sb, hb) = b.start(None, 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());

    assert_eq!(a.sent(MessageType::Commit), 1);
    assert_eq!(b.sent(MessageType::Commit), 1);
    let initiators = [&ha, &hb].iter().filter(|h| h.stream().inner.lock().unwrap().is_initiator).count();
    assert_eq!(initiators, 1);
    // Only the Responder sends DHPart1.
    assert_eq!(a.sent(MessageType::DhPart1) + b.sent(MessageType::DhPart1), 1);
    assert_eq!(ha.state(), StreamState::Secure);
    assert_eq!(hb.state(), StreamState::Secure);
}

#[test]
fn passive_peer_is_committed_to_by_unlimited_peer() {
    let a = Endpoint::new(LicenseMode::Unlimited, false, 1);
    let b = Endpoint::new(LicenseMode::Passive, false, 2);
    let (_sa, ha) = a.start(None, 0xa);
    let (_sb, hb) = b.start(None, 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());

    assert_eq!(b.sent(MessageType::Commit), 0);
    assert!(b.saw(ProtocolEvent::IsPassiveRestriction));
    assert!(ha.stream().inner.lock().unwrap().is_initiator);
    assert_eq!(ha.state(), StreamState::Secure);
    assert_eq!(hb.state(), StreamState::Secure);
    assert!(b.ctx.stream_get(&hb).unwrap().peer_passive == false);
    assert!(a.ctx.stream_get(&ha).unwrap().peer_passive);
}

#[test]
fn preshared_call_skips_dh() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let (sa, ha) = a.start(Some(with_preshared(LicenseMode::Active)), 0xa);
    let (sb, hb) = b.start(Some(with_preshared(LicenseMode::Active)), 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());
    assert_eq!(a.ctx.stream_get(&ha).unwrap().mode, StreamMode::Dh);
    a.ctx.verified_set(&sa, true).unwrap();
    b.ctx.verified_set(&sb, true).unwrap();
    a.sent.borrow_mut().clear();
    b.sent.borrow_mut().clear();

    let (sa2, ha2) = a.start(Some(with_preshared(LicenseMode::Active)), 0xa2);
    let (sb2, hb2) = b.start(Some(with_preshared(LicenseMode::Active)), 0xb2);
    assert!(pump(&a, &ha2, &b, &hb2).is_empty());

    assert_eq!(ha2.state(), StreamState::Secure);
    assert_eq!(hb2.state(), StreamState::Secure);
    assert_eq!(a.ctx.stream_get(&ha2).unwrap().mode, StreamMode::Preshared);
    assert_eq!(b.ctx.stream_get(&hb2).unwrap().mode, StreamMode::Preshared);
    for e in [&a, &b] {
        assert_eq!(e.sent(MessageType::DhPart1) + e.sent(MessageType::DhPart2), 0);
    }
    let (ia, ib) = (a.ctx.session_get(&sa2), b.ctx.session_get(&sb2));
    assert_eq!(ia.pk, Some(PkType::Preshared));
    assert_eq!(ia.sas1, ib.sas1);
    assert!(ia.sas_is_verified && ib.sas_is_verified);
    assert_eq!(a.cache.get_presh_counter(&[1u8; ZID_SIZE], &[2u8; ZID_SIZE]), Some(1));

    let plain = rtp(1, b"preshared media");
    let mut p = plain.clone();
    assert_eq!(b.ctx.process_rtp(&hb2, &mut p), Ok(PacketAction::Forward));
    assert_eq!(a.ctx.process_srtp(&a, &ha2, &mut p), Ok(PacketAction::Forward));
    assert_eq!(p, plain);
}

#[test]
fn preshared_mismatch_falls_back_to_dh() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let (sa, ha) = a.start(Some(with_preshared(LicenseMode::Active)), 0xa);
    let (sb, hb) = b.start(Some(with_preshared(LicenseMode::Active)), 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());
    a.ctx.verified_set(&sa, true).unwrap();
    b.ctx.verified_set(&sb, true).unwrap();

    // B lost its copy of the retained secret: its newest one no longer matches A's.
    let bogus = CachedSecret { value: SecretBuf::from_slice(&[0x55; 32]), last_used: 1_700_000_000, ttl: CACHE_TTL_FOREVER };
    b.cache.put(&[2u8; ZID_SIZE], &[1u8; ZID_SIZE], &bogus).unwrap();
    a.sent.borrow_mut().clear();
    b.sent.borrow_mut().clear();

    let (sa2, ha2) = a.start(Some(with_preshared(LicenseMode::Active)), 0xa2);
    let (sb2, hb2) = b.start(Some(with_preshared(LicenseMode::Active)), 0xb2);
    assert!(pump(&a, &ha2, &b, &hb2).is_empty());

    assert_eq!(ha2.state(), StreamState::Secure);
    assert_eq!(hb2.state(), StreamState::Secure);
    assert_eq!(a.ctx.stream_get(&ha2).unwrap().mode, StreamMode::Dh);
    assert_eq!(b.ctx.stream_get(&hb2).unwrap().mode, StreamMode::Dh);
    // Exactly one DH Commit was sent after the Preshared ones collided or failed.
    assert_eq!(a.sent(MessageType::DhPart1) + b.sent(MessageType::DhPart1), 1);
    // The side that rejected the key forgot all of its cached secrets, so it expects no match.
    let info = if ha2.stream().inner.lock().unwrap().is_initiator { a.ctx.session_get(&sa2) } else { b.ctx.session_get(&sb2) };
    assert_eq!((info.cached, info.wrongs), (0, 0));
}

#[test]
fn zero_cache_ttl_keeps_no_retained_secret() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let mut profile = Profile::default_for(LicenseMode::Active);
    profile.cache_ttl = 0;
    let (sa, ha) = a.start(Some(profile.clone()), 0xa);
    let (_sb, hb) = b.start(Some(profile), 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());

    assert_eq!(ha.state(), StreamState::Secure);
    assert_eq!(hb.state(), StreamState::Secure);
    assert!(a.cache.get(&[1u8; ZID_SIZE], &[2u8; ZID_SIZE], false).is_none());
    assert!(b.cache.get(&[2u8; ZID_SIZE], &[1u8; ZID_SIZE], false).is_none());
    let st = sa.state.lock().unwrap();
    assert_eq!(st.secrets.cached & SECRET_BIT_RS1, 0);
    assert!(!st.secrets.rs1.cached);
}

#[test]
fn go_clear_wipes_keys_on_both_sides() {
    let mut profile = Profile::default_for(LicenseMode::Active);
    profile.allowclear = true;
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let (_sa, ha) = a.start(Some(profile.clone()), 0xa);
    let (_sb, hb) = b.start(Some(profile), 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());
    assert!(a.ctx.stream_get(&ha).unwrap().allowclear);

    a.ctx.stream_clear(&a, &ha).unwrap();
    assert_eq!(ha.state(), StreamState::InitiatingClear);
    assert!(pump(&a, &ha, &b, &hb).is_empty());
    assert_eq!(ha.state(), StreamState::Clear);
    assert_eq!(hb.state(), StreamState::PendingClear);
    assert!(b.saw(ProtocolEvent::IsPendingClear));

    // Media is held back until the user accepts.
    let mut p = rtp(3, b"not yet");
    assert_eq!(b.ctx.process_rtp(&hb, &mut p), Ok(PacketAction::Drop));

    b.ctx.stream_clear(&b, &hb).unwrap();
    assert_eq!(hb.state(), StreamState::Clear);
    for h in [&ha, &hb] {
        assert!(h.stream().inner.lock().unwrap().is_crypto_wiped());
        assert!(h.stream().media.lock().unwrap().is_none());
    }
    let plain = rtp(4, b"clear again");
    let mut p = plain.clone();
    assert_eq!(a.ctx.process_rtp(&ha, &mut p), Ok(PacketAction::Forward));
    assert_eq!(p, plain);
    assert!(a.saw(ProtocolEvent::IsClear) && b.saw(ProtocolEvent::IsClear));
}

#[test]
fn sas_relay_from_non_mitm_is_rejected() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let (sa, ha) = a.start(None, 0xa);
    let (_sb, hb) = b.start(None, 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());

    // A is not a MiTM so the API refuses, forge the message by hand instead.
    assert_eq!(a.ctx.update_remote_options(&a, &ha, SasType::Base32, None), Err(Error::WrongState));
    let hash = sa.state.lock().unwrap().negotiated.hash;
    let mut packet = {
        let mut s = ha.stream().inner.lock().unwrap();
        let body = SasRelayBody { flags: 0, rendering: *SasType::Base32.wire_code(), sas_hash: [7u8; SAS_HASH_SIZE] };
        let sealed = seal_body(&s, hash, [3u8; CFB_IV_SIZE], body.encode()).unwrap();
        s.seq = s.seq.wrapping_add(1);
        frame(s.seq, s.ssrc, &Message::SasRelay(sealed).encode())
    };
    let r = b.ctx.process_srtp(&b, &hb, &mut packet);
    assert!(matches!(r, Err(Error::PossibleAttack { error: AttackType::UntrustedSasRelay, .. })));
    assert!(b.security.borrow().contains(&SecurityEvent::MitmWarning));
    assert!(!b.saw(ProtocolEvent::RemoteSasUpdated));
    assert_eq!(hb.state(), StreamState::Secure);
}

#[test]
fn trusted_mitm_updates_remote_sas() {
    let a = Endpoint::new(LicenseMode::Active, true, 1);
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let (_sa, ha) = a.start(None, 0xa);
    let (sb, hb) = b.start(None, 0xb);
    assert!(pump(&a, &ha, &b, &hb).is_empty());
    assert!(b.ctx.stream_get(&hb).unwrap().peer_mitm);
    assert_eq!(b.ctx.stream_get(&hb).unwrap().mitm_mode, MitmMode::Client);
    let before = b.ctx.session_get(&sb);
    assert_eq!(before.sas_scheme, SasType::Base256);

    a.ctx.update_remote_options(&a, &ha, SasType::Base32, None).unwrap();
    assert_eq!(ha.state(), StreamState::SasRelaying);
    assert!(pump(&a, &ha, &b, &hb).is_empty());

    assert_eq!(ha.state(), StreamState::Secure);
    assert!(a.saw(ProtocolEvent::LocalSasUpdated));
    assert!(b.saw(ProtocolEvent::RemoteSasUpdated));
    let after = b.ctx.session_get(&sb);
    assert_eq!(after.sas_scheme, SasType::Base32);
    assert_eq!(after.sas_bin, before.sas_bin);
    assert_ne!(after.sas1, before.sas1);
    // Relaying another leg's SAS needs an enrolled PBX secret.
    assert!(b.security.borrow().is_empty());
}

#[test]
fn no_zrtp_after_hello_budget() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let (_sa, ha) = a.start(None, 0xa);
    for _ in 0..100 {
        if ha.state() == StreamState::NoZrtp {
            break;
        }
        a.time.set(a.time.get() + 10_000);
        a.ctx.service(&a);
    }
    assert_eq!(ha.state(), StreamState::NoZrtp);
    assert_eq!(a.sent(MessageType::Hello) as u32, <TestCrypto as CryptoLayer>::SETTINGS.t1_max_count);
    assert!(a.saw(ProtocolEvent::NoZrtpQuick));
    assert!(a.saw(ProtocolEvent::NoZrtp));
    assert_eq!(a.ctx.next_service_time(), i64::MAX);

    // Media flows untouched and the stream may be restarted.
    let plain = rtp(1, b"plain");
    let mut p = plain.clone();
    assert_eq!(a.ctx.process_rtp(&ha, &mut p), Ok(PacketAction::Forward));
    assert_eq!(p, plain);
    a.ctx.stream_start(&a, &ha, 0xa).unwrap();
    assert_eq!(ha.state(), StreamState::Start);
}

#[test]
fn hello_retransmission_backs_off() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let (_sa, _ha) = a.start(None, 0xa);
    assert_eq!(a.sent(MessageType::Hello), 1);
    let t1 = <TestCrypto as CryptoLayer>::SETTINGS.t1_ms;
    assert_eq!(a.ctx.next_service_time(), a.time.get() + t1);
    a.time.set(a.time.get() + t1 - 1);
    a.ctx.service(&a);
    assert_eq!(a.sent(MessageType::Hello), 1);
    a.time.set(a.time.get() + 1);
    let next = a.ctx.service(&a);
    assert_eq!(a.sent(MessageType::Hello), 2);
    assert_eq!(next, a.time.get() + 2 * t1);
}

#[test]
fn broken_hash_chain_is_an_attack() {
    let a = Endpoint::new(LicenseMode::Unlimited, false, 1);
    let b = Endpoint::new(LicenseMode::Passive, false, 2);
    let (_sa, ha) = a.start(None, 0xa);
    let (_sb, hb) = b.start(None, 0xb);
    let mut tamper = |from_a: bool, packet: &mut Vec<u8>| {
        if let (false, Some(Message::DhPart1(mut d))) = (from_a, message_of(packet)) {
            let p = preparse(packet).unwrap();
            let (seq, ssrc) = (p.seq, p.ssrc);
            d.h1[0] ^= 1;
            *packet = frame(seq, ssrc, &Message::DhPart1(d).encode());
        }
        true
    };
    let errors = pump_filtered(&a, &ha, &b, &hb, &mut tamper);

    assert!(matches!(errors.first(), Some(Error::PossibleAttack { error: AttackType::HashChainMismatch, .. })));
    assert!(a.security.borrow().contains(&SecurityEvent::WrongMessageHmac));
    assert!(a.security.borrow().contains(&SecurityEvent::ProtocolError(ProtocolError::WrongMessageHash)));
    assert_eq!(ha.state(), StreamState::Error);
    assert_eq!(hb.state(), StreamState::PendingError);
    assert!(ha.stream().inner.lock().unwrap().is_crypto_wiped());
    assert_eq!(a.ctx.stream_get(&ha).unwrap().last_error, ProtocolError::WrongMessageHash);
}

#[test]
fn error_in_error_state_is_acknowledged() {
    let a = Endpoint::new(LicenseMode::Unlimited, false, 1);
    let b = Endpoint::new(LicenseMode::Passive, false, 2);
    let (_sa, ha) = a.start(None, 0xa);
    let (_sb, hb) = b.start(None, 0xb);
    let mut tamper = |from_a: bool, packet: &mut Vec<u8>| {
        if let (false, Some(Message::DhPart1(mut d))) = (from_a, message_of(packet)) {
            let p = preparse(packet).unwrap();
            let (seq, ssrc) = (p.seq, p.ssrc);
            d.h1[0] ^= 1;
            *packet = frame(seq, ssrc, &Message::DhPart1(d).encode());
        }
        true
    };
    pump_filtered(&a, &ha, &b, &hb, &mut tamper);
    assert_eq!(ha.state(), StreamState::Error);
    let acks = a.sent(MessageType::ErrorAck);

    let mut packet = {
        let mut s = hb.stream().inner.lock().unwrap();
        s.seq = s.seq.wrapping_add(1);
        frame(s.seq, s.ssrc, &Message::Error(ProtocolError::Timeout.code()).encode())
    };
    assert_eq!(a.ctx.process_srtp(&a, &ha, &mut packet), Ok(PacketAction::Drop));
    assert_eq!(ha.state(), StreamState::PendingError);
    assert_eq!(a.sent(MessageType::ErrorAck), acks + 1);
    assert_eq!(a.ctx.stream_get(&ha).unwrap().last_error, ProtocolError::Timeout);
}

#[test]
fn first_media_packet_confirms_lost_conf2ack() {
    let a = Endpoint::new(LicenseMode::Unlimited, false, 1);
    let b = Endpoint::new(LicenseMode::Passive, false, 2);
    let (_sa, ha) = a.start(None, 0xa);
    let (_sb, hb) = b.start(None, 0xb);
    let mut drop_ack = |from_a: bool, packet: &mut Vec<u8>| from_a || !matches!(message_of(packet), Some(Message::Conf2Ack));
    assert!(pump_filtered(&a, &ha, &b, &hb, &mut drop_ack).is_empty());
    assert_eq!(ha.state(), StreamState::WaitConfirmAck);
    assert_eq!(hb.state(), StreamState::Secure);

    // Media from the Initiator is dropped while it waits.
    let mut p = rtp(1, b"early");
    assert_eq!(a.ctx.process_rtp(&ha, &mut p), Ok(PacketAction::Drop));

    let plain = rtp(9, b"responder audio");
    let mut p = plain.clone();
    assert_eq!(b.ctx.process_rtp(&hb, &mut p), Ok(PacketAction::Forward));
    assert_eq!(a.ctx.process_srtp(&a, &ha, &mut p), Ok(PacketAction::Forward));
    assert_eq!(p, plain);
    assert_eq!(ha.state(), StreamState::Secure);
    assert_eq!(a.secure_count.get(), 1);
}

#[test]
fn stream_slots_and_stale_handles() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let session = a.ctx.session_init(None, SignalingRole::Unknown, 0).unwrap();
    let handles: Vec<Handle> = (0..MAX_STREAMS_PER_SESSION).map(|_| a.ctx.stream_attach(&session).unwrap()).collect();
    assert!(matches!(a.ctx.stream_attach(&session), Err(Error::AllocationFailure)));
    assert!(handles.iter().all(|h| h.state() == StreamState::Active));
    assert_ne!(handles[0].id(), handles[1].id());

    a.ctx.stream_stop(&handles[1]).unwrap();
    assert_eq!(handles[1].state(), StreamState::None);
    assert!(matches!(a.ctx.stream_get(&handles[1]), Err(Error::BadParameter)));
    assert!(matches!(a.ctx.stream_stop(&handles[1]), Err(Error::BadParameter)));

    let reused = a.ctx.stream_attach(&session).unwrap();
    assert!(reused != handles[1]);
    assert!(matches!(a.ctx.stream_start(&a, &handles[1], 1), Err(Error::BadParameter)));
    a.ctx.stream_start(&a, &reused, 1).unwrap();
    assert!(matches!(a.ctx.stream_start(&a, &reused, 1), Err(Error::WrongState)));
}

#[test]
fn ping_is_answered_without_touching_state() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let (_sa, ha) = a.start(None, 0xa);
    a.outbox.borrow_mut().clear();
    let ping = Message::Ping { version: *ZRTP_VERSION, endpoint_hash: [9u8; ENDPOINT_HASH_SIZE] };
    let mut packet = frame(5, 0xbeef, &ping.encode());
    assert_eq!(a.ctx.process_srtp(&a, &ha, &mut packet), Ok(PacketAction::Drop));
    let reply = a.outbox.borrow_mut().pop().unwrap();
    match message_of(&reply) {
        Some(Message::PingAck(ack)) => {
            assert_eq!(ack.peer_endpoint_hash, [9u8; ENDPOINT_HASH_SIZE]);
            assert_eq!(ack.ssrc, 0xbeef);
        }
        other => panic!("expected PingACK, got {:?}", other),
    }
    assert_eq!(ha.state(), StreamState::Start);
}

#[test]
fn signaling_hash_mismatch_is_reported() {
    let a = Endpoint::new(LicenseMode::Active, false, 1);
    let b = Endpoint::new(LicenseMode::Active, false, 2);
    let sa = a.ctx.session_init(None, SignalingRole::Initiator, 0).unwrap();
    let sb = b.ctx.session_init(None, SignalingRole::Responder, 0).unwrap();
    let ha = a.ctx.stream_attach(&sa).unwrap();
    let hb = b.ctx.stream_attach(&sb).unwrap();
    let hash_b = b.ctx.signaling_hash_get(&hb).unwrap();
    assert_eq!(hash_b.len(), 64);
    a.ctx.signaling_hash_set(&ha, &hash_b).unwrap();
    b.ctx.signaling_hash_set(&hb, &"00".repeat(32)).unwrap();
    assert!(matches!(a.ctx.signaling_hash_set(&ha, "zz"), Err(Error::BadParameter)));

    a.ctx.stream_start(&a, &ha, 0xa).unwrap();
    b.ctx.stream_start(&b, &hb, 0xb).unwrap();
    assert!(matches!(a.ctx.signaling_hash_set(&ha, &hash_b), Err(Error::WrongState)));
    assert!(pump(&a, &ha, &b, &hb).is_empty());
    assert!(a.security.borrow().is_empty());
    assert!(b.security.borrow().contains(&SecurityEvent::WrongSignalingHash));
}
