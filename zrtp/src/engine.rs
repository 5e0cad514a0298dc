use std::sync::atomic::Ordering;

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::application::*;
use crate::cache::CachedSecret;
use crate::kdf::{kdf, SecretBuf};
use crate::packet::*;
use crate::profile::{LicenseMode, SignalingRole};
use crate::proto::*;
use crate::protocol::*;
use crate::registry::*;
use crate::result::{attack, AttackType, Error, ProtocolError};
use crate::sas;
use crate::session::*;
use crate::zrtp::{log, ContextInner};
#[cfg(feature = "logging")]
use crate::{DropReason, LogEvent::*};

/// Work that touches another stream and must run once the current stream lock is released.
pub(crate) enum Followup {
    /// The linked stream of a MiTM went secure, push this one to secure if it sits in Clear.
    KickLinked(StreamRef),
    /// A stream of a MiTM went clear, resecure it if the peer of its linked stream is unlimited.
    ResecureIfLinkedUnlimited { stream: StreamRef, link: StreamRef },
}

/// Result of checking a peer's Commit against our own state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum CommitRole {
    Initiator,
    Responder,
    Ignore,
}

/// Everything a state handler needs besides the stream it runs on.
///
/// Handlers are always called with the stream's `inner` lock held, and the locked state is
/// passed alongside as `s`.
pub(crate) struct Env<'a, C: CryptoLayer, App: ApplicationLayer<C>> {
    pub app: &'a mut App,
    pub ctx: &'a ContextInner<C>,
    pub handle: &'a StreamHandle<C>,
    pub now: i64,
    pub unix_now: u32,
    pub followups: Vec<Followup>,
}

impl<'a, C: CryptoLayer, App: ApplicationLayer<C>> Env<'a, C, App> {
    pub fn new(app: &'a mut App, ctx: &'a ContextInner<C>, handle: &'a StreamHandle<C>) -> Self {
        let now = app.time();
        let unix_now = app.unix_time();
        Self { app, ctx, handle, now, unix_now, followups: Vec::new() }
    }

    fn session(&self) -> &'a Session<C> {
        &self.handle.session
    }
    fn stream(&self) -> &'a Stream<C> {
        &self.handle.session.streams[self.handle.slot]
    }
    pub fn event(&mut self, event: ProtocolEvent) {
        self.app.on_protocol_event(self.handle, event);
    }
    fn security(&mut self, event: SecurityEvent) {
        self.app.on_security_event(self.handle, event);
    }

    /// A missing record is not a failure here, there is just nothing to update yet.
    fn cache_updated(&mut self, result: Result<(), Error>) {
        match result {
            Ok(()) | Err(Error::BadParameter) => {}
            Err(_) => {
                log!(self.app, CacheWriteFailed(&self.handle.session));
            }
        }
    }

    pub fn set_state(&mut self, s: &mut StreamInner<C>, to: StreamState) {
        if s.state != to {
            log!(self.app, StateChanged(self.handle, s.state, to));
            s.prev_state = s.state;
            s.state = to;
        }
        self.stream().publish(s);
    }

    fn set_mode(&mut self, s: &mut StreamInner<C>, mode: StreamMode) {
        s.mode = mode;
        self.stream().publish(s);
    }

    fn random<const N: usize>(&self) -> [u8; N] {
        let mut b = [0u8; N];
        self.ctx.random_bytes(&mut b);
        b
    }

    /* Sending */

    fn send(&mut self, s: &mut StreamInner<C>, t: MessageType, resend: bool) -> bool {
        s.seq = s.seq.wrapping_add(1);
        let packet = {
            let stored: &[u8] = match t {
                MessageType::Hello => &s.hello,
                MessageType::Commit => s.commit.as_ref().map_or(&[][..], |c| c.1.as_slice()),
                MessageType::DhPart1 | MessageType::DhPart2 => &s.dhpart,
                MessageType::Confirm1 | MessageType::Confirm2 => &s.confirm,
                MessageType::GoClear => &s.goclear,
                MessageType::SasRelay => &s.sasrelay,
                _ => &[],
            };
            if stored.is_empty() {
                let message = match t {
                    MessageType::HelloAck => Message::HelloAck,
                    MessageType::Conf2Ack => Message::Conf2Ack,
                    MessageType::ErrorAck => Message::ErrorAck,
                    MessageType::ClearAck => Message::ClearAck,
                    MessageType::RelayAck => Message::RelayAck,
                    MessageType::Error => Message::Error(s.last_error.code()),
                    _ => return false,
                };
                frame(s.seq, s.ssrc, &message.encode())
            } else {
                frame(s.seq, s.ssrc, stored)
            }
        };
        if resend {
            log!(self.app, ResentMessage(self.handle, t));
        } else {
            log!(self.app, SentMessage(self.handle, t));
        }
        self.app.send_packet(self.handle, &packet)
    }

    /* Retransmission tasks */

    fn initial_timeout(kind: TaskKind) -> i64 {
        match kind {
            TaskKind::Hello => C::SETTINGS.t1_ms,
            TaskKind::ProcessT1 => C::SETTINGS.process_t1_ms,
            TaskKind::Error | TaskKind::ErrorAck => C::SETTINGS.et_ms,
            _ => C::SETTINGS.t2_ms,
        }
    }

    fn start_task(&mut self, s: &mut StreamInner<C>, kind: TaskKind) {
        *s.task(kind) = RetryTask { enabled: true, retries: 0, timeout: Self::initial_timeout(kind), deadline: self.now };
        self.run_task(s, kind);
    }

    /// Schedule the next run of `kind` and back off its interval.
    fn reschedule_task(&mut self, s: &mut StreamInner<C>, kind: TaskKind) {
        let now = self.now;
        let t = s.task(kind);
        t.deadline = now + t.timeout;
        t.timeout = match kind {
            TaskKind::Hello => (t.timeout * 2).min(C::SETTINGS.t1_cap_ms),
            TaskKind::Commit | TaskKind::DhPart2 | TaskKind::Confirm2 | TaskKind::GoClear | TaskKind::SasRelay => {
                (t.timeout * 2).min(C::SETTINGS.t2_cap_ms)
            }
            _ => t.timeout,
        };
        self.stream().publish(s);
    }

    fn cancel_task(&mut self, s: &mut StreamInner<C>, kind: TaskKind) {
        s.task(kind).enabled = false;
        self.stream().publish(s);
    }

    fn cancel_all(&mut self, s: &mut StreamInner<C>) {
        for t in s.tasks.iter_mut() {
            t.enabled = false;
        }
        self.stream().publish(s);
    }

    /// Fire every task of this stream whose deadline has passed.
    pub fn process_timers(&mut self, s: &mut StreamInner<C>) {
        for kind in TaskKind::ALL {
            let t = *s.task(kind);
            if t.enabled && t.deadline <= self.now {
                self.run_task(s, kind);
            }
        }
        self.stream().publish(s);
    }

    fn run_task(&mut self, s: &mut StreamInner<C>, kind: TaskKind) {
        let settings = &C::SETTINGS;
        let retries = s.task(kind).retries;
        match kind {
            TaskKind::Hello => {
                if retries == settings.no_zrtp_fast_count && !s.hello_received {
                    self.event(ProtocolEvent::NoZrtpQuick);
                }
                let max = if s.state == StreamState::WaitHelloAck { settings.t1_max_count_ext } else { settings.t1_max_count };
                if retries >= max {
                    log!(self.app, RetriesExhausted(self.handle, MessageType::Hello));
                    self.cancel_all(s);
                    self.clear_crypto(s);
                    self.set_state(s, StreamState::NoZrtp);
                    self.event(ProtocolEvent::NoZrtp);
                    return;
                }
                self.send(s, MessageType::Hello, retries > 0);
            }
            TaskKind::ProcessT1 => return self.initiating_secure(s),
            TaskKind::Commit => {
                if self.stream().yield_requested.swap(false, Ordering::AcqRel) {
                    return self.yield_commit(s);
                }
                if retries >= settings.t2_max_count {
                    log!(self.app, RetriesExhausted(self.handle, MessageType::Commit));
                    return self.enter_initiating_error(s, ProtocolError::Timeout, false);
                }
                self.send(s, MessageType::Commit, retries > 0);
            }
            TaskKind::DhPart2 | TaskKind::Confirm2 => {
                let t = if kind == TaskKind::DhPart2 { MessageType::DhPart2 } else { MessageType::Confirm2 };
                if retries >= settings.t2_max_count {
                    log!(self.app, RetriesExhausted(self.handle, t));
                    return self.enter_initiating_error(s, ProtocolError::Timeout, false);
                }
                self.send(s, t, retries > 0);
            }
            TaskKind::GoClear => {
                if retries > settings.t2_max_count {
                    log!(self.app, RetriesExhausted(self.handle, MessageType::GoClear));
                    return self.enter_clear(s);
                }
                self.send(s, MessageType::GoClear, retries > 0);
            }
            TaskKind::SasRelay => {
                if retries > settings.t2_max_count {
                    log!(self.app, RetriesExhausted(self.handle, MessageType::SasRelay));
                    self.cancel_task(s, kind);
                    return self.set_state(s, StreamState::Secure);
                }
                self.send(s, MessageType::SasRelay, retries > 0);
            }
            TaskKind::Error => {
                if retries >= settings.eti_max_count {
                    log!(self.app, RetriesExhausted(self.handle, MessageType::Error));
                    return self.switch_to_error(s);
                }
                self.send(s, MessageType::Error, retries > 0);
            }
            TaskKind::ErrorAck => {
                if retries >= settings.etr_max_count {
                    return self.switch_to_error(s);
                }
                self.send(s, MessageType::ErrorAck, retries > 0);
            }
        }
        s.task(kind).retries += 1;
        self.reschedule_task(s, kind);
    }

    /* State switchers */

    fn clear_crypto(&mut self, s: &mut StreamInner<C>) {
        s.clear_crypto();
        *self.stream().media.lock().unwrap() = None;
        *self.stream().hv.lock().unwrap() = None;
    }

    pub fn switch_to_error(&mut self, s: &mut StreamInner<C>) {
        self.cancel_all(s);
        self.clear_crypto(s);
        self.set_state(s, StreamState::Error);
        self.security(SecurityEvent::ProtocolError(s.last_error));
        self.app.on_not_secure(self.handle);
    }

    /// Report a fatal condition. With `notify` the peer is told through Error messages first.
    pub fn enter_initiating_error(&mut self, s: &mut StreamInner<C>, code: ProtocolError, notify: bool) {
        if matches!(s.state, StreamState::Error | StreamState::InitiatingError | StreamState::PendingError) {
            return;
        }
        s.last_error = code;
        if notify {
            self.cancel_all(s);
            self.set_state(s, StreamState::InitiatingError);
            self.start_task(s, TaskKind::Error);
        } else {
            self.switch_to_error(s);
        }
    }

    fn enter_pending_error(&mut self, s: &mut StreamInner<C>, code: u32) {
        self.cancel_all(s);
        s.last_error = ProtocolError::from_code(code);
        self.set_state(s, StreamState::PendingError);
        self.start_task(s, TaskKind::ErrorAck);
    }

    /// Fire the security event for a failed integrity check and enter the error state.
    fn integrity_failure(&mut self, s: &mut StreamInner<C>, e: Error) -> Result<(), Error> {
        if let Error::PossibleAttack { error: AttackType::HashChainMismatch | AttackType::MessageMacMismatch, .. } = e {
            self.security(SecurityEvent::WrongMessageHmac);
        }
        self.enter_initiating_error(s, protocol_error_of(&e), true);
        Err(e)
    }

    pub fn enter_clear(&mut self, s: &mut StreamInner<C>) {
        let was_secure = matches!(s.state, StreamState::InitiatingClear | StreamState::PendingClear);
        self.cancel_all(s);
        self.clear_crypto(s);
        self.set_mode(s, StreamMode::Clear);
        self.set_state(s, StreamState::Clear);
        self.event(ProtocolEvent::IsClear);
        if was_secure {
            self.app.on_not_secure(self.handle);
        }
        if self.ctx.is_mitm && s.peer_passive {
            if let Some(link) = s.linked_mitm {
                self.followups.push(Followup::ResecureIfLinkedUnlimited { stream: self.handle.as_ref(), link });
            }
        }
    }

    fn ratchet_session_key(&mut self) {
        let mut st = self.session().state.lock().unwrap();
        if !st.zrtpsess.is_empty() {
            let next = st.negotiated.hash.hash::<C>(&[st.zrtpsess.as_bytes()]);
            st.zrtpsess = SecretBuf::from_slice(&next);
        }
    }

    fn enter_pending_clear(&mut self, s: &mut StreamInner<C>) {
        self.cancel_all(s);
        self.set_state(s, StreamState::PendingClear);
        self.ratchet_session_key();
        self.event(ProtocolEvent::IsPendingClear);
    }

    pub fn enter_initiating_clear(&mut self, s: &mut StreamInner<C>) {
        self.cancel_all(s);
        self.set_state(s, StreamState::InitiatingClear);
        self.ratchet_session_key();
        let hash = self.session().state.lock().unwrap().negotiated.hash;
        s.goclear = Message::GoClear(clear_mac::<C>(hash, &s.hmac_key)).encode();
        self.start_task(s, TaskKind::GoClear);
    }

    /* Licensing */

    /// We may send a Commit to this peer.
    pub fn passive1(&self, s: &StreamInner<C>) -> bool {
        let license = self.ctx.license;
        license != LicenseMode::Passive && (license == LicenseMode::Unlimited || !s.peer_passive)
    }
    /// We may accept a Commit in this call.
    fn passive2(&self) -> bool {
        !(self.ctx.license == LicenseMode::Passive && self.session().signaling_role == SignalingRole::Initiator)
    }

    /* Hello */

    pub fn start_hello(&mut self, s: &mut StreamInner<C>) {
        self.start_task(s, TaskKind::Hello);
    }

    /// Returns false if the Hello was ignored.
    fn process_hello(&mut self, s: &mut StreamInner<C>, hello: Hello, raw: &[u8]) -> bool {
        let session = self.session();
        match hello.version.cmp(ZRTP_VERSION) {
            std::cmp::Ordering::Greater => {
                log!(self.app, DroppedPacket(self.handle, DropReason::NewerVersion));
                return false;
            }
            std::cmp::Ordering::Less => {
                self.enter_initiating_error(s, ProtocolError::Version, true);
                return false;
            }
            std::cmp::Ordering::Equal => {}
        }
        if hello.zid == session.zid {
            self.enter_initiating_error(s, ProtocolError::EqualZid, true);
            return false;
        }
        let zid_changed = {
            let mut st = session.state.lock().unwrap();
            match st.peer_zid {
                Some(peer_zid) => peer_zid != hello.zid,
                None => {
                    st.peer_zid = Some(hello.zid);
                    st.peer_client_id = hello.client_id;
                    st.peer_version = hello.version;
                    false
                }
            }
        };
        if zid_changed {
            self.enter_initiating_error(s, ProtocolError::WrongZid, true);
            return false;
        }
        let passive = hello.flags & HELLO_FLAG_PASSIVE != 0;
        let unlimited = hello.flags & HELLO_FLAG_UNLIMITED != 0;
        if passive && unlimited {
            log!(self.app, DroppedPacket(self.handle, DropReason::ConflictingFlags));
            return false;
        }
        if hello.flags & HELLO_FLAG_SIGNATURE != 0 {
            log!(self.app, DroppedPacket(self.handle, DropReason::SignatureRequested));
            return false;
        }
        s.peer_passive = passive;
        s.peer_unlimited = unlimited;
        s.peer_mitm = hello.flags & HELLO_FLAG_MITM != 0;
        if s.peer_mitm && s.mitm_mode == MitmMode::Unknown {
            s.mitm_mode = MitmMode::Client;
        }
        if let Some(expected) = s.signaling_hash {
            if !bool::from(sha256::<C>(&[raw])[..].ct_eq(&expected[..])) {
                self.security(SecurityEvent::WrongSignalingHash);
            }
        }
        s.pk = session.profile.choose_best(&hello.pk).unwrap_or(PkType::Dh3072);
        s.peer_hello = Some((hello, raw.to_vec()));
        s.hello_received = true;
        true
    }

    /// Load the retained and PBX secrets shared with the peer, once per session.
    fn prepare_secrets(&mut self) {
        let session = self.session();
        let mut st = session.state.lock().unwrap();
        if st.secrets.is_ready {
            return;
        }
        let Some(peer_zid) = st.peer_zid else { return };
        let cache = self.ctx.cache.as_deref();
        let load = |cached: Option<CachedSecret>| match cached {
            Some(c) => SharedSecret { value: c.value, last_used: c.last_used, ttl: c.ttl, cached: true },
            None => SharedSecret { value: SecretBuf::from_slice(&self.random::<RETAINED_SECRET_SIZE>()), ..Default::default() },
        };
        let secrets = &mut st.secrets;
        secrets.rs1 = load(cache.and_then(|c| c.get(&session.zid, &peer_zid, false)));
        secrets.rs2 = load(cache.and_then(|c| c.get(&session.zid, &peer_zid, true)));
        secrets.pbx = load(cache.and_then(|c| c.get_mitm(&session.zid, &peer_zid)));
        secrets.aux = load(None);
        secrets.cached = 0;
        for (secret, bit) in [(&secrets.rs1, SECRET_BIT_RS1), (&secrets.rs2, SECRET_BIT_RS2), (&secrets.pbx, SECRET_BIT_PBX)] {
            if secret.cached {
                secrets.cached |= bit;
            }
        }
        secrets.is_ready = true;
        let _cached = secrets.cached;
        drop(st);
        log!(self.app, LoadedSecrets(&self.handle.session, _cached));
    }

    /* Entering the secure handshake */

    pub fn start_initiating_secure(&mut self, s: &mut StreamInner<C>) {
        *s.task(TaskKind::ProcessT1) =
            RetryTask { enabled: true, retries: 0, timeout: C::SETTINGS.process_t1_ms, deadline: self.now };
        self.set_state(s, StreamState::StartInitiatingSecure);
        self.initiating_secure(s);
    }

    /// Start a Commit unless another stream of the session is in the middle of a DH or
    /// Preshared exchange, in which case check again later.
    fn initiating_secure(&mut self, s: &mut StreamInner<C>) {
        if !s.task(TaskKind::ProcessT1).enabled {
            return;
        }
        let session = self.session();
        let guard = session.init_protector.lock().unwrap();
        if s.state <= StreamState::StartInitiatingSecure {
            let mode = self.define_stream_mode(s);
            self.set_mode(s, mode);
        }
        let slot = self.handle.slot;
        let sibling_busy = |(i, other): (usize, &Stream<C>)| i != slot && other.state().is_handshaking() && other.mode().is_full();
        let busy = s.mode.is_full() && session.streams.iter().enumerate().any(sibling_busy);
        if busy {
            let retries = s.task(TaskKind::ProcessT1).retries;
            drop(guard);
            if retries >= C::SETTINGS.process_t1_max_count {
                log!(self.app, RetriesExhausted(self.handle, MessageType::Commit));
                self.enter_initiating_error(s, ProtocolError::Timeout, false);
            } else {
                s.task(TaskKind::ProcessT1).retries += 1;
                self.reschedule_task(s, TaskKind::ProcessT1);
            }
            return;
        }
        self.cancel_task(s, TaskKind::ProcessT1);
        if let Err(e) = self.enter_initiating_secure(s) {
            drop(guard);
            self.enter_initiating_error(s, protocol_error_of(&e), true);
        }
    }

    /// Multistream if the session already has a key, Preshared if both sides kept a verified
    /// retained secret, DH otherwise.
    fn define_stream_mode(&self, s: &StreamInner<C>) -> StreamMode {
        let session = self.session();
        let profile = &session.profile;
        let Some((hello, _)) = &s.peer_hello else { return StreamMode::Dh };
        let st = session.state.lock().unwrap();
        if !st.zrtpsess.is_empty() && profile.supports(PkType::Multistream) && peer_offers(hello, PkType::Multistream) {
            return StreamMode::Multistream;
        }
        if profile.supports(PkType::Preshared) && peer_offers(hello, PkType::Preshared) && st.secrets.cached & SECRET_BIT_RS1 != 0 {
            if let (Some(cache), Some(peer_zid)) = (self.ctx.cache.as_deref(), st.peer_zid) {
                let verified = cache.get_verified(&session.zid, &peer_zid).unwrap_or(false);
                let counter = cache.get_presh_counter(&session.zid, &peer_zid).unwrap_or(0);
                if verified && counter < C::SETTINGS.presh_max_count {
                    return StreamMode::Preshared;
                }
            }
        }
        StreamMode::Dh
    }

    fn ensure_key_pair(&self, s: &mut StreamInner<C>, pk: PkType) -> Result<Vec<u8>, Error> {
        if !matches!(&s.key_pair, Some((t, _)) if *t == pk) {
            let mut rng = self.ctx.rng.lock().unwrap();
            let kp = pk.generate::<C>(&mut rng).ok_or(Error::AlgorithmUnsupported(ComponentCategory::PublicKey))?;
            s.key_pair = Some((pk, kp));
        }
        s.key_pair.as_ref().map(|(_, kp)| kp.public_value()).ok_or(Error::CryptoOperationFailure)
    }

    /// Build and send our Commit. We are the Initiator until a better Commit arrives.
    fn enter_initiating_secure(&mut self, s: &mut StreamInner<C>) -> Result<(), Error> {
        let session = self.session();
        let (hello, hello_raw) = s.peer_hello.clone().ok_or(Error::WrongState)?;
        let mut st = session.state.lock().unwrap();
        let n = if s.mode == StreamMode::Multistream { st.negotiated } else { negotiate(&session.profile, &hello) };
        let pk = match s.mode {
            StreamMode::Preshared => PkType::Preshared,
            StreamMode::Multistream => PkType::Multistream,
            _ => s.pk,
        };
        s.is_initiator = true;
        let kind = match s.mode {
            StreamMode::Multistream => CommitKind::Multistream { nonce: self.random() },
            StreamMode::Preshared => {
                let pbx = st.secrets.cached & SECRET_BIT_PBX != 0;
                s.preshared_key = preshared_key_for::<C>(n.hash, &st.secrets, false, pbx);
                CommitKind::Preshared {
                    nonce: self.random(),
                    key_id: crate::kdf::preshared_key_id::<C>(n.hash, s.preshared_key.as_bytes()),
                }
            }
            _ => {
                let pv = self.ensure_key_pair(s, pk)?;
                s.dhpart = build_dhpart(MessageType::DhPart2, s, &st.secrets, n.hash, pv);
                CommitKind::Dh { hvi: hvi::<C>(n.hash, &s.dhpart, &hello_raw) }
            }
        };
        if s.mode.is_full() {
            st.negotiated = n;
        }
        drop(st);

        let mut commit = Commit {
            h2: s.h[2],
            zid: session.zid,
            hash: *n.hash.wire_code(),
            cipher: *n.cipher.wire_code(),
            auth: *n.auth_tag.wire_code(),
            pk: *pk.wire_code(),
            sas: *n.sas.wire_code(),
            kind,
            mac: [0u8; MESSAGE_MAC_SIZE],
        };
        let mut raw = Message::Commit(commit.clone()).encode();
        seal_message::<C>(&s.h[1], &mut raw);
        commit.mac.copy_from_slice(&raw[raw.len() - MESSAGE_MAC_SIZE..]);
        if let CommitKind::Dh { hvi } = &commit.kind {
            *self.stream().hv.lock().unwrap() = Some(*hvi);
        }
        s.commit = Some((commit, raw));
        self.set_state(s, StreamState::InitiatingSecure);
        self.event(ProtocolEvent::IsInitiatingSecure);
        self.start_task(s, TaskKind::Commit);
        Ok(())
    }

    /// A sibling stream accepted the peer's DH Commit, back off and retry once it is done.
    fn yield_commit(&mut self, s: &mut StreamInner<C>) {
        self.cancel_task(s, TaskKind::Commit);
        s.commit = None;
        s.key_pair = None;
        *self.stream().hv.lock().unwrap() = None;
        log!(self.app, DroppedPacket(self.handle, DropReason::LostCommitRace));
        self.start_initiating_secure(s);
    }

    /// Decide which side of a Commit exchange we are on.
    fn preparse_commit(&mut self, s: &mut StreamInner<C>, commit: &Commit) -> Result<CommitRole, Error> {
        let session = self.session();
        let (chain_ok, mac_ok) = match &s.peer_hello {
            Some((hello, raw)) => (verify_chain::<C>(&commit.h2, &hello.h3, 1), verify_message::<C>(&commit.h2, raw)),
            None => return Ok(CommitRole::Ignore),
        };
        if !chain_ok {
            self.integrity_failure(s, attack!(AttackType::HashChainMismatch))?;
        }
        if !mac_ok {
            self.integrity_failure(s, attack!(AttackType::MessageMacMismatch))?;
        }
        if let Err(category) = accept_commit(&session.profile, commit) {
            self.enter_initiating_error(s, ProtocolError::unsupported(category), true);
            return Err(Error::AlgorithmUnsupported(category));
        }
        if let Some((ours, _)) = &s.commit {
            return Ok(if commit_wins(ours, commit) { CommitRole::Initiator } else { CommitRole::Responder });
        }
        match &commit.kind {
            CommitKind::Dh { hvi } => {
                for (i, other) in session.streams.iter().enumerate() {
                    if i == self.handle.slot || other.state() != StreamState::InitiatingSecure {
                        continue;
                    }
                    if let Some(other_hv) = *other.hv.lock().unwrap() {
                        if other_hv > *hvi {
                            log!(self.app, DroppedPacket(self.handle, DropReason::LostCommitRace));
                            return Ok(CommitRole::Ignore);
                        }
                        other.yield_requested.store(true, Ordering::Release);
                    }
                }
            }
            CommitKind::Multistream { .. } => {
                if session.state.lock().unwrap().zrtpsess.is_empty() {
                    return Ok(CommitRole::Initiator);
                }
            }
            CommitKind::Preshared { .. } => {}
        }
        Ok(CommitRole::Responder)
    }

    fn on_commit(&mut self, s: &mut StreamInner<C>, commit: Commit, raw: &[u8]) -> Result<(), Error> {
        match self.preparse_commit(s, &commit)? {
            CommitRole::Responder => {
                self.cancel_all(s);
                self.enter_pending_secure(s, commit, raw)
            }
            CommitRole::Initiator => {
                if s.commit.is_none() {
                    self.cancel_task(s, TaskKind::Hello);
                    self.start_initiating_secure(s);
                }
                Ok(())
            }
            CommitRole::Ignore => Ok(()),
        }
    }

    /// Accept the peer's Commit and answer it as the Responder.
    fn enter_pending_secure(&mut self, s: &mut StreamInner<C>, commit: Commit, raw: &[u8]) -> Result<(), Error> {
        let session = self.session();
        let (n, pk) = accept_commit(&session.profile, &commit).map_err(Error::AlgorithmUnsupported)?;
        self.cancel_all(s);
        s.commit = None;
        *self.stream().hv.lock().unwrap() = None;
        s.is_initiator = false;
        self.set_mode(s, StreamMode::from_pk(pk));
        let key_id = match &commit.kind {
            CommitKind::Preshared { key_id, .. } => Some(*key_id),
            _ => None,
        };
        s.peer_commit = Some((commit, raw.to_vec()));

        let mut st = session.state.lock().unwrap();
        if s.mode.is_full() {
            st.negotiated = n;
        }
        match s.mode {
            StreamMode::Dh => {
                drop(st);
                let pv = self.ensure_key_pair(s, pk)?;
                s.pk = pk;
                let st = session.state.lock().unwrap();
                s.dhpart = build_dhpart(MessageType::DhPart1, s, &st.secrets, n.hash, pv);
                drop(st);
                self.set_state(s, StreamState::PendingSecure);
                self.event(ProtocolEvent::IsPendingSecure);
                self.send(s, MessageType::DhPart1, false);
                return Ok(());
            }
            StreamMode::Preshared => {
                let matched = key_id.and_then(|id| match_preshared_key::<C>(n.hash, &st.secrets, &id));
                match matched {
                    Some((key, bits)) => {
                        s.preshared_key = key;
                        st.secrets.matches |= bits;
                    }
                    None => {
                        // None of our cached secrets is the one the peer has. Forget them and force DH.
                        st.secrets.cached = 0;
                        drop(st);
                        s.peer_commit = None;
                        self.start_initiating_secure(s);
                        return Ok(());
                    }
                }
            }
            _ => {}
        }
        let engine = derive_keys(s, &mut st, &session.zid, None)?;
        drop(st);
        *self.stream().media.lock().unwrap() = Some(engine);
        self.set_state(s, StreamState::WaitConfirm2);
        self.event(ProtocolEvent::IsPendingSecure);
        self.build_confirm(s, MessageType::Confirm1)?;
        self.send(s, MessageType::Confirm1, false);
        Ok(())
    }

    /* DH exchange */

    fn agree(&mut self, s: &mut StreamInner<C>, pv: &[u8]) -> Result<zeroize::Zeroizing<Vec<u8>>, Error> {
        match s.key_pair.as_ref().and_then(|(_, kp)| kp.agree(pv)) {
            Some(dh) => Ok(dh),
            None => {
                self.integrity_failure(s, attack!(AttackType::InvalidPublicValue))?;
                Err(Error::CryptoOperationFailure)
            }
        }
    }

    /// Match the peer's secret ids and derive the keys of a DH stream.
    fn finish_dh(&mut self, s: &mut StreamInner<C>, dh: &[u8]) -> Result<(), Error> {
        let session = self.session();
        let mut st = session.state.lock().unwrap();
        let matched = match &s.peer_dhpart {
            Some((peer_dhpart, _)) => match_secrets::<C>(st.negotiated.hash, &st.secrets, peer_dhpart, s.is_initiator),
            None => return Err(Error::WrongState),
        };
        let lost_rs1 = st.secrets.cached & SECRET_BIT_RS1 != 0 && matched.matches & SECRET_BIT_RS1 == 0;
        st.secrets.matches = matched.matches;
        let engine = derive_keys(s, &mut st, &session.zid, Some((dh, &matched)));
        let peer_zid = st.peer_zid;
        drop(st);
        if lost_rs1 {
            if let (Some(cache), Some(peer_zid)) = (self.ctx.cache.as_deref(), peer_zid) {
                let result = cache.set_verified(&session.zid, &peer_zid, false);
                self.cache_updated(result);
            }
        }
        *self.stream().media.lock().unwrap() = Some(engine?);
        Ok(())
    }

    /// Initiator: the Responder's DHPart1 arrived.
    fn on_dhpart1(&mut self, s: &mut StreamInner<C>, d: DhPart, raw: &[u8]) -> Result<(), Error> {
        let h2 = sha256::<C>(&[&d.h1]);
        let (chain_ok, mac_ok) = match &s.peer_hello {
            Some((hello, raw)) => (verify_chain::<C>(&h2, &hello.h3, 1), verify_message::<C>(&h2, raw)),
            None => return Err(Error::WrongState),
        };
        if !chain_ok {
            return self.integrity_failure(s, attack!(AttackType::HashChainMismatch));
        }
        if !mac_ok {
            return self.integrity_failure(s, attack!(AttackType::MessageMacMismatch));
        }
        let dh = self.agree(s, &d.pv)?;
        s.peer_dhpart = Some((d, raw.to_vec()));
        self.cancel_task(s, TaskKind::Commit);
        if let Err(e) = self.finish_dh(s, &dh) {
            self.enter_initiating_error(s, ProtocolError::Software, true);
            return Err(e);
        }
        self.set_state(s, StreamState::WaitConfirm1);
        self.start_task(s, TaskKind::DhPart2);
        Ok(())
    }

    /// Responder: the Initiator's DHPart2 arrived.
    fn on_dhpart2(&mut self, s: &mut StreamInner<C>, d: DhPart, raw: &[u8]) -> Result<(), Error> {
        let (chain_ok, mac_ok, expected) = match &s.peer_commit {
            Some((commit, raw)) => (
                verify_chain::<C>(&d.h1, &commit.h2, 1),
                verify_message::<C>(&d.h1, raw),
                match commit.kind {
                    CommitKind::Dh { hvi } => hvi,
                    _ => return Err(Error::WrongState),
                },
            ),
            None => return Err(Error::WrongState),
        };
        if !chain_ok {
            return self.integrity_failure(s, attack!(AttackType::HashChainMismatch));
        }
        if !mac_ok {
            return self.integrity_failure(s, attack!(AttackType::MessageMacMismatch));
        }
        let hash = self.session().state.lock().unwrap().negotiated.hash;
        if !bool::from(hvi::<C>(hash, raw, &s.hello)[..].ct_eq(&expected[..])) {
            return self.integrity_failure(s, attack!(AttackType::HviMismatch));
        }
        let dh = self.agree(s, &d.pv)?;
        s.peer_dhpart = Some((d, raw.to_vec()));
        if let Err(e) = self.finish_dh(s, &dh) {
            self.enter_initiating_error(s, ProtocolError::Software, true);
            return Err(e);
        }
        self.build_confirm(s, MessageType::Confirm1)?;
        self.set_state(s, StreamState::WaitConfirm2);
        self.send(s, MessageType::Confirm1, false);
        Ok(())
    }

    /* Confirm */

    fn build_confirm(&mut self, s: &mut StreamInner<C>, t: MessageType) -> Result<(), Error> {
        let session = self.session();
        let profile = &session.profile;
        let (hash, peer_zid) = {
            let st = session.state.lock().unwrap();
            (st.negotiated.hash, st.peer_zid)
        };
        let verified = match (self.ctx.cache.as_deref(), peer_zid) {
            (Some(cache), Some(peer_zid)) => cache.get_verified(&session.zid, &peer_zid).unwrap_or(false),
            _ => false,
        };
        let mut flags = 0;
        if profile.disclose_bit {
            flags |= CONFIRM_FLAG_DISCLOSE;
        }
        if profile.allowclear {
            flags |= CONFIRM_FLAG_ALLOWCLEAR;
        }
        if verified {
            flags |= CONFIRM_FLAG_VERIFIED;
        }
        if s.mitm_mode == MitmMode::RegServer {
            flags |= CONFIRM_FLAG_ENROLLMENT;
        }
        let body = ConfirmBody { h0: s.h[0], flags, expire: profile.cache_ttl }.encode();
        let sealed = seal_body(s, hash, self.random(), body)?;
        s.confirm = if t == MessageType::Confirm1 { Message::Confirm1(sealed) } else { Message::Confirm2(sealed) }.encode();
        Ok(())
    }

    /// Verify and apply the peer's Confirm.
    fn process_confirm(&mut self, s: &mut StreamInner<C>, sealed: &Sealed) -> Result<(), Error> {
        let session = self.session();
        let (hash, peer_zid) = {
            let st = session.state.lock().unwrap();
            (st.negotiated.hash, st.peer_zid)
        };
        let body = match open_body(s, hash, sealed) {
            Ok(b) => ConfirmBody::decode(&b),
            Err(e) => {
                if let Error::PossibleAttack { .. } = e {
                    self.security(SecurityEvent::WrongMessageHmac);
                }
                self.enter_initiating_error(s, ProtocolError::AuthDecrypt, true);
                return Err(e);
            }
        };
        let h0 = body.h0;
        let chain_ok = match (s.mode, s.is_initiator) {
            (StreamMode::Dh, _) => s
                .peer_dhpart
                .as_ref()
                .map_or(false, |(d, raw)| verify_chain::<C>(&h0, &d.h1, 1) && verify_message::<C>(&h0, raw)),
            (_, true) => s.peer_hello.as_ref().map_or(false, |(h, raw)| {
                verify_chain::<C>(&h0, &h.h3, 3) && verify_message::<C>(&sha256::<C>(&[&sha256::<C>(&[&h0])]), raw)
            }),
            (_, false) => s.peer_commit.as_ref().map_or(false, |(c, raw)| {
                verify_chain::<C>(&h0, &c.h2, 2) && verify_message::<C>(&sha256::<C>(&[&h0]), raw)
            }),
        };
        if !chain_ok {
            return self.integrity_failure(s, attack!(AttackType::HashChainMismatch));
        }

        s.peer_disclose = body.flags & CONFIRM_FLAG_DISCLOSE != 0;
        s.allowclear = body.flags & CONFIRM_FLAG_ALLOWCLEAR != 0 && session.profile.allowclear;
        if body.flags & CONFIRM_FLAG_VERIFIED == 0 {
            if let (Some(cache), Some(peer_zid)) = (self.ctx.cache.as_deref(), peer_zid) {
                let result = cache.set_verified(&session.zid, &peer_zid, false);
                self.cache_updated(result);
            }
        }
        if body.flags & CONFIRM_FLAG_ENROLLMENT != 0 {
            if s.mitm_mode != MitmMode::Client {
                self.enter_initiating_error(s, ProtocolError::InvalidPacket, true);
                return Err(Error::MalformedPacket);
            }
            if self.ctx.license != LicenseMode::Passive {
                s.mitm_mode = MitmMode::RegClient;
            }
        }
        s.cache_ttl = session.profile.cache_ttl.min(body.expire);
        Ok(())
    }

    /// Initiator: Confirm1 arrived, answer with Confirm2.
    fn on_confirm1(&mut self, s: &mut StreamInner<C>, sealed: Sealed) -> Result<(), Error> {
        if s.mode != StreamMode::Dh {
            // Fast modes derive their keys only now, the Confirm1 acknowledges our Commit.
            let session = self.session();
            let mut st = session.state.lock().unwrap();
            let engine = derive_keys(s, &mut st, &session.zid, None);
            drop(st);
            match engine {
                Ok(engine) => *self.stream().media.lock().unwrap() = Some(engine),
                Err(e) => {
                    self.enter_initiating_error(s, ProtocolError::Software, true);
                    return Err(e);
                }
            }
        }
        self.process_confirm(s, &sealed)?;
        self.cancel_task(s, TaskKind::Commit);
        self.cancel_task(s, TaskKind::DhPart2);
        self.build_confirm(s, MessageType::Confirm2)?;
        self.set_state(s, StreamState::WaitConfirmAck);
        self.start_task(s, TaskKind::Confirm2);
        Ok(())
    }

    /* Secure */

    /// The handshake completed: compute the SAS, update retained secrets and notify.
    pub fn enter_secure(&mut self, s: &mut StreamInner<C>) {
        let session = self.session();
        self.cancel_all(s);
        let mut st = session.state.lock().unwrap();
        let n = st.negotiated;
        if st.sas_hash.is_none() && !st.zrtpsess.is_empty() {
            let sas_hash: [u8; SAS_HASH_SIZE] =
                kdf::<C>(n.hash, st.zrtpsess.as_bytes(), LABEL_SAS, &s.kdf_context, SAS_HASH_SIZE).as_bytes().try_into().unwrap();
            st.sas = Some(sas::render(n.sas, sas_hash[..4].try_into().unwrap()));
            st.sas_hash = Some(sas_hash);
        }
        if s.mode == StreamMode::Dh && !st.secrets.rs1.is_expired(self.unix_now) {
            st.secrets.wrongs = st.secrets.cached & !st.secrets.matches & SECRET_BIT_RS1;
        }
        if s.mode.is_full() {
            st.secrets.cached_curr = st.secrets.cached;
            st.secrets.matches_curr = st.secrets.matches;
            st.secrets.wrongs_curr = st.secrets.wrongs;
            st.pk = Some(if s.mode == StreamMode::Preshared { PkType::Preshared } else { s.pk });
        }
        st.secrets_ttl = s.cache_ttl;
        let (cached, matches, wrongs) = (st.secrets.cached, st.secrets.matches, st.secrets.wrongs);
        let peer_zid = st.peer_zid;
        drop(st);

        self.set_state(s, StreamState::Secure);
        self.event(ProtocolEvent::IsSecure);
        self.app.on_is_secure(self.handle);
        let mitm_alert = s.mode == StreamMode::Dh && wrongs != 0;
        if mitm_alert {
            self.security(SecurityEvent::MitmWarning);
        }

        if cached & SECRET_BIT_PBX != 0 && matches & SECRET_BIT_PBX == 0 {
            self.event(ProtocolEvent::UserUnenrolled);
        }
        match s.mitm_mode {
            MitmMode::RegServer => {
                if matches & SECRET_BIT_PBX != 0 {
                    self.event(ProtocolEvent::UserAlreadyEnrolled);
                } else if self.register_trusted_mitm(s).is_ok() {
                    self.event(ProtocolEvent::NewUserEnrolled);
                }
            }
            MitmMode::RegClient => self.event(ProtocolEvent::IsClientEnrollment),
            _ => {}
        }

        if let Some(peer_zid) = peer_zid {
            if s.mode == StreamMode::Dh {
                self.retain_secret(s, &peer_zid, mitm_alert);
            }
            if let Some(cache) = self.ctx.cache.as_deref() {
                let counter = match s.mode {
                    StreamMode::Dh => Some(0),
                    StreamMode::Preshared => Some(cache.get_presh_counter(&session.zid, &peer_zid).unwrap_or(0) + 1),
                    _ => None,
                };
                if let Some(counter) = counter {
                    let result = cache.set_presh_counter(&session.zid, &peer_zid, counter);
                    self.cache_updated(result);
                }
            }
        }
        self.event(ProtocolEvent::IsSecureDone);

        s.s0.zeroize();
        s.key_pair = None;
        if let Some(link) = s.linked_mitm {
            self.followups.push(Followup::KickLinked(link));
        }
    }

    /// Rotate RS1 into RS2 and store the new RS1 of a DH stream.
    ///
    /// A negotiated cache TTL of 0 means the peers keep no retained secrets at all.
    fn retain_secret(&mut self, s: &mut StreamInner<C>, peer_zid: &Zid, mitm_alert: bool) {
        if s.cache_ttl == 0 {
            return;
        }
        let session = self.session();
        let mut st = session.state.lock().unwrap();
        let value = kdf::<C>(st.negotiated.hash, s.s0.as_bytes(), LABEL_RETAINED_SECRET, &s.kdf_context, RETAINED_SECRET_SIZE);
        let ttl = s.cache_ttl;
        let secrets = &mut st.secrets;
        let old_rs1_cached = secrets.cached & SECRET_BIT_RS1 != 0;
        secrets.rs2 = std::mem::take(&mut secrets.rs1);
        secrets.rs1 = SharedSecret { value, last_used: self.unix_now, ttl, cached: true };
        secrets.cached |= SECRET_BIT_RS1;
        secrets.matches |= SECRET_BIT_RS1;
        if old_rs1_cached {
            secrets.cached |= SECRET_BIT_RS2;
        }
        let record = CachedSecret { value: secrets.rs1.value.clone(), last_used: self.unix_now, ttl };
        let Some(cache) = self.ctx.cache.as_deref() else { return };
        if mitm_alert {
            st.mitm_alert_detected = true;
            drop(st);
            log!(self.app, DeferredRetainedSecret(&self.handle.session));
            return;
        }
        drop(st);
        match cache.put(&session.zid, peer_zid, &record) {
            Ok(()) => {
                log!(self.app, StoredRetainedSecret(&self.handle.session));
            }
            Err(_) => {
                log!(self.app, CacheWriteFailed(&self.handle.session));
            }
        }
    }

    /// Derive and store the PBX secret shared with a trusted MiTM.
    pub fn register_trusted_mitm(&mut self, s: &StreamInner<C>) -> Result<(), Error> {
        let session = self.session();
        let mut st = session.state.lock().unwrap();
        let peer_zid = st.peer_zid.ok_or(Error::WrongState)?;
        if st.zrtpsess.is_empty() {
            return Err(Error::WrongState);
        }
        let (zid_i, zid_r) = zids(s, &session.zid, &peer_zid);
        let mut context = [0u8; 2 * ZID_SIZE];
        context[..ZID_SIZE].copy_from_slice(&zid_i);
        context[ZID_SIZE..].copy_from_slice(&zid_r);
        let hash = st.negotiated.hash;
        let pbx = kdf::<C>(hash, st.zrtpsess.as_bytes(), LABEL_TRUSTED_MITM, &context, hash.digest_size());
        let record = CachedSecret { value: pbx.clone(), last_used: self.unix_now, ttl: CACHE_TTL_FOREVER };
        st.secrets.pbx = SharedSecret { value: pbx, last_used: self.unix_now, ttl: CACHE_TTL_FOREVER, cached: true };
        st.secrets.cached |= SECRET_BIT_PBX;
        drop(st);
        match self.ctx.cache.as_deref() {
            Some(cache) => cache.put_mitm(&session.zid, &peer_zid, &record),
            None => Ok(()),
        }
    }

    /* GoClear and SASrelay */

    /// Returns true if the GoClear may be acted upon.
    fn process_goclear(&mut self, s: &mut StreamInner<C>, mac: &[u8; MESSAGE_MAC_SIZE]) -> bool {
        if !s.allowclear {
            self.enter_initiating_error(s, ProtocolError::GoClearUnsupported, true);
            return false;
        }
        let hash = self.session().state.lock().unwrap().negotiated.hash;
        if !bool::from(clear_mac::<C>(hash, &s.peer_hmac_key)[..].ct_eq(&mac[..])) {
            log!(self.app, DroppedPacket(self.handle, DropReason::BadClearMac));
            return false;
        }
        true
    }

    fn process_sasrelay(&mut self, s: &mut StreamInner<C>, sealed: &Sealed) -> Result<(), Error> {
        let session = self.session();
        if !s.peer_mitm {
            self.security(SecurityEvent::MitmWarning);
            return Err(attack!(AttackType::UntrustedSasRelay));
        }
        let hash = session.state.lock().unwrap().negotiated.hash;
        let body = match open_body(s, hash, sealed) {
            Ok(b) => SasRelayBody::decode(&b),
            Err(e) => {
                self.security(SecurityEvent::WrongMessageHmac);
                self.enter_initiating_error(s, ProtocolError::AuthDecrypt, true);
                return Err(e);
            }
        };
        let sas_type = SasType::from_wire_code(&body.rendering)
            .filter(|t| session.profile.supports(*t))
            .ok_or(Error::AlgorithmUnsupported(ComponentCategory::Sas))?;
        let relays_hash = body.sas_hash != [0u8; SAS_HASH_SIZE];
        let mut st = session.state.lock().unwrap();
        if relays_hash && st.secrets.matches & SECRET_BIT_PBX == 0 {
            drop(st);
            self.security(SecurityEvent::MitmWarning);
            return Err(attack!(AttackType::UntrustedSasRelay));
        }
        st.negotiated.sas = sas_type;
        if relays_hash {
            st.sas_hash = Some(body.sas_hash);
        }
        if let Some(h) = st.sas_hash {
            st.sas = Some(sas::render(sas_type, h[..4].try_into().unwrap()));
        }
        drop(st);
        self.event(ProtocolEvent::RemoteSasUpdated);
        Ok(())
    }

    /// Send a SASrelay telling the peer to display another SAS.
    pub fn start_sas_relay(&mut self, s: &mut StreamInner<C>, sas_type: SasType, sas_hash: Option<[u8; SAS_HASH_SIZE]>) -> Result<(), Error> {
        let hash = self.session().state.lock().unwrap().negotiated.hash;
        let body = SasRelayBody { flags: 0, rendering: *sas_type.wire_code(), sas_hash: sas_hash.unwrap_or([0u8; SAS_HASH_SIZE]) };
        let sealed = seal_body(s, hash, self.random(), body.encode())?;
        s.sasrelay = Message::SasRelay(sealed).encode();
        self.set_state(s, StreamState::SasRelaying);
        self.start_task(s, TaskKind::SasRelay);
        Ok(())
    }

    /* Incoming messages */

    /// Run the handler of the current state on an incoming message.
    pub fn handle_message(&mut self, s: &mut StreamInner<C>, msg: Message, raw: &[u8]) -> Result<(), Error> {
        use StreamState as S;
        log!(self.app, ReceivedMessage(self.handle, msg.message_type()));
        if let Message::Error(code) = msg {
            if s.state > S::Start && !matches!(s.state, S::Secure | S::PendingError | S::InitiatingError | S::NoZrtp) {
                self.enter_pending_error(s, code);
                return Ok(());
            }
        }
        let _t = msg.message_type();
        let handled = match s.state {
            S::Start => self.in_start(s, msg, raw),
            S::WaitHelloAck => self.in_wait_hello_ack(s, msg, raw),
            S::WaitHello => self.in_wait_hello(s, msg, raw),
            S::Clear | S::PendingClear => self.in_clear(s, msg, raw),
            S::StartInitiatingSecure => self.in_start_initiating_secure(s, msg, raw),
            S::InitiatingSecure => self.in_initiating_secure(s, msg, raw),
            S::WaitConfirm1 => self.in_wait_confirm1(s, msg),
            S::WaitConfirmAck => self.in_wait_confirm_ack(s, msg),
            S::PendingSecure => self.in_pending_secure(s, msg, raw),
            S::WaitConfirm2 => self.in_wait_confirm2(s, msg),
            S::Secure | S::SasRelaying => self.in_secure(s, msg),
            S::InitiatingClear => self.in_initiating_clear(s, msg),
            S::InitiatingError | S::PendingError | S::Error => self.in_error(s, msg),
            S::NoZrtp => self.in_no_zrtp(s, msg, raw),
            S::None | S::Active => Ok(false),
        };
        match handled {
            Ok(false) => {
                log!(self.app, DroppedPacket(self.handle, DropReason::Unexpected(_t)));
                Ok(())
            }
            Ok(true) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn in_start(&mut self, s: &mut StreamInner<C>, msg: Message, raw: &[u8]) -> Result<bool, Error> {
        match msg {
            Message::Hello(hello) => {
                if self.process_hello(s, hello, raw) {
                    self.prepare_secrets();
                    self.send(s, MessageType::HelloAck, false);
                    self.set_state(s, StreamState::WaitHelloAck);
                }
            }
            Message::HelloAck => {
                self.cancel_task(s, TaskKind::Hello);
                self.set_state(s, StreamState::WaitHello);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn in_wait_hello(&mut self, s: &mut StreamInner<C>, msg: Message, raw: &[u8]) -> Result<bool, Error> {
        let Message::Hello(hello) = msg else { return Ok(false) };
        if !self.process_hello(s, hello, raw) {
            return Ok(true);
        }
        self.prepare_secrets();
        let profile = &self.session().profile;
        let may_initiate = self.passive1(s);
        if profile.autosecure && may_initiate {
            if !profile.discovery_optimization {
                self.send(s, MessageType::HelloAck, false);
            }
            self.start_initiating_secure(s);
        } else {
            self.send(s, MessageType::HelloAck, false);
            if !may_initiate {
                self.event(ProtocolEvent::IsPassiveRestriction);
            }
            self.enter_clear(s);
        }
        Ok(true)
    }

    fn commit_while_discovering(&mut self, s: &mut StreamInner<C>, commit: Commit, raw: &[u8]) -> Result<(), Error> {
        if self.passive2() {
            self.cancel_task(s, TaskKind::Hello);
            self.on_commit(s, commit, raw)
        } else {
            self.event(ProtocolEvent::IsPassiveRestriction);
            self.enter_initiating_error(s, ProtocolError::ServiceUnavailable, true);
            Ok(())
        }
    }

    fn in_wait_hello_ack(&mut self, s: &mut StreamInner<C>, msg: Message, raw: &[u8]) -> Result<bool, Error> {
        match msg {
            Message::Hello(_) => {
                self.send(s, MessageType::HelloAck, false);
            }
            Message::Commit(commit) => self.commit_while_discovering(s, commit, raw)?,
            Message::HelloAck => {
                self.cancel_task(s, TaskKind::Hello);
                let may_initiate = self.passive1(s);
                if self.session().profile.autosecure && may_initiate {
                    self.start_initiating_secure(s);
                } else {
                    if !may_initiate {
                        self.event(ProtocolEvent::IsPassiveRestriction);
                    }
                    self.enter_clear(s);
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn in_clear(&mut self, s: &mut StreamInner<C>, msg: Message, raw: &[u8]) -> Result<bool, Error> {
        match msg {
            Message::GoClear(_) => {
                self.send(s, MessageType::ClearAck, false);
            }
            Message::Hello(_) if s.state == StreamState::Clear => {
                self.send(s, MessageType::HelloAck, false);
            }
            Message::Commit(commit) => self.on_commit(s, commit, raw)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn in_start_initiating_secure(&mut self, s: &mut StreamInner<C>, msg: Message, raw: &[u8]) -> Result<bool, Error> {
        match msg {
            Message::Hello(_) => {
                self.send(s, MessageType::HelloAck, false);
            }
            Message::Commit(commit) => self.on_commit(s, commit, raw)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn in_initiating_secure(&mut self, s: &mut StreamInner<C>, msg: Message, raw: &[u8]) -> Result<bool, Error> {
        match msg {
            Message::Commit(commit) => self.on_commit(s, commit, raw)?,
            Message::DhPart1(d) if s.mode == StreamMode::Dh => self.on_dhpart1(s, d, raw)?,
            Message::Confirm1(sealed) if s.mode != StreamMode::Dh => self.on_confirm1(s, sealed)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn in_wait_confirm1(&mut self, s: &mut StreamInner<C>, msg: Message) -> Result<bool, Error> {
        let Message::Confirm1(sealed) = msg else { return Ok(false) };
        self.on_confirm1(s, sealed)?;
        Ok(true)
    }

    fn in_wait_confirm_ack(&mut self, s: &mut StreamInner<C>, msg: Message) -> Result<bool, Error> {
        let Message::Conf2Ack = msg else { return Ok(false) };
        self.enter_secure(s);
        Ok(true)
    }

    fn in_pending_secure(&mut self, s: &mut StreamInner<C>, msg: Message, raw: &[u8]) -> Result<bool, Error> {
        match msg {
            Message::Commit(_) if s.peer_commit.as_ref().map_or(false, |c| c.1 == raw) => {
                self.send(s, MessageType::DhPart1, true);
            }
            Message::DhPart2(d) => self.on_dhpart2(s, d, raw)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn in_wait_confirm2(&mut self, s: &mut StreamInner<C>, msg: Message) -> Result<bool, Error> {
        match msg {
            Message::Confirm2(sealed) => {
                self.process_confirm(s, &sealed)?;
                self.send(s, MessageType::Conf2Ack, false);
                self.enter_secure(s);
            }
            Message::DhPart2(_) | Message::Commit(_) => {
                self.send(s, MessageType::Confirm1, true);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn in_secure(&mut self, s: &mut StreamInner<C>, msg: Message) -> Result<bool, Error> {
        match msg {
            Message::Confirm2(_) => {
                self.send(s, MessageType::Conf2Ack, false);
            }
            Message::RelayAck if s.state == StreamState::SasRelaying => {
                self.cancel_task(s, TaskKind::SasRelay);
                self.set_state(s, StreamState::Secure);
                self.event(ProtocolEvent::LocalSasUpdated);
            }
            Message::SasRelay(sealed) => {
                self.process_sasrelay(s, &sealed)?;
                self.send(s, MessageType::RelayAck, false);
            }
            Message::GoClear(mac) if s.state == StreamState::Secure => {
                if self.process_goclear(s, &mac) {
                    self.enter_pending_clear(s);
                    self.send(s, MessageType::ClearAck, false);
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn in_initiating_clear(&mut self, s: &mut StreamInner<C>, msg: Message) -> Result<bool, Error> {
        match msg {
            Message::ClearAck | Message::Commit(_) => self.enter_clear(s),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn in_error(&mut self, s: &mut StreamInner<C>, msg: Message) -> Result<bool, Error> {
        match (s.state, msg) {
            (StreamState::InitiatingError, Message::Error(code)) => self.enter_pending_error(s, code),
            (StreamState::InitiatingError, Message::ErrorAck) => self.switch_to_error(s),
            (StreamState::PendingError, Message::Error(_)) => {}
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn in_no_zrtp(&mut self, s: &mut StreamInner<C>, msg: Message, raw: &[u8]) -> Result<bool, Error> {
        match msg {
            Message::Hello(hello) => {
                if self.process_hello(s, hello, raw) {
                    self.prepare_secrets();
                    self.set_state(s, StreamState::Start);
                    self.start_hello(s);
                }
            }
            Message::Commit(commit) => self.commit_while_discovering(s, commit, raw)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}
