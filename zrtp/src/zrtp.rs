use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use rand_core::RngCore;

use crate::application::*;
use crate::cache::{CachedSecret, SecretCache};
use crate::crypto::{SrtpEngine, SHA256_HASH_SIZE};
use crate::engine::{Env, Followup};
use crate::indexed_heap::DeadlineQueue;
use crate::packet::*;
use crate::profile::{LicenseMode, Profile, SignalingRole};
use crate::proto::*;
use crate::protocol::{build_hello, hash_chain, pad_client_id};
use crate::registry::*;
use crate::result::{Error, ProtocolError};
use crate::session::*;
#[cfg(feature = "logging")]
use crate::{DropReason, LogEvent::*};

macro_rules! log {
    ($app:expr, $event:expr) => {
        #[cfg(feature = "logging")]
        $app.event_log($event);
    };
}
pub(crate) use log;

/// Global settings of a ZRTP endpoint, fixed for the lifetime of its `Context`.
pub struct Config {
    /// Announced in every Hello, truncated or space padded to 16 bytes.
    pub client_id: String,
    pub license: LicenseMode,
    /// This endpoint is a trusted MiTM (a PBX) and may enroll and relay SAS to its peers.
    pub is_mitm: bool,
    pub zid: Zid,
    /// Retained secret storage. Without it Preshared mode and PBX enrollment are unavailable.
    pub cache: Option<Arc<dyn SecretCache>>,
}

impl Config {
    pub fn new(zid: Zid) -> Self {
        Self { client_id: DEFAULT_CLIENT_ID.to_string(), license: LicenseMode::Passive, is_mitm: false, zid, cache: None }
    }
}

/// What the caller should do with a packet after `Context::process_*` returns.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum PacketAction {
    /// Hand the (possibly rewritten) packet to the network or the media decoder.
    Forward,
    /// Discard the packet. ZRTP control packets are always consumed.
    Drop,
}

/// ZRTP endpoint context.
///
/// Owns the registry of algorithms, the secret cache and the timer queue of every session
/// created through it. Internally this is just a clonable Arc, so it can be safely shared with
/// multiple threads.
pub struct Context<C: CryptoLayer>(pub Arc<ContextInner<C>>);
impl<C: CryptoLayer> Clone for Context<C> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

struct EntropyPool {
    state: [u8; 32],
    counter: u64,
}

/// The internal memory of the ZRTP context. See `Context::new`.
pub struct ContextInner<C: CryptoLayer> {
    pub(crate) rng: Mutex<C::Rng>,
    entropy: Mutex<EntropyPool>,
    pub(crate) next_service_time: AtomicI64,
    registry: RwLock<Registry>,
    pub(crate) zid: Zid,
    client_id: [u8; CLIENT_ID_SIZE],
    pub(crate) license: LicenseMode,
    pub(crate) is_mitm: bool,
    pub(crate) cache: Option<Arc<dyn SecretCache>>,
    /// `session_queue -> stream.inner -> init_protector -> session.state -> sessions`
    pub(crate) session_queue: Mutex<DeadlineQueue<Weak<Session<C>>>>,
    /// `session_queue -> stream.inner -> init_protector -> session.state -> sessions`
    pub(crate) sessions: RwLock<HashMap<u32, Weak<Session<C>>>>,
    next_session_id: AtomicU32,
    next_stream_id: AtomicU32,
}

impl<C: CryptoLayer> ContextInner<C> {
    pub(crate) fn reduce_next_service_time(&self, time: i64) -> Option<i64> {
        (self.next_service_time.fetch_min(time, Ordering::Relaxed) > time).then_some(time)
    }

    /// Move a session in the timer queue after its stream timers changed outside `service`.
    fn reschedule(&self, session: &Session<C>) -> Option<i64> {
        let deadline = session.next_deadline();
        self.session_queue.lock().unwrap().change_deadline(session.queue_idx, deadline);
        self.reduce_next_service_time(deadline)
    }

    /// Fill `out` with the RNG output masked by the collected entropy.
    pub(crate) fn random_bytes(&self, out: &mut [u8]) {
        self.rng.lock().unwrap().fill_bytes(out);
        let mut pool = self.entropy.lock().unwrap();
        for chunk in out.chunks_mut(SHA256_HASH_SIZE) {
            pool.counter += 1;
            let mask = hmac_sha256::<C>(&pool.state, &[&pool.counter.to_be_bytes()]);
            for (b, m) in chunk.iter_mut().zip(mask.iter()) {
                *b ^= m;
            }
        }
    }

    fn entropy_add(&self, data: &[u8]) {
        let mut pool = self.entropy.lock().unwrap();
        pool.state = sha256::<C>(&[&pool.state, data]);
    }

    /// Look up a stream by id. Fails if its session is gone or the slot was reused.
    fn resolve(&self, r: StreamRef) -> Option<StreamHandle<C>> {
        let session = self.sessions.read().unwrap().get(&r.session_id).and_then(Weak::upgrade)?;
        let stream = session.streams.get(r.slot)?;
        (stream.generation.load(Ordering::Acquire) == r.generation)
            .then(|| StreamHandle { session: session.clone(), slot: r.slot, generation: r.generation })
    }
}

impl<C: CryptoLayer> Context<C> {
    /// Create a new ZRTP context.
    ///
    /// Every algorithm known to this implementation is self tested and registered.
    pub fn new(config: Config, mut rng: C::Rng) -> Result<Self, Error> {
        let registry = Registry::with_defaults::<C>(&mut rng)?;
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Ok(Self(Arc::new(ContextInner {
            rng: Mutex::new(rng),
            entropy: Mutex::new(EntropyPool { state: seed, counter: 0 }),
            next_service_time: AtomicI64::new(i64::MAX),
            registry: RwLock::new(registry),
            zid: config.zid,
            client_id: pad_client_id(&config.client_id),
            license: config.license,
            is_mitm: config.is_mitm,
            cache: config.cache,
            session_queue: Mutex::new(DeadlineQueue::new()),
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU32::new(1),
            next_stream_id: AtomicU32::new(1),
        })))
    }

    /// Stop every stream of every live session and flush the cache.
    ///
    /// Sessions stay allocated until the application drops them, but they no longer do anything.
    pub fn down(&self) -> Result<(), Error> {
        let sessions: Vec<Arc<Session<C>>> = self.0.sessions.read().unwrap().values().filter_map(Weak::upgrade).collect();
        for session in &sessions {
            self.stop_all(session);
            session.expire();
        }
        drop(sessions);
        match &self.0.cache {
            Some(cache) => cache.store(),
            None => Ok(()),
        }
    }

    /// Self test an additional algorithm and make it available to new sessions.
    pub fn register_component(&self, component: AnyComponent) -> Result<(), Error> {
        let mut registry = self.0.registry.write().unwrap();
        let mut rng = self.0.rng.lock().unwrap();
        registry.register::<C>(component, &mut rng)
    }

    /// Create a session with a peer.
    ///
    /// The profile defaults to `Profile::default_for` the context's license mode. The session
    /// is owned by the caller; dropping the last reference removes it from the context.
    pub fn session_init(
        &self,
        profile: Option<Profile>,
        signaling_role: SignalingRole,
        session_data: C::SessionData,
    ) -> Result<Arc<Session<C>>, Error> {
        let ctx = &self.0;
        let mut profile = profile.unwrap_or_else(|| Profile::default_for(ctx.license));
        profile.adjust_hash_for_pk();
        profile.check(&ctx.registry.read().unwrap(), ctx.cache.is_some())?;

        let id = ctx.next_session_id.fetch_add(1, Ordering::Relaxed);
        let mut session_queue = ctx.session_queue.lock().unwrap();
        let queue_idx = session_queue.reserve_index();
        let session = Arc::new(Session::new(id, session_data, Arc::downgrade(ctx), queue_idx, profile, ctx.zid, signaling_role));
        session_queue.push_reserved(queue_idx, Arc::downgrade(&session), i64::MAX);
        drop(session_queue);
        ctx.sessions.write().unwrap().insert(id, Arc::downgrade(&session));
        Ok(session)
    }

    /// Stop every stream of the session and remove it from the context.
    pub fn session_down(&self, session: &Arc<Session<C>>) {
        self.stop_all(session);
        session.expire();
    }

    fn stop_all(&self, session: &Arc<Session<C>>) {
        for slot in 0..MAX_STREAMS_PER_SESSION {
            let generation = session.streams[slot].generation.load(Ordering::Acquire);
            let _ = self.stream_stop(&StreamHandle { session: session.clone(), slot, generation });
        }
    }

    /// Snapshot the negotiated algorithms, SAS and secret flags of a session.
    pub fn session_get(&self, session: &Arc<Session<C>>) -> SessionInfo {
        let st = session.state.lock().unwrap();
        let n = st.negotiated;
        let sas_is_verified = match (self.0.cache.as_deref(), st.peer_zid) {
            (Some(cache), Some(peer_zid)) => cache.get_verified(&session.zid, &peer_zid).unwrap_or(false),
            _ => false,
        };
        let (sas1, sas2) = st.sas.clone().unwrap_or_default();
        let mut sas_bin = [0u8; 4];
        if let Some(h) = &st.sas_hash {
            sas_bin.copy_from_slice(&h[..4]);
        }
        SessionInfo {
            id: session.id,
            zid: session.zid,
            peer_zid: st.peer_zid,
            peer_client_id: String::from_utf8_lossy(&st.peer_client_id).trim_end().to_string(),
            peer_version: String::from_utf8_lossy(&st.peer_version).trim_end_matches('\0').to_string(),
            hash: n.hash,
            cipher: n.cipher,
            auth_tag: n.auth_tag,
            sas_scheme: n.sas,
            pk: st.pk,
            sas1,
            sas2,
            sas_bin,
            sas_is_ready: st.sas.is_some(),
            sas_is_verified,
            cached: st.secrets.cached_curr,
            matches: st.secrets.matches_curr,
            wrongs: st.secrets.wrongs_curr,
            secrets_ttl: st.secrets_ttl,
        }
    }

    /// Attach a new stream to a free slot of the session. It starts in `StreamState::Active`.
    pub fn stream_attach(&self, session: &Arc<Session<C>>) -> Result<StreamHandle<C>, Error> {
        let ctx = &self.0;
        let _guard = session.streams_protector.lock().unwrap();
        let slot = session
            .streams
            .iter()
            .position(|s| s.state() == StreamState::None)
            .ok_or(Error::AllocationFailure)?;
        let stream = &session.streams[slot];
        let mut s = stream.inner.lock().unwrap();

        let generation = s.generation.wrapping_add(1);
        *s = StreamInner::new();
        s.generation = generation;
        s.id = ctx.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let mut h0 = [0u8; HASH_IMAGE_SIZE];
        ctx.random_bytes(&mut h0);
        s.h = hash_chain::<C>(h0);
        let mut flags = match ctx.license {
            LicenseMode::Passive => HELLO_FLAG_PASSIVE,
            LicenseMode::Active => 0,
            LicenseMode::Unlimited => HELLO_FLAG_UNLIMITED,
        };
        if ctx.is_mitm {
            flags |= HELLO_FLAG_MITM;
        }
        s.hello = build_hello::<C>(&session.profile, &ctx.client_id, &ctx.zid, flags, &s.h);
        let mut seq = [0u8; 2];
        ctx.random_bytes(&mut seq);
        s.seq = u16::from_be_bytes(seq);
        s.state = StreamState::Active;

        stream.id.store(s.id, Ordering::Relaxed);
        stream.generation.store(generation, Ordering::Release);
        stream.yield_requested.store(false, Ordering::Relaxed);
        stream.publish(&s);
        Ok(StreamHandle { session: session.clone(), slot, generation })
    }

    /// Run `f` on the locked stream, then reschedule the session and run any cross stream work.
    fn with_stream<App: ApplicationLayer<C>, R>(
        &self,
        app: &mut App,
        handle: &StreamHandle<C>,
        f: impl FnOnce(&mut Env<'_, C, App>, &mut StreamInner<C>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let ctx = &self.0;
        let stream = handle.stream();
        let mut s = stream.inner.lock().unwrap();
        if s.generation != handle.generation || s.state == StreamState::None {
            return Err(Error::BadParameter);
        }
        let (result, followups) = {
            let mut env = Env::new(&mut *app, ctx, handle);
            let result = f(&mut env, &mut s);
            (result, env.followups)
        };
        stream.publish(&s);
        drop(s);
        ctx.reschedule(&handle.session);
        self.run_followups(app, followups);
        result
    }

    fn run_followups<App: ApplicationLayer<C>>(&self, app: &mut App, followups: Vec<Followup>) {
        for followup in followups {
            match followup {
                Followup::KickLinked(link) => {
                    if let Some(linked) = self.0.resolve(link) {
                        let _ = self.with_stream(app, &linked, |env, s| {
                            if s.state == StreamState::Clear {
                                env.start_initiating_secure(s);
                            }
                            Ok(())
                        });
                    }
                }
                Followup::ResecureIfLinkedUnlimited { stream, link } => {
                    let unlimited = self
                        .0
                        .resolve(link)
                        .map_or(false, |linked| linked.stream().inner.lock().unwrap().peer_unlimited);
                    if let (true, Some(handle)) = (unlimited, self.0.resolve(stream)) {
                        let _ = self.with_stream(app, &handle, |env, s| {
                            if s.state == StreamState::Clear {
                                env.start_initiating_secure(s);
                            }
                            Ok(())
                        });
                    }
                }
            }
        }
    }

    /// Start the ZRTP protocol on a stream: Hello is sent and retransmitted until answered.
    ///
    /// Allowed from `Active`, `Error` and `NoZrtp`. `ssrc` goes into every ZRTP packet sent.
    pub fn stream_start<App: ApplicationLayer<C>>(&self, mut app: App, handle: &StreamHandle<C>, ssrc: u32) -> Result<(), Error> {
        self.with_stream(&mut app, handle, |env, s| Self::start(env, s, ssrc))
    }

    fn start<App: ApplicationLayer<C>>(env: &mut Env<'_, C, App>, s: &mut StreamInner<C>, ssrc: u32) -> Result<(), Error> {
        if !matches!(s.state, StreamState::Active | StreamState::Error | StreamState::NoZrtp) {
            return Err(Error::WrongState);
        }
        s.ssrc = ssrc;
        env.handle.stream().ssrc.store(ssrc, Ordering::Relaxed);
        s.peer_seq.reset();
        s.hello_received = false;
        env.set_state(s, StreamState::Start);
        env.start_hello(s);
        Ok(())
    }

    /// Start a stream as a trusted MiTM enrolling its peer. Requires `Config::is_mitm`.
    pub fn stream_registration_start<App: ApplicationLayer<C>>(
        &self,
        mut app: App,
        handle: &StreamHandle<C>,
        ssrc: u32,
    ) -> Result<(), Error> {
        if !self.0.is_mitm {
            return Err(Error::WrongState);
        }
        self.with_stream(&mut app, handle, |env, s| {
            s.mitm_mode = MitmMode::RegServer;
            Self::start(env, s, ssrc)
        })
    }

    /// Stop a stream from any state, wipe its keys and free its slot.
    ///
    /// Retransmissions only ever run under the stream lock, so none is in flight once this
    /// returns.
    pub fn stream_stop(&self, handle: &StreamHandle<C>) -> Result<(), Error> {
        let stream = handle.stream();
        let mut s = stream.inner.lock().unwrap();
        if s.generation != handle.generation {
            return Err(Error::BadParameter);
        }
        if s.state == StreamState::None {
            return Err(Error::WrongState);
        }
        let link = s.linked_mitm.take();
        s.clear_crypto();
        let generation = s.generation.wrapping_add(1);
        *s = StreamInner::new();
        s.generation = generation;
        *stream.media.lock().unwrap() = None;
        *stream.hv.lock().unwrap() = None;
        stream.yield_requested.store(false, Ordering::Relaxed);
        stream.generation.store(generation, Ordering::Release);
        stream.publish(&s);
        drop(s);

        if let Some(linked) = link.and_then(|link| self.0.resolve(link)) {
            let mut other = linked.stream().inner.lock().unwrap();
            if other.linked_mitm == Some(handle.as_ref()) {
                other.linked_mitm = None;
            }
        }
        self.0.reschedule(&handle.session);
        Ok(())
    }

    /// Start the secure handshake on a stream in `Clear`.
    pub fn stream_secure<App: ApplicationLayer<C>>(&self, mut app: App, handle: &StreamHandle<C>) -> Result<(), Error> {
        self.with_stream(&mut app, handle, |env, s| {
            if s.state != StreamState::Clear {
                return Err(Error::WrongState);
            }
            if !env.passive1(s) {
                env.event(ProtocolEvent::IsPassiveRestriction);
                return Err(Error::WrongState);
            }
            env.start_initiating_secure(s);
            Ok(())
        })
    }

    /// Switch a stream to clear.
    ///
    /// From `Secure` this starts the GoClear exchange if both sides allow it. From
    /// `PendingClear` it accepts the peer's request.
    pub fn stream_clear<App: ApplicationLayer<C>>(&self, mut app: App, handle: &StreamHandle<C>) -> Result<(), Error> {
        self.with_stream(&mut app, handle, |env, s| match s.state {
            StreamState::Secure if s.allowclear => {
                env.enter_initiating_clear(s);
                Ok(())
            }
            StreamState::PendingClear => {
                env.enter_clear(s);
                Ok(())
            }
            _ => Err(Error::WrongState),
        })
    }

    pub fn stream_get(&self, handle: &StreamHandle<C>) -> Result<StreamInfo, Error> {
        let s = handle.stream().inner.lock().unwrap();
        if s.generation != handle.generation || s.state == StreamState::None {
            return Err(Error::BadParameter);
        }
        let started = s.state > StreamState::Active;
        Ok(StreamInfo {
            id: s.id,
            state: s.state,
            mode: s.mode,
            mitm_mode: s.mitm_mode,
            last_error: if started { s.last_error } else { ProtocolError::Unknown },
            peer_passive: started && s.peer_passive,
            allowclear: started && s.allowclear,
            peer_disclose: started && s.peer_disclose,
            peer_mitm: started && s.peer_mitm,
        })
    }

    fn check_media(handle: &StreamHandle<C>, packet: &[u8]) -> Result<StreamState, Error> {
        if packet.len() < RTP_HEADER_SIZE {
            return Err(Error::BadParameter);
        }
        if handle.stream().generation.load(Ordering::Acquire) != handle.generation {
            return Err(Error::BadParameter);
        }
        Ok(handle.stream().state())
    }

    fn apply_srtp(handle: &StreamHandle<C>, packet: &mut Vec<u8>, op: impl FnOnce(&mut C::Srtp, &mut Vec<u8>) -> bool) -> Result<PacketAction, Error> {
        let mut media = handle.stream().media.lock().unwrap();
        let srtp = media.as_mut().ok_or(Error::WrongState)?;
        if op(srtp, packet) {
            Ok(PacketAction::Forward)
        } else {
            Err(Error::CryptoOperationFailure)
        }
    }

    /// Process an outgoing RTP packet.
    ///
    /// Media is encrypted in place while the stream is secure and dropped while keys change.
    pub fn process_rtp(&self, handle: &StreamHandle<C>, packet: &mut Vec<u8>) -> Result<PacketAction, Error> {
        use StreamState as S;
        let state = Self::check_media(handle, packet)?;
        if state < S::Start || state > S::NoZrtp || is_zrtp_packet(packet) {
            return Ok(PacketAction::Forward);
        }
        match state {
            S::StartInitiatingSecure
            | S::InitiatingSecure
            | S::WaitConfirm1
            | S::WaitConfirmAck
            | S::PendingSecure
            | S::WaitConfirm2
            | S::PendingClear => {
                self.0.entropy_add(packet);
                Ok(PacketAction::Drop)
            }
            S::Secure | S::SasRelaying => Self::apply_srtp(handle, packet, |srtp, p| srtp.protect_rtp(p)),
            _ => Ok(PacketAction::Forward),
        }
    }

    /// Process an outgoing RTCP packet.
    pub fn process_rtcp(&self, handle: &StreamHandle<C>, packet: &mut Vec<u8>) -> Result<PacketAction, Error> {
        use StreamState as S;
        match Self::check_media(handle, packet)? {
            S::StartInitiatingSecure
            | S::InitiatingSecure
            | S::WaitConfirm1
            | S::WaitConfirmAck
            | S::PendingSecure
            | S::WaitConfirm2
            | S::PendingClear => Ok(PacketAction::Drop),
            S::Secure | S::SasRelaying => Self::apply_srtp(handle, packet, |srtp, p| srtp.protect_rtcp(p)),
            _ => Ok(PacketAction::Forward),
        }
    }

    /// Process an incoming SRTCP packet.
    pub fn process_srtcp(&self, handle: &StreamHandle<C>, packet: &mut Vec<u8>) -> Result<PacketAction, Error> {
        use StreamState as S;
        match Self::check_media(handle, packet)? {
            S::InitiatingClear | S::PendingClear | S::InitiatingSecure | S::PendingSecure => Ok(PacketAction::Drop),
            S::Secure | S::SasRelaying => Self::apply_srtp(handle, packet, |srtp, p| srtp.unprotect_rtcp(p)),
            _ => Ok(PacketAction::Forward),
        }
    }

    /// Process an incoming packet: either a ZRTP message or SRTP media.
    ///
    /// ZRTP messages drive the protocol and are always dropped afterwards. Media is decrypted
    /// in place while the stream is secure. An Initiator waiting for Conf2ACK treats the first
    /// media packet that decrypts as the acknowledgement.
    pub fn process_srtp<App: ApplicationLayer<C>>(
        &self,
        mut app: App,
        handle: &StreamHandle<C>,
        packet: &mut Vec<u8>,
    ) -> Result<PacketAction, Error> {
        use StreamState as S;
        if packet.len() <= RTP_HEADER_SIZE {
            return Err(Error::BadParameter);
        }
        let state = Self::check_media(handle, packet)?;
        if !is_zrtp_packet(packet) {
            return match state {
                S::Secure | S::SasRelaying => Self::apply_srtp(handle, packet, |srtp, p| srtp.unprotect_rtp(p)),
                S::WaitConfirmAck => self.confirm_by_media(&mut app, handle, packet),
                S::StartInitiatingSecure
                | S::InitiatingSecure
                | S::WaitConfirm1
                | S::PendingSecure
                | S::WaitConfirm2
                | S::InitiatingClear
                | S::PendingClear => Ok(PacketAction::Drop),
                _ => Ok(PacketAction::Forward),
            };
        }

        let p = match preparse(packet) {
            Ok(p) => p,
            Err(_) => {
                log!(app, DroppedPacket(handle, DropReason::Malformed));
                return Ok(PacketAction::Drop);
            }
        };
        let message = Message::decode(p.message);
        if let Ok(Message::Ping { endpoint_hash, .. }) = &message {
            let ack = PingAck {
                version: *ZRTP_VERSION,
                endpoint_hash: self.0.zid[..ENDPOINT_HASH_SIZE].try_into().unwrap(),
                peer_endpoint_hash: *endpoint_hash,
                ssrc: p.ssrc,
            };
            let reply = frame(0, handle.stream().ssrc.load(Ordering::Relaxed), &Message::PingAck(ack).encode());
            log!(app, AnsweredPing(handle));
            app.send_packet(handle, &reply);
            return Ok(PacketAction::Drop);
        }
        if state < S::Start || state > S::NoZrtp {
            return Ok(PacketAction::Drop);
        }
        let (seq, raw) = (p.seq, p.message);
        self.with_stream(&mut app, handle, |env, s| {
            if !s.peer_seq.accept(seq) {
                log!(env.app, DroppedPacket(env.handle, DropReason::Replayed));
                return Ok(());
            }
            match message {
                Ok(m) => env.handle_message(s, m, raw),
                Err(e) => {
                    env.enter_initiating_error(s, ProtocolError::InvalidPacket, true);
                    Err(e)
                }
            }
        })?;
        Ok(PacketAction::Drop)
    }

    fn confirm_by_media<App: ApplicationLayer<C>>(
        &self,
        app: &mut App,
        handle: &StreamHandle<C>,
        packet: &mut Vec<u8>,
    ) -> Result<PacketAction, Error> {
        self.with_stream(app, handle, |env, s| {
            let decrypted = Self::apply_srtp(env.handle, packet, |srtp, p| srtp.unprotect_rtp(p)).is_ok();
            match s.state {
                StreamState::WaitConfirmAck if decrypted => {
                    env.enter_secure(s);
                    Ok(PacketAction::Forward)
                }
                StreamState::Secure | StreamState::SasRelaying if decrypted => Ok(PacketAction::Forward),
                _ => Ok(PacketAction::Drop),
            }
        })
    }

    /// Fire every retransmission whose deadline has passed.
    ///
    /// Returns the timestamp at which this should be called again, `i64::MAX` if nothing is
    /// pending. API calls and incoming packets may move this earlier, see
    /// `Context::next_service_time`.
    pub fn service<App: ApplicationLayer<C>>(&self, mut app: App) -> i64 {
        let ctx = &self.0;
        let current_time = app.time();
        let mut serviced = Vec::new();
        let mut followups = Vec::new();
        let mut session_queue = ctx.session_queue.lock().unwrap();
        let mut queue_service_time = i64::MAX;
        while let Some((session, deadline, queue_idx)) = session_queue.peek() {
            if deadline > current_time {
                queue_service_time = deadline;
                break;
            }
            let session = match session.upgrade() {
                Some(s) => s,
                None => {
                    session_queue.remove(queue_idx);
                    continue;
                }
            };
            for slot in 0..MAX_STREAMS_PER_SESSION {
                let stream = &session.streams[slot];
                if stream.next_timer.load(Ordering::Acquire) > current_time {
                    continue;
                }
                let mut s = stream.inner.lock().unwrap();
                if s.state == StreamState::None {
                    continue;
                }
                let handle = StreamHandle { session: session.clone(), slot, generation: s.generation };
                let mut env = Env::new(&mut app, ctx, &handle);
                env.process_timers(&mut s);
                followups.append(&mut env.followups);
            }
            let next = session.next_deadline().max(current_time + 1);
            session_queue.change_deadline(queue_idx, next);
            // The application may drop its reference meanwhile, and dropping the last one
            // takes the queue lock.
            serviced.push(session);
        }
        ctx.next_service_time.store(queue_service_time, Ordering::Relaxed);
        drop(session_queue);
        drop(serviced);
        self.run_followups(&mut app, followups);
        self.next_service_time()
    }

    /// The time at which `Context::service` should be called next.
    pub fn next_service_time(&self) -> i64 {
        self.0.next_service_time.load(Ordering::Relaxed)
    }

    /// Record whether the user confirmed the SAS of this session.
    ///
    /// A retained secret held back after a mismatch is written to the cache once verified.
    pub fn verified_set(&self, session: &Arc<Session<C>>, verified: bool) -> Result<(), Error> {
        let cache = self.0.cache.as_deref().ok_or(Error::WrongState)?;
        let mut st = session.state.lock().unwrap();
        let peer_zid = st.peer_zid.ok_or(Error::WrongState)?;
        if verified && st.mitm_alert_detected {
            let rs1 = &st.secrets.rs1;
            cache.put(&session.zid, &peer_zid, &CachedSecret { value: rs1.value.clone(), last_used: rs1.last_used, ttl: rs1.ttl })?;
            st.mitm_alert_detected = false;
        }
        drop(st);
        cache.set_verified(&session.zid, &peer_zid, verified)
    }

    /// Hex SHA-256 of this stream's Hello, to be sent to the peer over signaling.
    pub fn signaling_hash_get(&self, handle: &StreamHandle<C>) -> Result<String, Error> {
        let s = handle.stream().inner.lock().unwrap();
        if s.generation != handle.generation || s.state < StreamState::Active {
            return Err(Error::BadParameter);
        }
        Ok(hex::encode(sha256::<C>(&[s.hello.as_slice()])))
    }

    /// Set the hash of the peer's Hello received over signaling. Only allowed in `Active`.
    pub fn signaling_hash_set(&self, handle: &StreamHandle<C>, hash_hex: &str) -> Result<(), Error> {
        let mut hash = [0u8; 32];
        hex::decode_to_slice(hash_hex, &mut hash).map_err(|_| Error::BadParameter)?;
        let mut s = handle.stream().inner.lock().unwrap();
        if s.generation != handle.generation {
            return Err(Error::BadParameter);
        }
        if s.state != StreamState::Active {
            return Err(Error::WrongState);
        }
        s.signaling_hash = Some(hash);
        Ok(())
    }

    /// Accept the enrollment offered by a trusted MiTM and store the PBX secret.
    pub fn register_with_trusted_mitm<App: ApplicationLayer<C>>(&self, mut app: App, handle: &StreamHandle<C>) -> Result<(), Error> {
        self.with_stream(&mut app, handle, |env, s| {
            if s.state != StreamState::Secure || !s.peer_mitm {
                return Err(Error::WrongState);
            }
            env.register_trusted_mitm(s)
        })
    }

    /// Link the two legs of a call relayed by this MiTM.
    pub fn link_mitm_calls(&self, a: &StreamHandle<C>, b: &StreamHandle<C>) -> Result<(), Error> {
        if !self.0.is_mitm || a == b {
            return Err(Error::BadParameter);
        }
        for (this, other) in [(a, b), (b, a)] {
            let mut s = this.stream().inner.lock().unwrap();
            if s.generation != this.generation || s.state == StreamState::None {
                return Err(Error::BadParameter);
            }
            s.linked_mitm = Some(other.as_ref());
        }
        Ok(())
    }

    /// Relay a new SAS to the peer of a secure stream. Only trusted MiTM endpoints may do this.
    ///
    /// `sas_hash` carries the SAS of the other leg of the call; `None` only changes the
    /// rendering.
    pub fn update_remote_options<App: ApplicationLayer<C>>(
        &self,
        mut app: App,
        handle: &StreamHandle<C>,
        sas_scheme: SasType,
        sas_hash: Option<[u8; SAS_HASH_SIZE]>,
    ) -> Result<(), Error> {
        if !self.0.is_mitm {
            return Err(Error::WrongState);
        }
        if !handle.session.profile.supports(sas_scheme) {
            return Err(Error::AlgorithmUnsupported(ComponentCategory::Sas));
        }
        self.with_stream(&mut app, handle, |env, s| {
            if s.state != StreamState::Secure {
                return Err(Error::WrongState);
            }
            env.start_sas_relay(s, sas_scheme, sas_hash)
        })
    }

    /// Mix unpredictable data into the random number pool.
    pub fn entropy_add(&self, data: &[u8]) {
        self.0.entropy_add(data);
    }

    pub fn random_bytes(&self, out: &mut [u8]) {
        self.0.random_bytes(out);
    }

    /// The ZRTP identifier of this endpoint.
    pub fn zid(&self) -> &Zid {
        &self.0.zid
    }
}
