use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use zeroize::Zeroize;

use crate::application::CryptoLayer;
use crate::indexed_heap::QueueIndex;
use crate::kdf::{KdfContext, SecretBuf};
use crate::packet::{Commit, DhPart, Hello, SeqTracker};
use crate::profile::{Profile, SignalingRole};
use crate::proto::*;
use crate::registry::*;
use crate::result::ProtocolError;
use crate::zrtp::ContextInner;

/// Protocol state of a stream.
///
/// The numeric order matters: media is only inspected for states between `Start` and
/// `NoZrtp`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
#[repr(u8)]
pub enum StreamState {
    /// The slot is free.
    None = 0,
    /// Attached but not started.
    Active,
    /// Sending Hello, nothing received yet.
    Start,
    /// The peer's Hello was received, waiting for the peer to acknowledge ours.
    WaitHelloAck,
    /// Our Hello was acknowledged, waiting for the peer's Hello.
    WaitHello,
    Clear,
    /// Waiting for another stream of the session to finish its DH exchange.
    StartInitiatingSecure,
    InitiatingSecure,
    WaitConfirm1,
    WaitConfirmAck,
    PendingSecure,
    WaitConfirm2,
    Secure,
    SasRelaying,
    InitiatingClear,
    PendingClear,
    InitiatingError,
    PendingError,
    Error,
    /// The peer never answered. Terminal unless a late Hello arrives.
    NoZrtp,
}

impl StreamState {
    const ALL: [Self; 20] = [
        Self::None,
        Self::Active,
        Self::Start,
        Self::WaitHelloAck,
        Self::WaitHello,
        Self::Clear,
        Self::StartInitiatingSecure,
        Self::InitiatingSecure,
        Self::WaitConfirm1,
        Self::WaitConfirmAck,
        Self::PendingSecure,
        Self::WaitConfirm2,
        Self::Secure,
        Self::SasRelaying,
        Self::InitiatingClear,
        Self::PendingClear,
        Self::InitiatingError,
        Self::PendingError,
        Self::Error,
        Self::NoZrtp,
    ];
    fn from_u8(v: u8) -> Self {
        Self::ALL.get(v as usize).copied().unwrap_or(Self::None)
    }
    /// States in which a key exchange is in flight.
    pub(crate) fn is_handshaking(self) -> bool {
        matches!(
            self,
            Self::InitiatingSecure | Self::WaitConfirm1 | Self::WaitConfirmAck | Self::PendingSecure | Self::WaitConfirm2
        )
    }
}

/// Key agreement mode of a stream.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
pub enum StreamMode {
    Unknown = 0,
    Clear,
    Dh,
    Preshared,
    Multistream,
}

impl StreamMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Clear,
            2 => Self::Dh,
            3 => Self::Preshared,
            4 => Self::Multistream,
            _ => Self::Unknown,
        }
    }
    pub(crate) fn from_pk(pk: PkType) -> Self {
        match pk {
            PkType::Preshared => Self::Preshared,
            PkType::Multistream => Self::Multistream,
            _ => Self::Dh,
        }
    }
    /// DH and Preshared streams derive a new session key and may not overlap within a session.
    pub(crate) fn is_full(self) -> bool {
        matches!(self, Self::Dh | Self::Preshared)
    }
}

/// Role of a stream in a trusted MiTM (PBX) relationship.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum MitmMode {
    Unknown,
    /// The peer announced itself as a MiTM.
    Client,
    /// We are a MiTM enrolling the peer.
    RegServer,
    /// The MiTM peer asked to enroll us.
    RegClient,
}

/// Retransmitted messages and deferred jobs of a stream, one timer each.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub(crate) enum TaskKind {
    Hello = 0,
    /// Waiting for another stream's DH exchange before committing.
    ProcessT1,
    Commit,
    DhPart2,
    Confirm2,
    GoClear,
    Error,
    ErrorAck,
    SasRelay,
}

impl TaskKind {
    pub const COUNT: usize = 9;
    pub const ALL: [Self; Self::COUNT] = [
        Self::Hello,
        Self::ProcessT1,
        Self::Commit,
        Self::DhPart2,
        Self::Confirm2,
        Self::GoClear,
        Self::Error,
        Self::ErrorAck,
        Self::SasRelay,
    ];
}

#[derive(Default, Clone, Copy, Debug)]
pub(crate) struct RetryTask {
    pub enabled: bool,
    pub retries: u32,
    /// Current retransmission interval in milliseconds.
    pub timeout: i64,
    pub deadline: i64,
}

/// A retained, auxiliary or PBX secret as held by a session.
#[derive(Default, Clone)]
pub(crate) struct SharedSecret {
    pub value: SecretBuf,
    pub last_used: u32,
    pub ttl: u32,
    /// Restored from the cache rather than randomly generated.
    pub cached: bool,
}

impl SharedSecret {
    pub fn is_expired(&self, now: u32) -> bool {
        self.ttl != CACHE_TTL_FOREVER && (self.last_used as u64 + self.ttl as u64) < now as u64
    }
}

#[derive(Default)]
pub(crate) struct Secrets {
    pub rs1: SharedSecret,
    pub rs2: SharedSecret,
    pub aux: SharedSecret,
    pub pbx: SharedSecret,
    /// `SECRET_BIT_*` of secrets restored from the cache.
    pub cached: u32,
    /// `SECRET_BIT_*` of secrets the peer proved to hold as well.
    pub matches: u32,
    /// `SECRET_BIT_*` of cached secrets the peer failed to match.
    pub wrongs: u32,
    /// Snapshots of the three above taken when the last full stream went secure.
    pub cached_curr: u32,
    pub matches_curr: u32,
    pub wrongs_curr: u32,
    pub is_ready: bool,
}

/// Components negotiated by the first Commit of a session and shared by its streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub hash: HashType,
    pub cipher: CipherType,
    pub auth_tag: AuthTagType,
    pub sas: SasType,
}

impl Default for Negotiated {
    fn default() -> Self {
        Self { hash: HashType::Sha256, cipher: CipherType::Aes128, auth_tag: AuthTagType::Hs32, sas: SasType::Base32 }
    }
}

#[derive(Default)]
pub(crate) struct SessionState {
    pub peer_zid: Option<Zid>,
    pub peer_client_id: [u8; CLIENT_ID_SIZE],
    pub peer_version: [u8; 4],
    pub secrets: Secrets,
    /// The ZRTP session key, set by the first full stream and used by Multistream ones.
    pub zrtpsess: SecretBuf,
    pub negotiated: Negotiated,
    /// Public key type of the last full stream.
    pub pk: Option<PkType>,
    pub sas_hash: Option<[u8; SAS_HASH_SIZE]>,
    pub sas: Option<(String, String)>,
    /// Effective retained secret lifetime after the last Confirm exchange.
    pub secrets_ttl: u32,
    /// Retained secrets did not match, so the new RS1 waits for the user to verify the SAS
    /// before it is written to the cache.
    pub mitm_alert_detected: bool,
}

/// Protocol state of one stream. Guarded by `Stream::inner`.
pub(crate) struct StreamInner<C: CryptoLayer> {
    pub id: u32,
    pub generation: u32,
    pub state: StreamState,
    pub prev_state: StreamState,
    pub mode: StreamMode,
    pub mitm_mode: MitmMode,
    pub is_initiator: bool,

    pub ssrc: u32,
    pub seq: u16,
    pub peer_seq: SeqTracker,

    /// Hash chain `[H0, H1, H2, H3]`, `Hn = SHA-256(Hn-1)`.
    pub h: [[u8; HASH_IMAGE_SIZE]; 4],
    pub hello: Vec<u8>,
    pub commit: Option<(Commit, Vec<u8>)>,
    pub dhpart: Vec<u8>,
    pub confirm: Vec<u8>,
    pub goclear: Vec<u8>,
    pub sasrelay: Vec<u8>,
    pub peer_hello: Option<(Hello, Vec<u8>)>,
    pub peer_commit: Option<(Commit, Vec<u8>)>,
    pub peer_dhpart: Option<(DhPart, Vec<u8>)>,

    pub hello_received: bool,
    pub peer_passive: bool,
    pub peer_mitm: bool,
    pub peer_unlimited: bool,
    pub peer_disclose: bool,
    pub allowclear: bool,

    pub pk: PkType,
    pub key_pair: Option<(PkType, KeyPair<C>)>,
    pub kdf_context: KdfContext,
    pub s0: SecretBuf,
    /// Key of a Preshared stream, wiped once S0 is derived from it.
    pub preshared_key: SecretBuf,
    pub hmac_key: SecretBuf,
    pub peer_hmac_key: SecretBuf,
    pub zrtp_key: SecretBuf,
    pub peer_zrtp_key: SecretBuf,
    /// Effective retained secret lifetime, the smaller of ours and the peer's.
    pub cache_ttl: u32,

    pub last_error: ProtocolError,
    /// Hash of the peer's Hello as received over the signaling channel.
    pub signaling_hash: Option<[u8; 32]>,
    pub tasks: [RetryTask; TaskKind::COUNT],
    pub linked_mitm: Option<StreamRef>,
}

impl<C: CryptoLayer> StreamInner<C> {
    pub fn new() -> Self {
        Self {
            id: 0,
            generation: 0,
            state: StreamState::None,
            prev_state: StreamState::None,
            mode: StreamMode::Unknown,
            mitm_mode: MitmMode::Unknown,
            is_initiator: false,
            ssrc: 0,
            seq: 0,
            peer_seq: SeqTracker::default(),
            h: [[0u8; HASH_IMAGE_SIZE]; 4],
            hello: Vec::new(),
            commit: None,
            dhpart: Vec::new(),
            confirm: Vec::new(),
            goclear: Vec::new(),
            sasrelay: Vec::new(),
            peer_hello: None,
            peer_commit: None,
            peer_dhpart: None,
            hello_received: false,
            peer_passive: false,
            peer_mitm: false,
            peer_unlimited: false,
            peer_disclose: false,
            allowclear: false,
            pk: PkType::Dh3072,
            key_pair: None,
            kdf_context: KdfContext::new(),
            s0: SecretBuf::new(),
            preshared_key: SecretBuf::new(),
            hmac_key: SecretBuf::new(),
            peer_hmac_key: SecretBuf::new(),
            zrtp_key: SecretBuf::new(),
            peer_zrtp_key: SecretBuf::new(),
            cache_ttl: 0,
            last_error: ProtocolError::Unknown,
            signaling_hash: None,
            tasks: [RetryTask::default(); TaskKind::COUNT],
            linked_mitm: None,
        }
    }

    pub fn task(&mut self, kind: TaskKind) -> &mut RetryTask {
        &mut self.tasks[kind as usize]
    }
    /// Earliest deadline of all enabled tasks.
    pub fn next_deadline(&self) -> i64 {
        self.tasks.iter().filter(|t| t.enabled).map(|t| t.deadline).min().unwrap_or(i64::MAX)
    }

    /// Wipe the per-stream keys. The hash chain and messages survive so the stream can go
    /// secure again.
    pub fn clear_crypto(&mut self) {
        self.key_pair = None;
        self.s0.zeroize();
        self.preshared_key.zeroize();
        self.hmac_key.zeroize();
        self.peer_hmac_key.zeroize();
        self.zrtp_key.zeroize();
        self.peer_zrtp_key.zeroize();
        self.kdf_context.zeroize();
    }

    pub fn is_crypto_wiped(&self) -> bool {
        self.key_pair.is_none()
            && self.s0.is_wiped()
            && self.hmac_key.is_wiped()
            && self.peer_hmac_key.is_wiped()
            && self.zrtp_key.is_wiped()
            && self.peer_zrtp_key.is_wiped()
    }
}

impl<C: CryptoLayer> Drop for StreamInner<C> {
    fn drop(&mut self) {
        self.h.zeroize();
    }
}

/// A by-id reference to a stream of possibly another session. Never keeps anything alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StreamRef {
    pub session_id: u32,
    pub slot: usize,
    pub generation: u32,
}

/// One stream slot of a session.
pub(crate) struct Stream<C: CryptoLayer> {
    /// Mirrors of `inner` fields that other streams and the media path read without locking.
    pub generation: AtomicU32,
    pub state: AtomicU8,
    pub mode: AtomicU8,
    pub id: AtomicU32,
    pub ssrc: AtomicU32,
    pub next_timer: AtomicI64,
    /// Set by a sibling stream that accepted the peer's DH Commit in place of ours.
    pub yield_requested: AtomicBool,
    /// Our hv while a Commit of ours is outstanding.
    pub hv: Mutex<Option<[u8; HVI_SIZE]>>,
    /// `inner -> media`
    pub inner: Mutex<StreamInner<C>>,
    pub media: Mutex<Option<C::Srtp>>,
}

impl<C: CryptoLayer> Stream<C> {
    fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            state: AtomicU8::new(StreamState::None as u8),
            mode: AtomicU8::new(StreamMode::Unknown as u8),
            id: AtomicU32::new(0),
            ssrc: AtomicU32::new(0),
            next_timer: AtomicI64::new(i64::MAX),
            yield_requested: AtomicBool::new(false),
            hv: Mutex::new(None),
            inner: Mutex::new(StreamInner::new()),
            media: Mutex::new(None),
        }
    }
    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }
    pub fn mode(&self) -> StreamMode {
        StreamMode::from_u8(self.mode.load(Ordering::Acquire))
    }
    /// Publish the fields of `inner` that are read without its lock.
    pub fn publish(&self, inner: &StreamInner<C>) {
        self.state.store(inner.state as u8, Ordering::Release);
        self.mode.store(inner.mode as u8, Ordering::Release);
        self.next_timer.store(inner.next_deadline(), Ordering::Release);
    }
}

/// One signaling level call between this endpoint and a single peer.
///
/// A session owns a fixed number of stream slots. It is kept alive by the application, the
/// context only holds a weak reference to it.
pub struct Session<C: CryptoLayer> {
    /// Locally unique identifier.
    pub id: u32,
    /// Arbitrary application data.
    pub session_data: C::SessionData,
    pub(crate) ctx: Weak<ContextInner<C>>,
    pub(crate) queue_idx: QueueIndex,
    pub(crate) profile: Profile,
    pub(crate) zid: Zid,
    pub(crate) signaling_role: SignalingRole,
    /// Serializes attaching streams to free slots.
    pub(crate) streams_protector: Mutex<()>,
    /// Serializes streams deciding whether they may start a DH exchange.
    pub(crate) init_protector: Mutex<()>,
    /// `stream.inner -> init_protector -> state`
    pub(crate) state: Mutex<SessionState>,
    pub(crate) streams: [Stream<C>; MAX_STREAMS_PER_SESSION],
}

impl<C: CryptoLayer> Session<C> {
    pub(crate) fn new(
        id: u32,
        session_data: C::SessionData,
        ctx: Weak<ContextInner<C>>,
        queue_idx: QueueIndex,
        profile: Profile,
        zid: Zid,
        signaling_role: SignalingRole,
    ) -> Self {
        Self {
            id,
            session_data,
            ctx,
            queue_idx,
            profile,
            zid,
            signaling_role,
            streams_protector: Mutex::new(()),
            init_protector: Mutex::new(()),
            state: Mutex::new(SessionState::default()),
            streams: std::array::from_fn(|_| Stream::new()),
        }
    }

    /// Earliest retransmission deadline of all streams.
    pub(crate) fn next_deadline(&self) -> i64 {
        self.streams.iter().map(|s| s.next_timer.load(Ordering::Acquire)).min().unwrap_or(i64::MAX)
    }

    /// The profile this session was created with.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Remove this session from the context's timer queue. Its streams stop retransmitting.
    pub fn expire(&self) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.session_queue.lock().unwrap().remove(self.queue_idx);
            ctx.sessions.write().unwrap().remove(&self.id);
        }
    }
}

impl<C: CryptoLayer> Drop for Session<C> {
    fn drop(&mut self) {
        self.expire();
    }
}

/// A reference to one attached stream, handed to every callback and API function.
///
/// Handles stay valid until `Context::stream_stop`. A handle to a stopped stream is
/// rejected with `Error::BadParameter` even if its slot was reused since.
pub struct StreamHandle<C: CryptoLayer> {
    pub(crate) session: Arc<Session<C>>,
    pub(crate) slot: usize,
    pub(crate) generation: u32,
}

impl<C: CryptoLayer> Clone for StreamHandle<C> {
    fn clone(&self) -> Self {
        Self { session: self.session.clone(), slot: self.slot, generation: self.generation }
    }
}

impl<C: CryptoLayer> StreamHandle<C> {
    pub fn session(&self) -> &Arc<Session<C>> {
        &self.session
    }
    pub fn session_data(&self) -> &C::SessionData {
        &self.session.session_data
    }
    /// Locally unique stream id.
    pub fn id(&self) -> u32 {
        self.stream().id.load(Ordering::Relaxed)
    }
    /// Current protocol state, or `StreamState::None` if the stream was stopped.
    pub fn state(&self) -> StreamState {
        let s = self.stream();
        if s.generation.load(Ordering::Acquire) == self.generation {
            s.state()
        } else {
            StreamState::None
        }
    }
    pub(crate) fn stream(&self) -> &Stream<C> {
        &self.session.streams[self.slot]
    }
    pub(crate) fn as_ref(&self) -> StreamRef {
        StreamRef { session_id: self.session.id, slot: self.slot, generation: self.generation }
    }
}

impl<C: CryptoLayer> PartialEq for StreamHandle<C> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.session, &other.session) && self.slot == other.slot && self.generation == other.generation
    }
}

/// Snapshot of a session returned by `Context::session_get`.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub id: u32,
    pub zid: Zid,
    pub peer_zid: Option<Zid>,
    pub peer_client_id: String,
    pub peer_version: String,
    pub hash: HashType,
    pub cipher: CipherType,
    pub auth_tag: AuthTagType,
    pub sas_scheme: SasType,
    pub pk: Option<PkType>,
    /// The two halves of the rendered SAS. Base-32 only uses the first.
    pub sas1: String,
    pub sas2: String,
    /// Leftmost 32 bits of the SAS hash.
    pub sas_bin: [u8; 4],
    pub sas_is_ready: bool,
    pub sas_is_verified: bool,
    pub cached: u32,
    pub matches: u32,
    pub wrongs: u32,
    pub secrets_ttl: u32,
}

/// Snapshot of a stream returned by `Context::stream_get`.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub id: u32,
    pub state: StreamState,
    pub mode: StreamMode,
    pub mitm_mode: MitmMode,
    pub last_error: ProtocolError,
    pub peer_passive: bool,
    pub allowclear: bool,
    pub peer_disclose: bool,
    pub peer_mitm: bool,
}
