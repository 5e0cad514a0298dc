use std::time::{SystemTime, UNIX_EPOCH};

use rand_core::{CryptoRng, RngCore};

use crate::crypto::*;
use crate::result::ProtocolError;
use crate::session::StreamHandle;

/// A container for the retransmission timer values and retry budgets used by ZRTP.
///
/// Values are in milliseconds unless the name says otherwise. The defaults are the ones
/// recommended by RFC 6189 section 6.
pub struct Settings {
    /// Initial Hello retransmission interval. Doubles on every resend.
    pub t1_ms: i64,
    /// Upper bound of the Hello retransmission interval.
    pub t1_cap_ms: i64,
    /// Number of Hellos sent before a stream gives up and declares that the peer does not
    /// speak ZRTP.
    pub t1_max_count: u32,
    /// Same as `t1_max_count` but used once a Hello was received and we are waiting for the
    /// peer to acknowledge ours.
    pub t1_max_count_ext: u32,
    /// Number of unanswered Hellos after which `ProtocolEvent::NoZrtpQuick` fires.
    pub no_zrtp_fast_count: u32,
    /// Initial retransmission interval of Commit, DHPart2, Confirm2, GoClear and SASrelay.
    pub t2_ms: i64,
    /// Upper bound of the T2 retransmission interval.
    pub t2_cap_ms: i64,
    /// Number of T2 retransmissions before the handshake is abandoned.
    pub t2_max_count: u32,
    /// Retransmission interval of Error and ErrorACK.
    pub et_ms: i64,
    /// Number of Error messages sent before giving up on an acknowledgement.
    pub eti_max_count: u32,
    /// Number of ErrorACK messages sent in response to an Error.
    pub etr_max_count: u32,
    /// Interval at which a stream waiting for another stream's DH exchange rechecks.
    pub process_t1_ms: i64,
    /// Number of such rechecks before the waiting stream times out.
    pub process_t1_max_count: u32,
    /// Number of consecutive Preshared handshakes allowed before a DH exchange is forced.
    pub presh_max_count: u32,
}

impl Settings {
    pub const T1_MS: i64 = 50;
    pub const T1_CAP_MS: i64 = 200;
    pub const T1_MAX_COUNT: u32 = 20;
    pub const T1_MAX_COUNT_EXT: u32 = 60;
    pub const NO_ZRTP_FAST_COUNT: u32 = 5;
    pub const T2_MS: i64 = 150;
    pub const T2_CAP_MS: i64 = 1200;
    pub const T2_MAX_COUNT: u32 = 10;
    pub const ET_MS: i64 = 150;
    pub const ETI_MAX_COUNT: u32 = 10;
    pub const ETR_MAX_COUNT: u32 = 3;
    pub const PROCESS_T1_MS: i64 = 50;
    pub const PROCESS_T1_MAX_COUNT: u32 = 20000;
    pub const PRESH_MAX_COUNT: u32 = 20;

    pub const fn new_ms() -> Self {
        Self {
            t1_ms: Self::T1_MS,
            t1_cap_ms: Self::T1_CAP_MS,
            t1_max_count: Self::T1_MAX_COUNT,
            t1_max_count_ext: Self::T1_MAX_COUNT_EXT,
            no_zrtp_fast_count: Self::NO_ZRTP_FAST_COUNT,
            t2_ms: Self::T2_MS,
            t2_cap_ms: Self::T2_CAP_MS,
            t2_max_count: Self::T2_MAX_COUNT,
            et_ms: Self::ET_MS,
            eti_max_count: Self::ETI_MAX_COUNT,
            etr_max_count: Self::ETR_MAX_COUNT,
            process_t1_ms: Self::PROCESS_T1_MS,
            process_t1_max_count: Self::PROCESS_T1_MAX_COUNT,
            presh_max_count: Self::PRESH_MAX_COUNT,
        }
    }
}
impl Default for Settings {
    fn default() -> Self {
        Self::new_ms()
    }
}

/// Trait to implement to provide the cryptographic primitives ZRTP negotiates.
///
/// A default implementation built on RustCrypto crates is available behind the
/// `default-crypto` feature, see `crypto_impl::DefaultCrypto`.
///
/// ZRTP never inspects key material through these traits other than by the operations
/// listed. Implementations backed by FIPS validated libraries can be dropped in.
pub trait CryptoLayer: Sized {
    /// Retransmission timers and retry budgets.
    const SETTINGS: Settings = Settings::new_ms();

    /// The random number generator all key pairs, nonces and IVs are drawn from.
    /// It is additionally masked with the entropy collected through `Context::entropy_add`.
    type Rng: CryptoRng + RngCore + Send;

    /// SHA-256, the implicit hash of ZRTP and the default negotiated hash.
    type Sha256: Sha2Hash<SHA256_HASH_SIZE>;
    /// SHA-384, negotiated alongside ECDH-384.
    type Sha384: Sha2Hash<SHA384_HASH_SIZE>;
    type HmacSha256: HmacHash<SHA256_HASH_SIZE>;
    type HmacSha384: HmacHash<SHA384_HASH_SIZE>;
    /// HMAC-SHA1, only used for the `HS32`/`HS80` authentication tag self tests.
    type HmacSha1: HmacHash<SHA1_HASH_SIZE>;

    /// AES-128/AES-256 block cipher used for Confirm and SASrelay encryption.
    type Aes: AesBlock;

    type Ec256: KeyExchange<Self::Rng>;
    type Ec384: KeyExchange<Self::Rng>;
    type Ec521: KeyExchange<Self::Rng>;
    type Dh2048: KeyExchange<Self::Rng>;
    type Dh3072: KeyExchange<Self::Rng>;

    /// The SRTP engine that protects media once the stream is secure.
    type Srtp: SrtpEngine;

    /// Data type for every session's application data.
    /// Each ZRTP session contains one of these, and it is always accessible.
    type SessionData;
}

/// Notifications about the progress of a stream through the protocol.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ProtocolEvent {
    /// The stream entered the clear state.
    IsClear,
    /// The stream sent a Commit and is now the Initiator.
    IsInitiatingSecure,
    /// The stream accepted a Commit and is now the Responder.
    IsPendingSecure,
    /// The peer asked to go clear. The application should call `Context::stream_clear` after
    /// asking the user.
    IsPendingClear,
    /// The peer did not answer the first few Hellos.
    NoZrtpQuick,
    /// A trusted MiTM wants to enroll us. Call `Context::register_with_trusted_mitm` to accept.
    IsClientEnrollment,
    /// A new user was enrolled with this trusted MiTM.
    NewUserEnrolled,
    /// The user was already enrolled.
    UserAlreadyEnrolled,
    /// A cached PBX secret no longer matches the peer.
    UserUnenrolled,
    /// The SAS relayed by this trusted MiTM was acknowledged by the peer.
    LocalSasUpdated,
    /// A trusted MiTM relayed a new SAS to us.
    RemoteSasUpdated,
    /// The stream is secure.
    IsSecure,
    /// The stream is secure and the retained secrets were updated.
    IsSecureDone,
    /// The license mode of one of the endpoints prevents a secure call.
    IsPassiveRestriction,
    /// The peer did not answer any Hello. The stream stays clear.
    NoZrtp,
}

/// Notifications the application should show to the user.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum SecurityEvent {
    /// The stream entered the error state with the given protocol error.
    ProtocolError(ProtocolError),
    /// The peer's Hello does not match the hash received over the signaling channel.
    WrongSignalingHash,
    /// A message hash chain or HMAC check failed.
    WrongMessageHmac,
    /// Retained secrets do not match, or an untrusted party tried to relay a SAS.
    MitmWarning,
}

/// Trait to implement to integrate ZRTP into an application.
///
/// Most methods take a reference to the stream they concern. Implementations must not call
/// back into the `Context` for the same stream from within these methods.
pub trait ApplicationLayer<C: CryptoLayer>: Sized {
    /// Return the current time in milliseconds.
    /// Must be monotonic. Retransmission timers are scheduled against it.
    fn time(&mut self) -> i64;

    /// Return the current wall clock time in seconds since the UNIX epoch.
    /// Used for retained secret lifetimes stored in the cache.
    fn unix_time(&mut self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }

    /// Send a complete ZRTP packet on the RTP channel of `stream`.
    /// Returns false if the packet could not be sent.
    fn send_packet(&mut self, stream: &StreamHandle<C>, packet: &[u8]) -> bool;

    #[allow(unused)]
    fn on_protocol_event(&mut self, stream: &StreamHandle<C>, event: ProtocolEvent) {}

    #[allow(unused)]
    fn on_security_event(&mut self, stream: &StreamHandle<C>, event: SecurityEvent) {}

    /// Called once when `stream` starts protecting media.
    #[allow(unused)]
    fn on_is_secure(&mut self, stream: &StreamHandle<C>) {}

    /// Called when `stream` stops protecting media, either by going clear or by failing.
    #[allow(unused)]
    fn on_not_secure(&mut self, stream: &StreamHandle<C>) {}

    /// This function will be called whenever some protocol event occurs that could be
    /// interesting to log.
    #[cfg(feature = "logging")]
    #[allow(unused)]
    fn event_log(&mut self, event: crate::LogEvent<'_, C>) {}
}
