/* Transport framing */

/// Size of the RTP-shaped header that precedes every ZRTP message on the wire.
pub const RTP_HEADER_SIZE: usize = 12;
/// First byte of the RTP-shaped header of a ZRTP packet (version 0, extension bit set).
pub(crate) const ZRTP_PACKET_HEADER_BYTE: u8 = 0x10;
/// The value stored in the RTP timestamp field that marks a packet as ZRTP rather than media.
pub const ZRTP_MAGIC_COOKIE: u32 = 0x5A52_5450;
/// Size of the CRC-32c trailer appended to every ZRTP packet.
pub(crate) const CRC_SIZE: usize = 4;

/* Message framing */
/*
Message header:
    [0..2]   preamble 0x505A
    [2..4]   length of the message in 32-bit words, excluding the CRC
    [4..12]  ASCII message type block
*/
pub(crate) const ZRTP_PREAMBLE: u16 = 0x505A;
pub(crate) const MESSAGE_HEADER_SIZE: usize = 12;
pub(crate) const MESSAGE_TYPE_SIZE: usize = 8;
/// Size of the truncated HMAC that closes Hello, Commit and DHPart messages.
pub(crate) const MESSAGE_MAC_SIZE: usize = 8;
/// Smallest packet that could possibly carry a ZRTP message.
pub const MIN_ZRTP_PACKET_SIZE: usize = RTP_HEADER_SIZE + MESSAGE_HEADER_SIZE + CRC_SIZE;
/// Largest ZRTP packet this implementation will produce or accept.
pub const MAX_ZRTP_PACKET_SIZE: usize = 1024;

/// The protocol version this implementation speaks.
pub const ZRTP_VERSION: &[u8; 4] = b"1.10";

/* Identifiers */

/// Size of a ZRTP endpoint identifier.
pub const ZID_SIZE: usize = 12;
/// A ZRTP endpoint identifier, stable per installation.
pub type Zid = [u8; ZID_SIZE];
/// Size of the client identifier string carried in Hello.
pub const CLIENT_ID_SIZE: usize = 16;
pub(crate) const HASH_IMAGE_SIZE: usize = 32;
pub(crate) const SECRET_ID_SIZE: usize = 8;
pub(crate) const HVI_SIZE: usize = 32;
pub(crate) const NONCE_SIZE: usize = 16;
pub(crate) const KEY_ID_SIZE: usize = 8;
pub(crate) const CFB_IV_SIZE: usize = 16;
pub(crate) const ENDPOINT_HASH_SIZE: usize = 8;
pub(crate) const COMPONENT_CODE_SIZE: usize = 4;
/// Maximum number of algorithms a Hello may advertise per category.
pub(crate) const MAX_COMPONENTS: usize = 7;

/* Derived material */

pub(crate) const MAX_HASH_SIZE: usize = 48;
pub(crate) const MAX_CIPHER_KEY_SIZE: usize = 32;
pub(crate) const SRTP_SALT_SIZE: usize = 14;
pub(crate) const RETAINED_SECRET_SIZE: usize = 32;
/// Capacity of the buffers holding secrets and derived keys.
pub const SECRET_BUFFER_SIZE: usize = 64;
pub(crate) const SAS_HASH_SIZE: usize = 32;

/* Message body sizes */

pub(crate) const HELLO_STATIC_SIZE: usize = MESSAGE_HEADER_SIZE + 4 + CLIENT_ID_SIZE + HASH_IMAGE_SIZE + ZID_SIZE + 4;
pub(crate) const COMMIT_STATIC_SIZE: usize = MESSAGE_HEADER_SIZE + HASH_IMAGE_SIZE + ZID_SIZE + 5 * COMPONENT_CODE_SIZE;
pub(crate) const COMMIT_DH_SIZE: usize = COMMIT_STATIC_SIZE + HVI_SIZE + MESSAGE_MAC_SIZE;
pub(crate) const COMMIT_MULT_SIZE: usize = COMMIT_STATIC_SIZE + NONCE_SIZE + MESSAGE_MAC_SIZE;
pub(crate) const COMMIT_PRESH_SIZE: usize = COMMIT_STATIC_SIZE + NONCE_SIZE + KEY_ID_SIZE + MESSAGE_MAC_SIZE;
pub(crate) const DHPART_STATIC_SIZE: usize = MESSAGE_HEADER_SIZE + HASH_IMAGE_SIZE + 4 * SECRET_ID_SIZE;
pub(crate) const CONFIRM_BODY_SIZE: usize = HASH_IMAGE_SIZE + 8;
pub(crate) const CONFIRM_SIZE: usize = MESSAGE_HEADER_SIZE + MESSAGE_MAC_SIZE + CFB_IV_SIZE + CONFIRM_BODY_SIZE;
pub(crate) const SASRELAY_BODY_SIZE: usize = 8 + SAS_HASH_SIZE;
pub(crate) const SASRELAY_SIZE: usize = MESSAGE_HEADER_SIZE + MESSAGE_MAC_SIZE + CFB_IV_SIZE + SASRELAY_BODY_SIZE;
pub(crate) const ERROR_SIZE: usize = MESSAGE_HEADER_SIZE + 4;
pub(crate) const GOCLEAR_SIZE: usize = MESSAGE_HEADER_SIZE + MESSAGE_MAC_SIZE;
pub(crate) const PING_SIZE: usize = MESSAGE_HEADER_SIZE + 4 + ENDPOINT_HASH_SIZE;
pub(crate) const PINGACK_SIZE: usize = MESSAGE_HEADER_SIZE + 4 + 2 * ENDPOINT_HASH_SIZE + 4;

/* Flags */

pub(crate) const HELLO_FLAG_SIGNATURE: u8 = 0x40;
pub(crate) const HELLO_FLAG_MITM: u8 = 0x20;
pub(crate) const HELLO_FLAG_PASSIVE: u8 = 0x10;
/// Extension used by the reference implementation to advertise an unlimited license.
pub(crate) const HELLO_FLAG_UNLIMITED: u8 = 0x08;

pub(crate) const CONFIRM_FLAG_DISCLOSE: u8 = 0x01;
pub(crate) const CONFIRM_FLAG_ALLOWCLEAR: u8 = 0x02;
pub(crate) const CONFIRM_FLAG_VERIFIED: u8 = 0x04;
pub(crate) const CONFIRM_FLAG_ENROLLMENT: u8 = 0x08;

/// Bit of `SessionInfo::cached`/`matches`/`wrongs` describing the first retained secret.
pub const SECRET_BIT_RS1: u32 = 0x02;
/// Bit describing the second retained secret.
pub const SECRET_BIT_RS2: u32 = 0x04;
/// Bit describing the auxiliary secret.
pub const SECRET_BIT_AUX: u32 = 0x10;
/// Bit describing the trusted MiTM (PBX) secret.
pub const SECRET_BIT_PBX: u32 = 0x20;

/* Cache */

/// Cache TTL value meaning "never expires".
pub const CACHE_TTL_FOREVER: u32 = 0xFFFF_FFFF;
/// Default retained secret lifetime in seconds (30 days).
pub const DEFAULT_CACHE_TTL: u32 = 60 * 60 * 24 * 30;
/// Default client identifier announced in Hello.
pub const DEFAULT_CLIENT_ID: &str = "ZRTP def. peer";
/// Default location of the file backed secret cache.
pub const DEFAULT_CACHE_PATH: &str = "./zrtp_def_cache_path.dat";

/// Number of stream slots per session.
pub const MAX_STREAMS_PER_SESSION: usize = 4;

/* KDF labels */

pub(crate) const LABEL_INITIATOR: &[u8] = b"Initiator";
pub(crate) const LABEL_RESPONDER: &[u8] = b"Responder";
pub(crate) const LABEL_KDF: &[u8] = b"ZRTP-HMAC-KDF";
pub(crate) const LABEL_SESSION_KEY: &[u8] = b"ZRTP Session Key";
pub(crate) const LABEL_MULTISTREAM_KEY: &[u8] = b"ZRTP Multistream Key";
pub(crate) const LABEL_PRESHARED_KEY: &[u8] = b"ZRTP Stream Key";
pub(crate) const LABEL_PRESHARED_KEY_ID: &[u8] = b"Prsh";
pub(crate) const LABEL_RETAINED_SECRET: &[u8] = b"retained secret";
pub(crate) const LABEL_SAS: &[u8] = b"SAS";
pub(crate) const LABEL_TRUSTED_MITM: &[u8] = b"Trusted MiTM key";
pub(crate) const LABEL_CLEAR_HMAC: &[u8] = b"Clear hmac";

pub(crate) const LABEL_INITIATOR_HMAC_KEY: &[u8] = b"Initiator HMAC key";
pub(crate) const LABEL_RESPONDER_HMAC_KEY: &[u8] = b"Responder HMAC key";
pub(crate) const LABEL_INITIATOR_ZRTP_KEY: &[u8] = b"Initiator ZRTP key";
pub(crate) const LABEL_RESPONDER_ZRTP_KEY: &[u8] = b"Responder ZRTP key";
pub(crate) const LABEL_INITIATOR_SRTP_KEY: &[u8] = b"Initiator SRTP master key";
pub(crate) const LABEL_INITIATOR_SRTP_SALT: &[u8] = b"Initiator SRTP master salt";
pub(crate) const LABEL_RESPONDER_SRTP_KEY: &[u8] = b"Responder SRTP master key";
pub(crate) const LABEL_RESPONDER_SRTP_SALT: &[u8] = b"Responder SRTP master salt";
