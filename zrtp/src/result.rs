use std::fmt;

use crate::registry::ComponentCategory;

/// Reason a packet or a peer action was judged to be a deliberate attack rather than noise.
///
/// These are only ever raised after the CRC of the packet was verified, so they cannot be
/// caused by ordinary bit errors on the network.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum AttackType {
    /// A revealed hash image did not hash to the value committed to in an earlier message.
    HashChainMismatch,
    /// The HMAC closing an earlier message did not verify under the key revealed later.
    MessageMacMismatch,
    /// The hvi of the Commit did not match the DHPart2 that followed it.
    HviMismatch,
    /// The peer's public value was out of range or not on the curve.
    InvalidPublicValue,
    /// A SASrelay arrived from a peer that is not a trusted MiTM.
    UntrustedSasRelay,
}

/// Error kinds returned by the ZRTP API.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum Error {
    /// An invalid parameter was supplied to the function.
    BadParameter,
    /// A stream slot or other bounded resource was exhausted.
    AllocationFailure,
    /// No usable algorithm of the given category was found.
    AlgorithmUnsupported(ComponentCategory),
    /// The API call is not permitted in the current stream state.
    WrongState,
    /// A cipher, hash or key exchange primitive returned failure.
    CryptoOperationFailure,
    /// A packet was replayed or fell outside of the acceptable sequence window.
    ReplayOrOutOfWindow,
    /// A packet failed size, CRC or length-field validation.
    MalformedPacket,
    /// A packet failed a hash-chain, HMAC, hvi or public value check.
    ///
    /// An attacker can trigger any of these on purpose. The stream moves to an error state
    /// and the application receives a security event.
    PossibleAttack {
        /// What exactly failed to verify.
        error: AttackType,
        /// The file of this implementation from which this error was generated.
        #[cfg(feature = "debug")]
        file: &'static str,
        /// The line number from which this error was generated.
        #[cfg(feature = "debug")]
        line: u32,
    },
    /// The secret cache could not be read or written.
    PersistenceFailure(std::io::ErrorKind),
    /// The retry budget of a message was exhausted.
    Timeout,
}

macro_rules! attack {
    ($name:expr) => {
        $crate::result::Error::PossibleAttack {
            error: $name,
            #[cfg(feature = "debug")]
            file: file!(),
            #[cfg(feature = "debug")]
            line: line!(),
        }
    };
}
pub(crate) use attack;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadParameter => write!(f, "bad parameter"),
            Self::AllocationFailure => write!(f, "no free slot"),
            Self::AlgorithmUnsupported(c) => write!(f, "unsupported {:?} algorithm", c),
            Self::WrongState => write!(f, "operation not allowed in this state"),
            Self::CryptoOperationFailure => write!(f, "crypto primitive failure"),
            Self::ReplayOrOutOfWindow => write!(f, "replayed or out of window packet"),
            Self::MalformedPacket => write!(f, "malformed packet"),
            Self::PossibleAttack { error, .. } => write!(f, "possible attack: {:?}", error),
            Self::PersistenceFailure(kind) => write!(f, "cache persistence failure: {:?}", kind),
            Self::Timeout => write!(f, "retry budget exhausted"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::PersistenceFailure(e.kind())
    }
}

/// Protocol error codes carried by the ZRTP Error message.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u32)]
pub enum ProtocolError {
    Unknown = 0,
    /// Malformed packet (CRC OK, but wrong structure).
    InvalidPacket = 0x10,
    /// Critical software error.
    Software = 0x20,
    /// Unsupported ZRTP version.
    Version = 0x30,
    /// Hello components mismatch.
    HelloMismatch = 0x40,
    /// Hash type not supported.
    HashUnsupported = 0x51,
    /// Cipher type not supported.
    CipherUnsupported = 0x52,
    /// Public key exchange not supported.
    PkUnsupported = 0x53,
    /// SRTP auth tag not supported.
    AuthUnsupported = 0x54,
    /// SAS rendering scheme not supported.
    SasUnsupported = 0x55,
    /// No shared secret available, DH mode required.
    NoSharedSecret = 0x56,
    /// DH error: bad pvi or pvr.
    PossibleMitm1 = 0x61,
    /// DH error: hvi does not match hashed data.
    PossibleMitm2 = 0x62,
    /// Received relayed SAS from untrusted MiTM.
    PossibleMitm3 = 0x63,
    /// Auth error: bad Confirm packet HMAC.
    AuthDecrypt = 0x70,
    /// Nonce reuse.
    NonceReuse = 0x80,
    /// Equal ZIDs in Hello.
    EqualZid = 0x90,
    /// SSRC collision.
    SsrcCollision = 0x91,
    /// Service unavailable.
    ServiceUnavailable = 0xA0,
    /// Protocol timeout error.
    Timeout = 0xB0,
    /// GoClear message received, but not allowed.
    GoClearUnsupported = 0x100,
    /// Peer ZID changed within a session.
    WrongZid = 0x202,
    /// A message hash or HMAC did not verify.
    WrongMessageHash = 0x203,
}

impl ProtocolError {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Self {
        use ProtocolError::*;
        match code {
            0x10 => InvalidPacket,
            0x20 => Software,
            0x30 => Version,
            0x40 => HelloMismatch,
            0x51 => HashUnsupported,
            0x52 => CipherUnsupported,
            0x53 => PkUnsupported,
            0x54 => AuthUnsupported,
            0x55 => SasUnsupported,
            0x56 => NoSharedSecret,
            0x61 => PossibleMitm1,
            0x62 => PossibleMitm2,
            0x63 => PossibleMitm3,
            0x70 => AuthDecrypt,
            0x80 => NonceReuse,
            0x90 => EqualZid,
            0x91 => SsrcCollision,
            0xA0 => ServiceUnavailable,
            0xB0 => Timeout,
            0x100 => GoClearUnsupported,
            0x202 => WrongZid,
            0x203 => WrongMessageHash,
            _ => Unknown,
        }
    }

    /// The error sent to the peer when a Commit names an algorithm of `category` we never offered.
    pub(crate) fn unsupported(category: ComponentCategory) -> Self {
        match category {
            ComponentCategory::Hash => Self::HashUnsupported,
            ComponentCategory::Cipher => Self::CipherUnsupported,
            ComponentCategory::AuthTag => Self::AuthUnsupported,
            ComponentCategory::PublicKey => Self::PkUnsupported,
            ComponentCategory::Sas => Self::SasUnsupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_codes() {
        assert_eq!(ProtocolError::from_code(0x62), ProtocolError::PossibleMitm2);
        assert_eq!(ProtocolError::GoClearUnsupported.code(), 0x100);
        assert_eq!(ProtocolError::from_code(0x1234), ProtocolError::Unknown);
        assert_eq!(
            ProtocolError::unsupported(ComponentCategory::Sas),
            ProtocolError::SasUnsupported
        );
    }

    #[test]
    fn attack_macro_carries_reason() {
        let e = attack!(AttackType::HviMismatch);
        match e {
            Error::PossibleAttack { error, .. } => assert_eq!(error, AttackType::HviMismatch),
            _ => panic!(),
        }
    }
}
