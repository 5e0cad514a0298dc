use zeroize::Zeroizing;

/// Keying material for one direction of an SRTP session, as derived by ZRTP.
pub struct SrtpProfile {
    /// SRTP master key, 16 or 32 bytes depending on the negotiated cipher.
    pub master_key: Zeroizing<Vec<u8>>,
    /// SRTP master salt, always 14 bytes.
    pub master_salt: Zeroizing<[u8; 14]>,
    /// Length of the HMAC-SHA1 authentication tag in bytes (4 or 10).
    pub auth_tag_len: usize,
}

/// An SRTP/SRTCP packet protection engine.
///
/// ZRTP creates one of these per stream once the keys are derived and destroys it when the
/// stream leaves the secure state. Implementations should not panic on malformed input,
/// instead they should return `false`.
pub trait SrtpEngine: Sized + Send {
    /// Create an SRTP context from the outbound and inbound keying material.
    fn new(outbound: &SrtpProfile, inbound: &SrtpProfile) -> Option<Self>;

    /// Encrypt and authenticate an outgoing RTP packet in place.
    fn protect_rtp(&mut self, packet: &mut Vec<u8>) -> bool;
    /// Authenticate and decrypt an incoming SRTP packet in place.
    fn unprotect_rtp(&mut self, packet: &mut Vec<u8>) -> bool;
    /// Encrypt and authenticate an outgoing RTCP packet in place.
    fn protect_rtcp(&mut self, packet: &mut Vec<u8>) -> bool;
    /// Authenticate and decrypt an incoming SRTCP packet in place.
    fn unprotect_rtcp(&mut self, packet: &mut Vec<u8>) -> bool;
}
