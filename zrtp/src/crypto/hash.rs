/// The size of a SHA-256 hash, which is always 32 bytes.
pub const SHA256_HASH_SIZE: usize = 32;
/// The size of a SHA-384 hash, which is always 48 bytes.
pub const SHA384_HASH_SIZE: usize = 48;
/// The size of a SHA-1 hash. Only used as the SRTP authentication tag MAC.
pub const SHA1_HASH_SIZE: usize = 20;

/// A streaming hash function producing `N` bytes of output.
/// Does not need to be threadsafe.
pub trait Sha2Hash<const N: usize>: Sized {
    /// Create a new instance for streaming data to.
    fn new() -> Self;
    /// Update the instance with input `data`.
    /// This must update the state as if `data` was appended to the previous input.
    fn update(&mut self, data: &[u8]);
    /// Finish streaming input and output the final hash.
    fn finish(self) -> [u8; N];
}

/// A streaming HMAC producing `N` bytes of output.
///
/// ZRTP keys HMACs with hash chain images, retained secrets and derived keys,
/// so any key length must be accepted.
pub trait HmacHash<const N: usize>: Sized {
    /// Create a new instance keyed with `key`.
    fn new(key: &[u8]) -> Self;
    /// Append `data` to the authenticated input.
    fn update(&mut self, data: &[u8]);
    /// Finish and output the full length MAC.
    fn finish(self) -> [u8; N];
}
