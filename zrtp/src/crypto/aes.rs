/// The specified size of an AES block.
pub const AES_BLOCK_SIZE: usize = 16;
/// Key size of AES-128.
pub const AES_128_KEY_SIZE: usize = 16;
/// Key size of AES-256.
pub const AES_256_KEY_SIZE: usize = 32;

/// A trait for encrypting individual blocks of plaintext using AES with a 128 or 256 bit key.
/// ZRTP only ever needs the forward direction of the block cipher: Confirm and SASrelay
/// bodies are encrypted in CFB mode, which is built on top of this.
///
/// Instances must securely delete their keys when dropped.
pub trait AesBlock: Sized + Send {
    /// Create a new instance that uses the given key for encryption.
    /// Must return `None` if the key is neither 16 nor 32 bytes long.
    fn new(key: &[u8]) -> Option<Self>;

    /// Encrypt the given `block` of plaintext directly using the AES block cipher.
    /// The ciphertext should be written directly back to `block`.
    fn encrypt_in_place(&self, block: &mut [u8; AES_BLOCK_SIZE]);
}
