use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

/// Public value size of ECDH over P-256 (`x || y`).
pub const EC256_PUBLIC_VALUE_SIZE: usize = 64;
/// Public value size of ECDH over P-384 (`x || y`).
pub const EC384_PUBLIC_VALUE_SIZE: usize = 96;
/// Public value size of ECDH over P-521 (`x || y`, each coordinate padded to 66 bytes).
pub const EC521_PUBLIC_VALUE_SIZE: usize = 132;
/// Public value size of finite field DH over the 2048 bit MODP group.
pub const DH2048_PUBLIC_VALUE_SIZE: usize = 256;
/// Public value size of finite field DH over the 3072 bit MODP group.
pub const DH3072_PUBLIC_VALUE_SIZE: usize = 384;

/// An ephemeral key pair of one of the ZRTP key agreement schemes.
///
/// Public values are encoded the way RFC 6189 puts them on the wire: big-endian integers
/// padded to the group size for finite field DH, and the concatenated affine coordinates
/// `x || y` for elliptic curves.
pub trait KeyExchange<Rng: RngCore + CryptoRng>: Sized + Send {
    /// Size of the public value of this scheme in bytes.
    const PUBLIC_VALUE_SIZE: usize;

    /// Randomly generate a new key pair.
    fn generate(rng: &mut Rng) -> Self;

    /// Return our public value.
    fn public_value(&self) -> Vec<u8>;

    /// Perform the key agreement with the peer's public value.
    ///
    /// CRITICAL: this must return `None` if the peer's value is of the wrong length, is not on
    /// the curve, or is outside of the range `1 < pv < p - 1` for finite field groups.
    /// Accepting such values exposes ZRTP to small subgroup attacks.
    fn agree(&self, peer_public_value: &[u8]) -> Option<Zeroizing<Vec<u8>>>;
}
