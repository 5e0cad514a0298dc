use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::crypto::*;

/// Implements `KeyExchange` for one of the NIST curves of the RustCrypto elliptic curve crates.
///
/// ZRTP public values are the affine coordinates `x || y` without the SEC1 tag byte, and the
/// DH result is the x coordinate of the shared point.
macro_rules! impl_ecdh {
    ($name:ident, $curve:ident, $size:expr) => {
        pub struct $name($curve::ecdh::EphemeralSecret);
        impl<Rng: RngCore + CryptoRng> KeyExchange<Rng> for $name {
            const PUBLIC_VALUE_SIZE: usize = $size;

            fn generate(rng: &mut Rng) -> Self {
                Self($curve::ecdh::EphemeralSecret::random(rng))
            }

            fn public_value(&self) -> Vec<u8> {
                use $curve::elliptic_curve::sec1::ToEncodedPoint;
                self.0.public_key().to_encoded_point(false).as_bytes()[1..].to_vec()
            }

            fn agree(&self, peer_public_value: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
                if peer_public_value.len() != $size {
                    return None;
                }
                let mut sec1 = Vec::with_capacity($size + 1);
                sec1.push(0x04);
                sec1.extend_from_slice(peer_public_value);
                // Rejects points that are not on the curve and the identity.
                let peer = $curve::PublicKey::from_sec1_bytes(&sec1).ok()?;
                let shared = self.0.diffie_hellman(&peer);
                Some(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
        }
    };
}
impl_ecdh!(CrateEc256, p256, EC256_PUBLIC_VALUE_SIZE);
impl_ecdh!(CrateEc384, p384, EC384_PUBLIC_VALUE_SIZE);
impl_ecdh!(CrateEc521, p521, EC521_PUBLIC_VALUE_SIZE);
