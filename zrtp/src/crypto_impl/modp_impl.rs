use num_bigint::BigUint;
use rand_core::{CryptoRng, RngCore};
use std::sync::OnceLock;
use zeroize::Zeroizing;

use crate::crypto::*;

/* RFC 3526 MODP groups, generator 2. */

const MODP_2048_PRIME: &[u8] = b"\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
    3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

const MODP_3072_PRIME: &[u8] = b"\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
    3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
    A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
    ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
    D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
    08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

/// Size in bytes of the random secret exponent. RFC 6189 asks for twice the security
/// strength of the group.
const DH_EXPONENT_SIZE: usize = 32;

fn parse_prime(hex: &[u8]) -> BigUint {
    BigUint::parse_bytes(hex, 16).unwrap_or_default()
}

fn modp_2048() -> &'static BigUint {
    static P: OnceLock<BigUint> = OnceLock::new();
    P.get_or_init(|| parse_prime(MODP_2048_PRIME))
}

fn modp_3072() -> &'static BigUint {
    static P: OnceLock<BigUint> = OnceLock::new();
    P.get_or_init(|| parse_prime(MODP_3072_PRIME))
}

/// Big-endian encoding of `v` left padded with zeros to `size` bytes.
fn to_padded_bytes(v: &BigUint, size: usize) -> Vec<u8> {
    let raw = v.to_bytes_be();
    let mut out = vec![0u8; size.saturating_sub(raw.len())];
    out.extend_from_slice(&raw);
    out
}

macro_rules! impl_modp {
    ($name:ident, $prime:ident, $size:expr) => {
        pub struct $name {
            exponent: Zeroizing<[u8; DH_EXPONENT_SIZE]>,
            public_value: Vec<u8>,
        }
        impl<Rng: RngCore + CryptoRng> KeyExchange<Rng> for $name {
            const PUBLIC_VALUE_SIZE: usize = $size;

            fn generate(rng: &mut Rng) -> Self {
                let mut exponent = Zeroizing::new([0u8; DH_EXPONENT_SIZE]);
                rng.fill_bytes(&mut exponent[..]);
                let x = BigUint::from_bytes_be(&exponent[..]);
                let public_value = to_padded_bytes(&BigUint::from(2u32).modpow(&x, $prime()), $size);
                Self { exponent, public_value }
            }

            fn public_value(&self) -> Vec<u8> {
                self.public_value.clone()
            }

            fn agree(&self, peer_public_value: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
                if peer_public_value.len() != $size {
                    return None;
                }
                let p = $prime();
                let pv = BigUint::from_bytes_be(peer_public_value);
                let one = BigUint::from(1u32);
                // 1 < pv < p - 1
                if pv <= one || pv >= p - &one {
                    return None;
                }
                let x = BigUint::from_bytes_be(&self.exponent[..]);
                Some(Zeroizing::new(to_padded_bytes(&pv.modpow(&x, p), $size)))
            }
        }
    };
}
impl_modp!(CrateDh2048, modp_2048, DH2048_PUBLIC_VALUE_SIZE);
impl_modp!(CrateDh3072, modp_3072, DH3072_PUBLIC_VALUE_SIZE);
