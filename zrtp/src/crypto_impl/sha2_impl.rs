use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384};

use crate::crypto::*;

/// An alias for the SHA-256 type from the sha2 crate.
pub type CrateSha256 = Sha256;
impl Sha2Hash<SHA256_HASH_SIZE> for CrateSha256 {
    fn new() -> Self {
        Digest::new()
    }
    fn update(&mut self, data: &[u8]) {
        Digest::update(self, data)
    }
    fn finish(self) -> [u8; SHA256_HASH_SIZE] {
        self.finalize().into()
    }
}

/// An alias for the SHA-384 type from the sha2 crate.
pub type CrateSha384 = Sha384;
impl Sha2Hash<SHA384_HASH_SIZE> for CrateSha384 {
    fn new() -> Self {
        Digest::new()
    }
    fn update(&mut self, data: &[u8]) {
        Digest::update(self, data)
    }
    fn finish(self) -> [u8; SHA384_HASH_SIZE] {
        let mut out = [0u8; SHA384_HASH_SIZE];
        out.copy_from_slice(&self.finalize());
        out
    }
}

macro_rules! impl_hmac {
    ($name:ident, $hash:ty, $size:expr) => {
        pub struct $name(Hmac<$hash>);
        impl HmacHash<$size> for $name {
            fn new(key: &[u8]) -> Self {
                // HMAC accepts keys of any length.
                Self(Hmac::new_from_slice(key).unwrap())
            }
            fn update(&mut self, data: &[u8]) {
                self.0.update(data)
            }
            fn finish(self) -> [u8; $size] {
                let mut out = [0u8; $size];
                out.copy_from_slice(&self.0.finalize().into_bytes());
                out
            }
        }
    };
}
impl_hmac!(CrateHmacSha256, Sha256, SHA256_HASH_SIZE);
impl_hmac!(CrateHmacSha384, Sha384, SHA384_HASH_SIZE);
impl_hmac!(CrateHmacSha1, Sha1, SHA1_HASH_SIZE);
