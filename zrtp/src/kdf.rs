use std::fmt;

use arrayvec::ArrayVec;
use zeroize::Zeroize;

use crate::application::CryptoLayer;
use crate::proto::*;
use crate::registry::HashType;

/// A fixed capacity buffer for secrets and derived keys.
///
/// The storage is inline so that wiping it really clears the only copy of the key.
#[derive(Clone)]
pub struct SecretBuf {
    bytes: [u8; SECRET_BUFFER_SIZE],
    len: usize,
}

impl SecretBuf {
    pub const fn new() -> Self {
        Self { bytes: [0u8; SECRET_BUFFER_SIZE], len: 0 }
    }
    /// Copy at most `SECRET_BUFFER_SIZE` bytes of `value`.
    pub fn from_slice(value: &[u8]) -> Self {
        let mut s = Self::new();
        s.set(value);
        s
    }
    pub fn set(&mut self, value: &[u8]) {
        self.zeroize();
        self.len = value.len().min(SECRET_BUFFER_SIZE);
        self.bytes[..self.len].copy_from_slice(&value[..self.len]);
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// True if every byte of the backing storage is zero, not just the visible part.
    pub fn is_wiped(&self) -> bool {
        self.len == 0 && self.bytes.iter().all(|b| *b == 0)
    }
}

impl Default for SecretBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl Zeroize for SecretBuf {
    fn zeroize(&mut self) {
        self.bytes.zeroize();
        self.len = 0;
    }
}

impl Drop for SecretBuf {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl PartialEq for SecretBuf {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.len == other.len && bool::from(self.as_bytes().ct_eq(other.as_bytes()))
    }
}
impl Eq for SecretBuf {}

impl fmt::Debug for SecretBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuf({} bytes)", self.len)
    }
}

/// `ZIDi || ZIDr || total_hash`, bound into every key derived for a stream.
pub(crate) type KdfContext = ArrayVec<u8, { 2 * ZID_SIZE + MAX_HASH_SIZE }>;

pub(crate) fn kdf_context(zid_i: &Zid, zid_r: &Zid, total_hash: &[u8]) -> KdfContext {
    let mut c = KdfContext::new();
    c.try_extend_from_slice(zid_i).ok();
    c.try_extend_from_slice(zid_r).ok();
    c.try_extend_from_slice(&total_hash[..total_hash.len().min(MAX_HASH_SIZE)]).ok();
    c
}

/// RFC 6189 section 4.5.1:
/// `KDF(KI, Label, Context, L) = HMAC(KI, i || Label || 0x00 || Context || L)` with `i = 1`,
/// truncated to `length` bytes.
pub(crate) fn kdf<C: CryptoLayer>(hash: HashType, ki: &[u8], label: &[u8], context: &[u8], length: usize) -> SecretBuf {
    let l = ((length * 8) as u32).to_be_bytes();
    let mut out = hash.hmac::<C>(ki, &[&1u32.to_be_bytes(), label, &[0u8], context, &l]);
    let r = SecretBuf::from_slice(&out[..length.min(out.len())]);
    out.zeroize();
    r
}

/// S0 of a DH mode stream.
///
/// `S0 = hash(1 || DHResult || "ZRTP-HMAC-KDF" || ZIDi || ZIDr || total_hash || len(s1) || s1 || len(s2) || s2 || len(s3) || s3)`
/// where missing shared secrets are encoded with a zero length and no bytes.
pub(crate) fn s0_dh<C: CryptoLayer>(
    hash: HashType,
    dh_result: &[u8],
    context: &[u8],
    s1: Option<&[u8]>,
    s2: Option<&[u8]>,
    s3: Option<&[u8]>,
) -> SecretBuf {
    let lens = [s1, s2, s3].map(|s| (s.map_or(0, |s| s.len()) as u32).to_be_bytes());
    let mut out = hash.hash::<C>(&[
        &1u32.to_be_bytes(),
        dh_result,
        LABEL_KDF,
        context,
        &lens[0],
        s1.unwrap_or(&[]),
        &lens[1],
        s2.unwrap_or(&[]),
        &lens[2],
        s3.unwrap_or(&[]),
    ]);
    let r = SecretBuf::from_slice(&out);
    out.zeroize();
    r
}

/// `preshared_key = hash(len(rs1) || rs1 || len(auxsecret) || auxsecret || len(pbxsecret) || pbxsecret)`
pub(crate) fn preshared_key<C: CryptoLayer>(hash: HashType, rs1: &[u8], aux: Option<&[u8]>, pbx: Option<&[u8]>) -> SecretBuf {
    let lens = [Some(rs1), aux, pbx].map(|s| (s.map_or(0, |s| s.len()) as u32).to_be_bytes());
    let mut out = hash.hash::<C>(&[&lens[0], rs1, &lens[1], aux.unwrap_or(&[]), &lens[2], pbx.unwrap_or(&[])]);
    let r = SecretBuf::from_slice(&out);
    out.zeroize();
    r
}

/// The key id sent in a Preshared Commit: `MAC(preshared_key, "Prsh")` truncated to 64 bits.
pub(crate) fn preshared_key_id<C: CryptoLayer>(hash: HashType, preshared_key: &[u8]) -> [u8; KEY_ID_SIZE] {
    let mac = hash.hmac::<C>(preshared_key, &[LABEL_PRESHARED_KEY_ID]);
    mac[..KEY_ID_SIZE].try_into().unwrap()
}

/// Secret id advertised in DHPart: `MAC(secret, "Initiator" | "Responder")` truncated to 64 bits.
pub(crate) fn secret_id<C: CryptoLayer>(hash: HashType, secret: &[u8], initiator: bool) -> [u8; SECRET_ID_SIZE] {
    let label = if initiator { LABEL_INITIATOR } else { LABEL_RESPONDER };
    let mac = hash.hmac::<C>(secret, &[label]);
    mac[..SECRET_ID_SIZE].try_into().unwrap()
}

#[cfg(all(test, feature = "default-crypto"))]
mod tests {
    use super::*;
    use crate::crypto_impl::TestCrypto;

    #[test]
    fn kdf_known_answer() {
        let ki = [0x42u8; 32];
        let context = kdf_context(&[1u8; 12], &[2u8; 12], &[3u8; 32]);
        let k = kdf::<TestCrypto>(HashType::Sha256, &ki, b"ZRTP Session Key", &context, 32);
        assert_eq!(
            hex::encode(k.as_bytes()),
            "b77e724ec08aa230404e5ad8cf334e93d48db9597066deaeb586c051de40e3aa"
        );
        // The output length is part of the MAC input, a shorter key is not a prefix.
        let k16 = kdf::<TestCrypto>(HashType::Sha256, &ki, b"ZRTP Session Key", &context, 16);
        assert_eq!(k16.len(), 16);
        assert_ne!(k16.as_bytes(), &k.as_bytes()[..16]);
    }

    #[test]
    fn kdf_is_sensitive_to_every_input() {
        let context = kdf_context(&[1u8; 12], &[2u8; 12], &[3u8; 32]);
        let a = kdf::<TestCrypto>(HashType::Sha256, &[7u8; 32], b"SAS", &context, 32);
        assert_eq!(a, kdf::<TestCrypto>(HashType::Sha256, &[7u8; 32], b"SAS", &context, 32));
        let mut other = context.clone();
        other[30] ^= 1;
        assert_ne!(a, kdf::<TestCrypto>(HashType::Sha256, &[7u8; 32], b"SAS", &other, 32));
        assert_ne!(a, kdf::<TestCrypto>(HashType::Sha256, &[7u8; 32], b"SAt", &context, 32));
        assert_ne!(a, kdf::<TestCrypto>(HashType::Sha256, &[6u8; 32], b"SAS", &context, 32));
        assert_eq!(kdf::<TestCrypto>(HashType::Sha384, &[7u8; 32], b"SAS", &context, 48).len(), 48);
    }

    #[test]
    fn s0_encodes_missing_secrets_as_empty() {
        let context = kdf_context(&[1u8; 12], &[2u8; 12], &[3u8; 32]);
        let s0 = s0_dh::<TestCrypto>(HashType::Sha256, &[9u8; 64], &context, None, None, None);
        assert_eq!(
            hex::encode(s0.as_bytes()),
            "abb1a57aded840984989f491d14cc78d227408e98c70c388e02f69227808754e"
        );
        let s0_rs = s0_dh::<TestCrypto>(HashType::Sha256, &[9u8; 64], &context, Some(&[5u8; 32]), None, None);
        assert_ne!(s0, s0_rs);
    }

    #[test]
    fn secret_buf_wipes_storage() {
        let mut s = SecretBuf::from_slice(&[0xaa; 40]);
        assert_eq!(s.len(), 40);
        s.set(&[0xbb; 8]);
        assert_eq!(s.as_bytes(), &[0xbb; 8]);
        s.zeroize();
        assert!(s.is_wiped());
    }
}
