/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use arrayvec::ArrayVec;
use zeroize::Zeroizing;

use crate::application::CryptoLayer;
use crate::crypto::*;
use crate::proto::*;
use crate::result::Error;
use crate::sas;

/// The five kinds of algorithm ZRTP negotiates.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ComponentCategory {
    Hash,
    Cipher,
    AuthTag,
    PublicKey,
    Sas,
}

/// Output of one of the negotiable hash functions or HMACs.
pub type HashValue = ArrayVec<u8, MAX_HASH_SIZE>;

/// Common interface of the closed set of algorithms of each category.
///
/// Numeric ids are internal and stable. Lower public key ids denote cheaper key agreements,
/// negotiation relies on this ordering.
pub trait Component: Copy + Eq + Sized + 'static {
    const CATEGORY: ComponentCategory;
    /// Every algorithm of this category, in id order.
    const ALL: &'static [Self];

    fn id(self) -> u8;
    /// The 4 byte ASCII code used in Hello and Commit.
    fn wire_code(self) -> &'static [u8; COMPONENT_CODE_SIZE];
    /// Human readable name, as reported by `Context::session_get`.
    fn name(self) -> &'static str;
    /// Run a known answer test of the implementation provided by `C`.
    fn self_test<C: CryptoLayer>(self) -> bool;

    fn from_id(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.id() == id)
    }
    fn from_wire_code(code: &[u8]) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| &c.wire_code()[..] == code)
    }
}

fn digest<const N: usize, H: Sha2Hash<N>>(parts: &[&[u8]]) -> HashValue {
    let mut h = H::new();
    for p in parts {
        h.update(p);
    }
    h.finish().iter().copied().collect()
}

fn mac<const N: usize, H: HmacHash<N>>(key: &[u8], parts: &[&[u8]]) -> HashValue {
    let mut h = H::new(key);
    for p in parts {
        h.update(p);
    }
    h.finish().iter().copied().collect()
}

/// The implicit hash of ZRTP, used for the hash chain, message MACs and the signaling hash
/// no matter which hash was negotiated.
pub(crate) fn sha256<C: CryptoLayer>(parts: &[&[u8]]) -> [u8; SHA256_HASH_SIZE] {
    let mut h = C::Sha256::new();
    for p in parts {
        h.update(p);
    }
    h.finish()
}

pub(crate) fn hmac_sha256<C: CryptoLayer>(key: &[u8], parts: &[&[u8]]) -> [u8; SHA256_HASH_SIZE] {
    let mut h = C::HmacSha256::new(key);
    for p in parts {
        h.update(p);
    }
    h.finish()
}

/// Negotiable hash functions.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HashType {
    Sha256 = 1,
    Sha384 = 2,
}
impl HashType {
    pub fn digest_size(self) -> usize {
        match self {
            Self::Sha256 => SHA256_HASH_SIZE,
            Self::Sha384 => SHA384_HASH_SIZE,
        }
    }
    pub(crate) fn hash<C: CryptoLayer>(self, parts: &[&[u8]]) -> HashValue {
        match self {
            Self::Sha256 => digest::<SHA256_HASH_SIZE, C::Sha256>(parts),
            Self::Sha384 => digest::<SHA384_HASH_SIZE, C::Sha384>(parts),
        }
    }
    pub(crate) fn hmac<C: CryptoLayer>(self, key: &[u8], parts: &[&[u8]]) -> HashValue {
        match self {
            Self::Sha256 => mac::<SHA256_HASH_SIZE, C::HmacSha256>(key, parts),
            Self::Sha384 => mac::<SHA384_HASH_SIZE, C::HmacSha384>(key, parts),
        }
    }
}
impl Component for HashType {
    const CATEGORY: ComponentCategory = ComponentCategory::Hash;
    const ALL: &'static [Self] = &[Self::Sha256, Self::Sha384];

    fn id(self) -> u8 {
        self as u8
    }
    fn wire_code(self) -> &'static [u8; 4] {
        match self {
            Self::Sha256 => b"S256",
            Self::Sha384 => b"S384",
        }
    }
    fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
        }
    }
    fn self_test<C: CryptoLayer>(self) -> bool {
        let key = [0x0bu8; 20];
        let (h, m) = match self {
            Self::Sha256 => (
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
                "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7",
            ),
            Self::Sha384 => (
                "cb00753f45a35e8bb5a03d699ac65007272c32ab0eded1631a8b605a43ff5bed8086072ba1e7cc2358baeca134c825a7",
                "afd03944d84895626b0825f4ab46907f15f9dadbe4101ec682aa034c7cebc59cfaea9ea9076ede7f4af152e8b2fa9cb6",
            ),
        };
        hex::decode(h).map_or(false, |h| h[..] == self.hash::<C>(&[b"abc"])[..])
            && hex::decode(m).map_or(false, |m| m[..] == self.hmac::<C>(&key, &[b"Hi There"])[..])
    }
}

/// Negotiable block ciphers, used in CFB mode for Confirm/SASrelay and handed to SRTP.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CipherType {
    Aes128 = 1,
    Aes256 = 2,
}
impl CipherType {
    pub fn key_size(self) -> usize {
        match self {
            Self::Aes128 => AES_128_KEY_SIZE,
            Self::Aes256 => AES_256_KEY_SIZE,
        }
    }
    /// CFB-128 over the whole of `data`, which may end in a partial block.
    fn cfb<C: CryptoLayer, const DECRYPT: bool>(key: &[u8], iv: &[u8; AES_BLOCK_SIZE], data: &mut [u8]) -> bool {
        let aes = match C::Aes::new(key) {
            Some(aes) => aes,
            None => return false,
        };
        let mut feedback = Zeroizing::new(*iv);
        for chunk in data.chunks_mut(AES_BLOCK_SIZE) {
            let mut keystream = Zeroizing::new(*feedback);
            aes.encrypt_in_place(&mut keystream);
            if DECRYPT {
                feedback[..chunk.len()].copy_from_slice(chunk);
            }
            for (b, k) in chunk.iter_mut().zip(keystream.iter()) {
                *b ^= k;
            }
            if !DECRYPT {
                feedback[..chunk.len()].copy_from_slice(chunk);
            }
        }
        true
    }
    pub(crate) fn cfb_encrypt<C: CryptoLayer>(key: &[u8], iv: &[u8; AES_BLOCK_SIZE], data: &mut [u8]) -> bool {
        Self::cfb::<C, false>(key, iv, data)
    }
    pub(crate) fn cfb_decrypt<C: CryptoLayer>(key: &[u8], iv: &[u8; AES_BLOCK_SIZE], data: &mut [u8]) -> bool {
        Self::cfb::<C, true>(key, iv, data)
    }
}
impl Component for CipherType {
    const CATEGORY: ComponentCategory = ComponentCategory::Cipher;
    const ALL: &'static [Self] = &[Self::Aes128, Self::Aes256];

    fn id(self) -> u8 {
        self as u8
    }
    fn wire_code(self) -> &'static [u8; 4] {
        match self {
            Self::Aes128 => b"AES1",
            Self::Aes256 => b"AES3",
        }
    }
    fn name(self) -> &'static str {
        match self {
            Self::Aes128 => "AES-128",
            Self::Aes256 => "AES-256",
        }
    }
    fn self_test<C: CryptoLayer>(self) -> bool {
        // FIPS-197 appendix C.
        let (key, expected) = match self {
            Self::Aes128 => ("000102030405060708090a0b0c0d0e0f", "69c4e0d86a7b0430d8cdb78070b4c55a"),
            Self::Aes256 => (
                "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f",
                "8ea2b7ca516745bfeafc49904b496089",
            ),
        };
        let (key, expected) = match (hex::decode(key), hex::decode(expected)) {
            (Ok(k), Ok(e)) => (k, e),
            _ => return false,
        };
        let aes = match C::Aes::new(&key) {
            Some(aes) => aes,
            None => return false,
        };
        let mut block = [0u8; AES_BLOCK_SIZE];
        for (i, b) in block.iter_mut().enumerate() {
            *b = (i as u8) * 0x11;
        }
        aes.encrypt_in_place(&mut block);
        block[..] == expected[..]
    }
}

/// Negotiable SRTP authentication tag lengths. Both use HMAC-SHA1.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum AuthTagType {
    Hs32 = 1,
    Hs80 = 2,
}
impl AuthTagType {
    pub fn tag_size(self) -> usize {
        match self {
            Self::Hs32 => 4,
            Self::Hs80 => 10,
        }
    }
}
impl Component for AuthTagType {
    const CATEGORY: ComponentCategory = ComponentCategory::AuthTag;
    const ALL: &'static [Self] = &[Self::Hs32, Self::Hs80];

    fn id(self) -> u8 {
        self as u8
    }
    fn wire_code(self) -> &'static [u8; 4] {
        match self {
            Self::Hs32 => b"HS32",
            Self::Hs80 => b"HS80",
        }
    }
    fn name(self) -> &'static str {
        match self {
            Self::Hs32 => "HMAC-SHA1 32 bit",
            Self::Hs80 => "HMAC-SHA1 80 bit",
        }
    }
    fn self_test<C: CryptoLayer>(self) -> bool {
        // RFC 2202 test case 1.
        let mut h = C::HmacSha1::new(&[0x0b; 20]);
        h.update(b"Hi There");
        let tag = h.finish();
        hex::decode("b617318655057264e28bc0b6fb378c8ef146be00")
            .map_or(false, |e| e[..self.tag_size()] == tag[..self.tag_size()])
    }
}

/// Negotiable key agreement types.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PkType {
    Preshared = 1,
    Multistream = 2,
    Dh2048 = 3,
    Ec256 = 4,
    Dh3072 = 5,
    Ec384 = 6,
    Ec521 = 7,
}
impl PkType {
    /// True for the types that perform an actual key exchange.
    pub fn is_dh(self) -> bool {
        !matches!(self, Self::Preshared | Self::Multistream)
    }
    pub fn public_value_size(self) -> usize {
        match self {
            Self::Preshared | Self::Multistream => 0,
            Self::Dh2048 => DH2048_PUBLIC_VALUE_SIZE,
            Self::Ec256 => EC256_PUBLIC_VALUE_SIZE,
            Self::Dh3072 => DH3072_PUBLIC_VALUE_SIZE,
            Self::Ec384 => EC384_PUBLIC_VALUE_SIZE,
            Self::Ec521 => EC521_PUBLIC_VALUE_SIZE,
        }
    }
    pub(crate) fn generate<C: CryptoLayer>(self, rng: &mut C::Rng) -> Option<KeyPair<C>> {
        Some(match self {
            Self::Preshared | Self::Multistream => return None,
            Self::Dh2048 => KeyPair::Dh2048(C::Dh2048::generate(rng)),
            Self::Ec256 => KeyPair::Ec256(C::Ec256::generate(rng)),
            Self::Dh3072 => KeyPair::Dh3072(C::Dh3072::generate(rng)),
            Self::Ec384 => KeyPair::Ec384(C::Ec384::generate(rng)),
            Self::Ec521 => KeyPair::Ec521(C::Ec521::generate(rng)),
        })
    }
    /// Key agreement self test: two fresh key pairs must agree on the same secret.
    pub(crate) fn self_test_with<C: CryptoLayer>(self, rng: &mut C::Rng) -> bool {
        if !self.is_dh() {
            return true;
        }
        match (self.generate::<C>(rng), self.generate::<C>(rng)) {
            (Some(a), Some(b)) => {
                let (pa, pb) = (a.public_value(), b.public_value());
                pa.len() == self.public_value_size()
                    && matches!((a.agree(&pb), b.agree(&pa)), (Some(x), Some(y)) if x[..] == y[..])
            }
            _ => false,
        }
    }
}
impl Component for PkType {
    const CATEGORY: ComponentCategory = ComponentCategory::PublicKey;
    const ALL: &'static [Self] = &[
        Self::Preshared,
        Self::Multistream,
        Self::Dh2048,
        Self::Ec256,
        Self::Dh3072,
        Self::Ec384,
        Self::Ec521,
    ];

    fn id(self) -> u8 {
        self as u8
    }
    fn wire_code(self) -> &'static [u8; 4] {
        match self {
            Self::Preshared => b"Prsh",
            Self::Multistream => b"Mult",
            Self::Dh2048 => b"DH2k",
            Self::Ec256 => b"EC25",
            Self::Dh3072 => b"DH3k",
            Self::Ec384 => b"EC38",
            Self::Ec521 => b"EC52",
        }
    }
    fn name(self) -> &'static str {
        match self {
            Self::Preshared => "Preshared",
            Self::Multistream => "Multistream",
            Self::Dh2048 => "DH-2048",
            Self::Ec256 => "ECDH-256",
            Self::Dh3072 => "DH-3072",
            Self::Ec384 => "ECDH-384",
            Self::Ec521 => "ECDH-521",
        }
    }
    fn self_test<C: CryptoLayer>(self) -> bool {
        // Key agreement needs randomness, see `PkType::self_test_with`.
        true
    }
}

/// An ephemeral key pair of the negotiated key agreement.
pub(crate) enum KeyPair<C: CryptoLayer> {
    Dh2048(C::Dh2048),
    Ec256(C::Ec256),
    Dh3072(C::Dh3072),
    Ec384(C::Ec384),
    Ec521(C::Ec521),
}
impl<C: CryptoLayer> KeyPair<C> {
    pub(crate) fn public_value(&self) -> Vec<u8> {
        match self {
            Self::Dh2048(k) => k.public_value(),
            Self::Ec256(k) => k.public_value(),
            Self::Dh3072(k) => k.public_value(),
            Self::Ec384(k) => k.public_value(),
            Self::Ec521(k) => k.public_value(),
        }
    }
    pub(crate) fn agree(&self, peer_public_value: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        match self {
            Self::Dh2048(k) => k.agree(peer_public_value),
            Self::Ec256(k) => k.agree(peer_public_value),
            Self::Dh3072(k) => k.agree(peer_public_value),
            Self::Ec384(k) => k.agree(peer_public_value),
            Self::Ec521(k) => k.agree(peer_public_value),
        }
    }
}

/// Negotiable SAS rendering schemes.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SasType {
    Base32 = 1,
    Base256 = 2,
}
impl Component for SasType {
    const CATEGORY: ComponentCategory = ComponentCategory::Sas;
    const ALL: &'static [Self] = &[Self::Base32, Self::Base256];

    fn id(self) -> u8 {
        self as u8
    }
    fn wire_code(self) -> &'static [u8; 4] {
        match self {
            Self::Base32 => b"B32 ",
            Self::Base256 => b"B256",
        }
    }
    fn name(self) -> &'static str {
        match self {
            Self::Base32 => "Base-32",
            Self::Base256 => "Base-256",
        }
    }
    fn self_test<C: CryptoLayer>(self) -> bool {
        let rendered = sas::render(self, &[0xde, 0xad, 0xbe, 0xef]);
        match self {
            Self::Base32 => rendered.0 == "54s5" && rendered.1.is_empty(),
            Self::Base256 => rendered.0 == "tactics" && rendered.1 == "perceptive",
        }
    }
}

/// Any algorithm of any category.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum AnyComponent {
    Hash(HashType),
    Cipher(CipherType),
    AuthTag(AuthTagType),
    PublicKey(PkType),
    Sas(SasType),
}
impl AnyComponent {
    pub fn category(self) -> ComponentCategory {
        match self {
            Self::Hash(_) => ComponentCategory::Hash,
            Self::Cipher(_) => ComponentCategory::Cipher,
            Self::AuthTag(_) => ComponentCategory::AuthTag,
            Self::PublicKey(_) => ComponentCategory::PublicKey,
            Self::Sas(_) => ComponentCategory::Sas,
        }
    }
    pub fn id(self) -> u8 {
        match self {
            Self::Hash(c) => c.id(),
            Self::Cipher(c) => c.id(),
            Self::AuthTag(c) => c.id(),
            Self::PublicKey(c) => c.id(),
            Self::Sas(c) => c.id(),
        }
    }
    pub fn wire_code(self) -> &'static [u8; 4] {
        match self {
            Self::Hash(c) => c.wire_code(),
            Self::Cipher(c) => c.wire_code(),
            Self::AuthTag(c) => c.wire_code(),
            Self::PublicKey(c) => c.wire_code(),
            Self::Sas(c) => c.wire_code(),
        }
    }
    pub fn from_id(category: ComponentCategory, id: u8) -> Option<Self> {
        match category {
            ComponentCategory::Hash => HashType::from_id(id).map(Self::Hash),
            ComponentCategory::Cipher => CipherType::from_id(id).map(Self::Cipher),
            ComponentCategory::AuthTag => AuthTagType::from_id(id).map(Self::AuthTag),
            ComponentCategory::PublicKey => PkType::from_id(id).map(Self::PublicKey),
            ComponentCategory::Sas => SasType::from_id(id).map(Self::Sas),
        }
    }
    pub fn from_wire_code(category: ComponentCategory, code: &[u8]) -> Option<Self> {
        match category {
            ComponentCategory::Hash => HashType::from_wire_code(code).map(Self::Hash),
            ComponentCategory::Cipher => CipherType::from_wire_code(code).map(Self::Cipher),
            ComponentCategory::AuthTag => AuthTagType::from_wire_code(code).map(Self::AuthTag),
            ComponentCategory::PublicKey => PkType::from_wire_code(code).map(Self::PublicKey),
            ComponentCategory::Sas => SasType::from_wire_code(code).map(Self::Sas),
        }
    }
    fn self_test<C: CryptoLayer>(self, rng: &mut C::Rng) -> bool {
        match self {
            Self::Hash(c) => c.self_test::<C>(),
            Self::Cipher(c) => c.self_test::<C>(),
            Self::AuthTag(c) => c.self_test::<C>(),
            Self::PublicKey(c) => c.self_test_with::<C>(rng),
            Self::Sas(c) => c.self_test::<C>(),
        }
    }
}

const REGISTRY_CAPACITY: usize = 8;

fn category_index(category: ComponentCategory) -> usize {
    match category {
        ComponentCategory::Hash => 0,
        ComponentCategory::Cipher => 1,
        ComponentCategory::AuthTag => 2,
        ComponentCategory::PublicKey => 3,
        ComponentCategory::Sas => 4,
    }
}

/// Catalog of the algorithms this endpoint is willing to use, by category.
///
/// An algorithm only enters the registry after passing its self test.
#[derive(Clone, Default)]
pub struct Registry {
    lists: [ArrayVec<u8, REGISTRY_CAPACITY>; 5],
}
impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every algorithm known to this implementation.
    pub fn with_defaults<C: CryptoLayer>(rng: &mut C::Rng) -> Result<Self, Error> {
        let mut r = Self::new();
        for c in HashType::ALL {
            r.register::<C>(AnyComponent::Hash(*c), rng)?;
        }
        for c in CipherType::ALL {
            r.register::<C>(AnyComponent::Cipher(*c), rng)?;
        }
        for c in AuthTagType::ALL {
            r.register::<C>(AnyComponent::AuthTag(*c), rng)?;
        }
        for c in PkType::ALL {
            r.register::<C>(AnyComponent::PublicKey(*c), rng)?;
        }
        for c in SasType::ALL {
            r.register::<C>(AnyComponent::Sas(*c), rng)?;
        }
        Ok(r)
    }

    /// Self test `component` and append it to the list of its category.
    pub fn register<C: CryptoLayer>(&mut self, component: AnyComponent, rng: &mut C::Rng) -> Result<(), Error> {
        let list = &mut self.lists[category_index(component.category())];
        if list.contains(&component.id()) {
            return Ok(());
        }
        if !component.self_test::<C>(rng) {
            return Err(Error::CryptoOperationFailure);
        }
        list.try_push(component.id()).map_err(|_| Error::AllocationFailure)
    }

    /// Look up a registered algorithm.
    pub fn find(&self, category: ComponentCategory, id: u8) -> Option<AnyComponent> {
        if self.lists[category_index(category)].contains(&id) {
            AnyComponent::from_id(category, id)
        } else {
            None
        }
    }

    pub fn contains<T: Component>(&self, component: T) -> bool {
        self.find(T::CATEGORY, component.id()).is_some()
    }

    /// Convert a wire code to the internal id of a registered algorithm.
    pub fn type_code_to_id(&self, category: ComponentCategory, code: &[u8]) -> Option<u8> {
        AnyComponent::from_wire_code(category, code)
            .map(|c| c.id())
            .filter(|id| self.lists[category_index(category)].contains(id))
    }

    /// Convert the internal id of a registered algorithm to its wire code.
    pub fn id_to_type_code(&self, category: ComponentCategory, id: u8) -> Option<&'static [u8; 4]> {
        self.find(category, id).map(|c| c.wire_code())
    }
}
