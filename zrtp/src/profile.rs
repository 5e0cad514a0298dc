use arrayvec::ArrayVec;

use crate::proto::*;
use crate::registry::*;
use crate::result::Error;

/// Controls which side of a call may send a Commit.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum LicenseMode {
    /// Never sends a Commit, can only become Responder.
    Passive,
    /// Sends a Commit only to peers that are not passive.
    Active,
    /// Sends a Commit to anyone.
    Unlimited,
}

/// The role of this endpoint in the signaling exchange that set up the call, if known.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum SignalingRole {
    Unknown,
    Initiator,
    Responder,
}

/// Algorithm preference lists and stream options, copied into every session.
///
/// Each list is ordered from most to least preferred.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Profile {
    /// Start the secure handshake as soon as the Hello exchange completes.
    pub autosecure: bool,
    /// Allow switching a secure stream back to clear.
    pub allowclear: bool,
    /// Set the disclose flag in Confirm.
    pub disclose_bit: bool,
    /// Answer a Hello with a Commit directly instead of a HelloACK when possible.
    pub discovery_optimization: bool,
    /// Retained secret lifetime in seconds.
    pub cache_ttl: u32,
    pub sas_schemes: ArrayVec<SasType, MAX_COMPONENTS>,
    pub cipher_types: ArrayVec<CipherType, MAX_COMPONENTS>,
    pub auth_tag_lens: ArrayVec<AuthTagType, MAX_COMPONENTS>,
    pub hash_schemes: ArrayVec<HashType, MAX_COMPONENTS>,
    pub pk_schemes: ArrayVec<PkType, MAX_COMPONENTS>,
}

impl Profile {
    pub fn default_for(license: LicenseMode) -> Self {
        let pk: &[PkType] = if license == LicenseMode::Passive {
            &[PkType::Dh2048, PkType::Ec256, PkType::Dh3072, PkType::Multistream]
        } else {
            &[PkType::Ec256, PkType::Dh3072, PkType::Dh2048, PkType::Multistream]
        };
        Self {
            autosecure: true,
            allowclear: false,
            disclose_bit: false,
            discovery_optimization: true,
            cache_ttl: DEFAULT_CACHE_TTL,
            sas_schemes: [SasType::Base256, SasType::Base32].into_iter().collect(),
            cipher_types: [CipherType::Aes256, CipherType::Aes128].into_iter().collect(),
            auth_tag_lens: [AuthTagType::Hs32, AuthTagType::Hs80].into_iter().collect(),
            hash_schemes: [HashType::Sha256].into_iter().collect(),
            pk_schemes: pk.iter().copied().collect(),
        }
    }

    /// Verify that the profile lists the algorithms every ZRTP endpoint must offer and that
    /// everything it lists was registered.
    pub fn check(&self, registry: &Registry, has_cache: bool) -> Result<(), Error> {
        if !self.hash_schemes.contains(&HashType::Sha256) {
            return Err(Error::AlgorithmUnsupported(ComponentCategory::Hash));
        }
        if !self.sas_schemes.contains(&SasType::Base32) {
            return Err(Error::AlgorithmUnsupported(ComponentCategory::Sas));
        }
        if !self.cipher_types.contains(&CipherType::Aes128) {
            return Err(Error::AlgorithmUnsupported(ComponentCategory::Cipher));
        }
        if !self.auth_tag_lens.contains(&AuthTagType::Hs32) || !self.auth_tag_lens.contains(&AuthTagType::Hs80) {
            return Err(Error::AlgorithmUnsupported(ComponentCategory::AuthTag));
        }
        if !self.pk_schemes.contains(&PkType::Dh3072) || !self.pk_schemes.contains(&PkType::Multistream) {
            return Err(Error::AlgorithmUnsupported(ComponentCategory::PublicKey));
        }
        if self.pk_schemes.contains(&PkType::Preshared) && !has_cache {
            return Err(Error::BadParameter);
        }
        let all_registered = self.hash_schemes.iter().all(|c| registry.contains(*c))
            && self.cipher_types.iter().all(|c| registry.contains(*c))
            && self.auth_tag_lens.iter().all(|c| registry.contains(*c))
            && self.pk_schemes.iter().all(|c| registry.contains(*c))
            && self.sas_schemes.iter().all(|c| registry.contains(*c));
        if !all_registered {
            return Err(Error::BadParameter);
        }
        Ok(())
    }

    /// ECDH-384 needs SHA-384 per RFC 6189 section 5.1.5.
    pub(crate) fn adjust_hash_for_pk(&mut self) {
        if self.pk_schemes.contains(&PkType::Ec384) && !self.hash_schemes.contains(&HashType::Sha384) {
            self.hash_schemes.clear();
            self.hash_schemes.push(HashType::Sha384);
            self.hash_schemes.push(HashType::Sha256);
        }
    }

    pub(crate) fn supports<T: Component>(&self, c: T) -> bool {
        self.list::<T>().iter().any(|id| *id == c.id())
    }

    fn list<T: Component>(&self) -> ArrayVec<u8, MAX_COMPONENTS> {
        match T::CATEGORY {
            ComponentCategory::Hash => self.hash_schemes.iter().map(|c| c.id()).collect(),
            ComponentCategory::Cipher => self.cipher_types.iter().map(|c| c.id()).collect(),
            ComponentCategory::AuthTag => self.auth_tag_lens.iter().map(|c| c.id()).collect(),
            ComponentCategory::PublicKey => self.pk_schemes.iter().map(|c| c.id()).collect(),
            ComponentCategory::Sas => self.sas_schemes.iter().map(|c| c.id()).collect(),
        }
    }

    /// Pick the algorithm of category `T` to use with a peer advertising `peer_codes`.
    ///
    /// For everything but key agreement this is the first of our preferences the peer also
    /// offers. For key agreement only DH types are considered, and the cheaper of our first
    /// shared choice and the peer's first shared choice wins.
    pub(crate) fn choose_best<T: Component>(&self, peer_codes: &[[u8; COMPONENT_CODE_SIZE]]) -> Option<T> {
        let peer: ArrayVec<T, MAX_COMPONENTS> = peer_codes.iter().filter_map(|c| T::from_wire_code(c)).collect();
        let local: ArrayVec<T, MAX_COMPONENTS> = self.list::<T>().iter().filter_map(|id| T::from_id(*id)).collect();
        if T::CATEGORY != ComponentCategory::PublicKey {
            return local.iter().copied().find(|c| peer.contains(c));
        }
        let is_dh = |c: &T| PkType::from_id(c.id()).map_or(false, PkType::is_dh);
        let local_first = local.iter().copied().filter(is_dh).find(|c| peer.contains(c));
        let peer_first = peer.iter().copied().filter(is_dh).find(|c| local.contains(c));
        match (local_first, peer_first) {
            (Some(l), Some(p)) => Some(if p.id() < l.id() { p } else { l }),
            (l, p) => l.or(p),
        }
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::default_for(LicenseMode::Passive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes<T: Component>(list: &[T]) -> Vec<[u8; 4]> {
        list.iter().map(|c| *c.wire_code()).collect()
    }

    #[test]
    fn first_local_preference_wins() {
        let p = Profile::default_for(LicenseMode::Active);
        let peer = codes(&[CipherType::Aes128, CipherType::Aes256]);
        assert_eq!(p.choose_best::<CipherType>(&peer), Some(CipherType::Aes256));
        assert_eq!(p.choose_best::<SasType>(&codes(&[SasType::Base32])), Some(SasType::Base32));
        assert_eq!(p.choose_best::<HashType>(&codes(&[HashType::Sha384])), None);
        assert_eq!(p.choose_best::<HashType>(&[*b"XXXX", *b"S256"]), Some(HashType::Sha256));
    }

    #[test]
    fn cheapest_dh_of_both_first_choices() {
        let p = Profile::default_for(LicenseMode::Active);
        // We prefer EC25, the peer prefers DH3k: EC25 has the lower id.
        let peer = codes(&[PkType::Dh3072, PkType::Ec256, PkType::Multistream]);
        assert_eq!(p.choose_best::<PkType>(&peer), Some(PkType::Ec256));
        // The peer prefers DH2k which is cheaper than our EC25.
        let peer = codes(&[PkType::Dh2048, PkType::Ec256]);
        assert_eq!(p.choose_best::<PkType>(&peer), Some(PkType::Dh2048));
        // Multistream is never the answer.
        assert_eq!(p.choose_best::<PkType>(&codes(&[PkType::Multistream])), None);
    }

    #[cfg(feature = "default-crypto")]
    #[test]
    fn profile_check() {
        let mut rng = rand_core::OsRng;
        let registry = Registry::with_defaults::<crate::crypto_impl::TestCrypto>(&mut rng).unwrap();
        let mut p = Profile::default_for(LicenseMode::Unlimited);
        assert!(p.check(&registry, false).is_ok());
        p.pk_schemes.insert(0, PkType::Preshared);
        assert_eq!(p.check(&registry, false), Err(Error::BadParameter));
        assert!(p.check(&registry, true).is_ok());
        p.cipher_types.retain(|c| *c != CipherType::Aes128);
        assert_eq!(p.check(&registry, true), Err(Error::AlgorithmUnsupported(ComponentCategory::Cipher)));
    }

    #[test]
    fn ec384_forces_sha384() {
        let mut p = Profile::default_for(LicenseMode::Active);
        p.adjust_hash_for_pk();
        assert_eq!(&p.hash_schemes[..], &[HashType::Sha256]);
        p.pk_schemes.insert(0, PkType::Ec384);
        p.adjust_hash_for_pk();
        assert_eq!(&p.hash_schemes[..], &[HashType::Sha384, HashType::Sha256]);
    }
}
