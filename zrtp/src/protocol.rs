use std::cmp::Ordering;

use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::application::CryptoLayer;
use crate::crypto::{SrtpEngine, SrtpProfile};
use crate::kdf::*;
use crate::packet::*;
use crate::profile::Profile;
use crate::proto::*;
use crate::registry::*;
use crate::result::{attack, AttackType, Error, ProtocolError};
use crate::session::*;

/// Compute the hash chain `H0..H3` from a random `H0`.
pub(crate) fn hash_chain<C: CryptoLayer>(h0: [u8; HASH_IMAGE_SIZE]) -> [[u8; HASH_IMAGE_SIZE]; 4] {
    let h1 = sha256::<C>(&[&h0]);
    let h2 = sha256::<C>(&[&h1]);
    let h3 = sha256::<C>(&[&h2]);
    [h0, h1, h2, h3]
}

fn message_mac<C: CryptoLayer>(key: &[u8], message: &[u8]) -> [u8; MESSAGE_MAC_SIZE] {
    hmac_sha256::<C>(key, &[mac_input(message)])[..MESSAGE_MAC_SIZE].try_into().unwrap()
}

/// Overwrite the trailing MAC of an encoded Hello, Commit or DHPart.
pub(crate) fn seal_message<C: CryptoLayer>(key: &[u8], message: &mut [u8]) {
    let mac = message_mac::<C>(key, message);
    let at = message.len() - MESSAGE_MAC_SIZE;
    message[at..].copy_from_slice(&mac);
}

/// Check the trailing MAC of an earlier message once its key was revealed.
pub(crate) fn verify_message<C: CryptoLayer>(key: &[u8], message: &[u8]) -> bool {
    message.len() >= MESSAGE_MAC_SIZE
        && bool::from(message_mac::<C>(key, message)[..].ct_eq(&message[message.len() - MESSAGE_MAC_SIZE..]))
}

/// Check a hash image revealed by the peer against the preimage committed to earlier.
///
/// `depth` is the number of hashes between the two: 1 when `revealed` is H1 and `committed`
/// is H2 and so on.
pub(crate) fn verify_chain<C: CryptoLayer>(revealed: &[u8; HASH_IMAGE_SIZE], committed: &[u8; HASH_IMAGE_SIZE], depth: usize) -> bool {
    let mut h = *revealed;
    for _ in 0..depth {
        h = sha256::<C>(&[&h]);
    }
    bool::from(h[..].ct_eq(&committed[..]))
}

/// Returns true if our Commit beats theirs and we stay Initiator.
///
/// A DH Commit beats a fast mode one. Otherwise the larger hv wins, compared as a big-endian
/// number over the length of the shorter one.
pub(crate) fn commit_wins(ours: &Commit, theirs: &Commit) -> bool {
    let is_dh = |c: &Commit| matches!(c.kind, CommitKind::Dh { .. });
    match (is_dh(ours), is_dh(theirs)) {
        (true, false) => true,
        (false, true) => false,
        _ => {
            let n = ours.hv().len().min(theirs.hv().len());
            ours.hv()[..n].cmp(&theirs.hv()[..n]) == Ordering::Greater
        }
    }
}

pub(crate) fn pad_client_id(client_id: &str) -> [u8; CLIENT_ID_SIZE] {
    let mut out = [b' '; CLIENT_ID_SIZE];
    let b = client_id.as_bytes();
    let n = b.len().min(CLIENT_ID_SIZE);
    out[..n].copy_from_slice(&b[..n]);
    out
}

fn codes<T: Component>(list: &[T]) -> CodeList {
    list.iter().map(|c| *c.wire_code()).collect()
}

/// Build our Hello, MAC'd with H2.
pub(crate) fn build_hello<C: CryptoLayer>(
    profile: &Profile,
    client_id: &[u8; CLIENT_ID_SIZE],
    zid: &Zid,
    flags: u8,
    h: &[[u8; HASH_IMAGE_SIZE]; 4],
) -> Vec<u8> {
    let hello = Hello {
        version: *ZRTP_VERSION,
        client_id: *client_id,
        h3: h[3],
        zid: *zid,
        flags,
        hash: codes(&profile.hash_schemes),
        cipher: codes(&profile.cipher_types),
        auth: codes(&profile.auth_tag_lens),
        pk: codes(&profile.pk_schemes),
        sas: codes(&profile.sas_schemes),
        mac: [0u8; MESSAGE_MAC_SIZE],
    };
    let mut b = Message::Hello(hello).encode();
    seal_message::<C>(&h[2], &mut b);
    b
}

pub(crate) fn peer_offers<T: Component>(hello: &Hello, c: T) -> bool {
    let list = match T::CATEGORY {
        ComponentCategory::Hash => &hello.hash,
        ComponentCategory::Cipher => &hello.cipher,
        ComponentCategory::AuthTag => &hello.auth,
        ComponentCategory::PublicKey => &hello.pk,
        ComponentCategory::Sas => &hello.sas,
    };
    list.iter().any(|code| code == c.wire_code())
}

/// Pick the components of a new Commit from the peer's Hello.
pub(crate) fn negotiate(profile: &Profile, hello: &Hello) -> Negotiated {
    let d = Negotiated::default();
    Negotiated {
        hash: profile.choose_best(&hello.hash).unwrap_or(d.hash),
        cipher: profile.choose_best(&hello.cipher).unwrap_or(d.cipher),
        auth_tag: profile.choose_best(&hello.auth).unwrap_or(d.auth_tag),
        sas: profile.choose_best(&hello.sas).unwrap_or(d.sas),
    }
}

fn accept_component<T: Component>(profile: &Profile, code: &[u8; COMPONENT_CODE_SIZE]) -> Result<T, ComponentCategory> {
    T::from_wire_code(code).filter(|c| profile.supports(*c)).ok_or(T::CATEGORY)
}

/// Validate the components named by a peer's Commit against what we offered.
pub(crate) fn accept_commit(profile: &Profile, commit: &Commit) -> Result<(Negotiated, PkType), ComponentCategory> {
    let n = Negotiated {
        hash: accept_component(profile, &commit.hash)?,
        cipher: accept_component(profile, &commit.cipher)?,
        auth_tag: accept_component(profile, &commit.auth)?,
        sas: accept_component(profile, &commit.sas)?,
    };
    let pk: PkType = accept_component(profile, &commit.pk)?;
    let consistent = match &commit.kind {
        CommitKind::Dh { .. } => pk.is_dh(),
        CommitKind::Multistream { .. } => pk == PkType::Multistream,
        CommitKind::Preshared { .. } => pk == PkType::Preshared,
    };
    if consistent {
        Ok((n, pk))
    } else {
        Err(ComponentCategory::PublicKey)
    }
}

/// Build a DHPart carrying our public value and the ids of our shared secrets, MAC'd with H0.
pub(crate) fn build_dhpart<C: CryptoLayer>(
    message_type: MessageType,
    s: &StreamInner<C>,
    secrets: &Secrets,
    hash: HashType,
    pv: Vec<u8>,
) -> Vec<u8> {
    let id = |v: &SecretBuf| secret_id::<C>(hash, v.as_bytes(), s.is_initiator);
    let d = DhPart {
        h1: s.h[1],
        rs1_id: id(&secrets.rs1.value),
        rs2_id: id(&secrets.rs2.value),
        aux_id: id(&secrets.aux.value),
        pbx_id: id(&secrets.pbx.value),
        pv,
        mac: [0u8; MESSAGE_MAC_SIZE],
    };
    let mut b = if message_type == MessageType::DhPart1 { Message::DhPart1(d) } else { Message::DhPart2(d) }.encode();
    seal_message::<C>(&s.h[0], &mut b);
    b
}

/// `hvi = hash(initiator's DHPart2 || responder's Hello)` truncated to 256 bits.
pub(crate) fn hvi<C: CryptoLayer>(hash: HashType, dhpart2: &[u8], responder_hello: &[u8]) -> [u8; HVI_SIZE] {
    hash.hash::<C>(&[dhpart2, responder_hello])[..HVI_SIZE].try_into().unwrap()
}

/// The preshared key built from RS1 and whichever of the auxiliary and PBX secrets are used.
pub(crate) fn preshared_key_for<C: CryptoLayer>(hash: HashType, secrets: &Secrets, aux: bool, pbx: bool) -> SecretBuf {
    preshared_key::<C>(
        hash,
        secrets.rs1.value.as_bytes(),
        aux.then(|| secrets.aux.value.as_bytes()),
        pbx.then(|| secrets.pbx.value.as_bytes()),
    )
}

/// Find the combination of our secrets that produced the peer's preshared key id.
///
/// Combinations are tried in a fixed order: RS1, RS1+PBX, RS1+Aux, RS1+Aux+PBX. The first
/// match wins. Returns the key and the `SECRET_BIT_*` of the secrets it used.
pub(crate) fn match_preshared_key<C: CryptoLayer>(
    hash: HashType,
    secrets: &Secrets,
    key_id: &[u8; KEY_ID_SIZE],
) -> Option<(SecretBuf, u32)> {
    if secrets.cached & SECRET_BIT_RS1 == 0 {
        return None;
    }
    let has_pbx = secrets.cached & SECRET_BIT_PBX != 0;
    for (aux, pbx) in [(false, false), (false, true), (true, false), (true, true)] {
        if pbx && !has_pbx {
            continue;
        }
        let key = preshared_key_for::<C>(hash, secrets, aux, pbx);
        if bool::from(preshared_key_id::<C>(hash, key.as_bytes())[..].ct_eq(&key_id[..])) {
            let bits = SECRET_BIT_RS1 | if aux { SECRET_BIT_AUX } else { 0 } | if pbx { SECRET_BIT_PBX } else { 0 };
            return Some((key, bits));
        }
    }
    None
}

/// Shared secrets selected for the S0 of a DH stream.
pub(crate) struct MatchedSecrets {
    pub s1: Option<SecretBuf>,
    pub s2: Option<SecretBuf>,
    pub s3: Option<SecretBuf>,
    /// `SECRET_BIT_*` of the secrets the peer also holds.
    pub matches: u32,
}

/// Compare the secret ids the peer sent in its DHPart with ours.
///
/// The first of rs1/rs1, rs1/rs2, rs2/rs1, rs2/rs2 that matches becomes s1.
pub(crate) fn match_secrets<C: CryptoLayer>(hash: HashType, secrets: &Secrets, peer: &DhPart, we_are_initiator: bool) -> MatchedSecrets {
    // Ids the peer would have computed for our values, under its own role label.
    let id = |v: &SecretBuf| secret_id::<C>(hash, v.as_bytes(), !we_are_initiator);
    let eq = |a: [u8; SECRET_ID_SIZE], b: &[u8; SECRET_ID_SIZE]| bool::from(a[..].ct_eq(&b[..]));
    let (rs1, rs2) = (id(&secrets.rs1.value), id(&secrets.rs2.value));

    let mut m = MatchedSecrets { s1: None, s2: None, s3: None, matches: 0 };
    if eq(rs1, &peer.rs1_id) || eq(rs1, &peer.rs2_id) {
        m.s1 = Some(secrets.rs1.value.clone());
        m.matches |= SECRET_BIT_RS1;
    } else if eq(rs2, &peer.rs1_id) {
        m.s1 = Some(secrets.rs2.value.clone());
        m.matches |= SECRET_BIT_RS1;
    }
    if eq(rs2, &peer.rs2_id) {
        m.matches |= SECRET_BIT_RS2;
        if m.s1.is_none() {
            m.s1 = Some(secrets.rs2.value.clone());
        }
    }
    if eq(id(&secrets.aux.value), &peer.aux_id) {
        m.s2 = Some(secrets.aux.value.clone());
        m.matches |= SECRET_BIT_AUX;
    }
    if eq(id(&secrets.pbx.value), &peer.pbx_id) {
        m.s3 = Some(secrets.pbx.value.clone());
        m.matches |= SECRET_BIT_PBX;
    }
    m
}

/// The messages hashed into `total_hash`, in wire order.
///
/// DH streams hash `Hello_r || Commit || DHPart1 || DHPart2`, fast streams
/// `Hello_r || Commit`.
pub(crate) fn total_hash<C: CryptoLayer>(hash: HashType, s: &StreamInner<C>) -> Option<HashValue> {
    let (hello_r, commit) = if s.is_initiator {
        (s.peer_hello.as_ref()?.1.as_slice(), s.commit.as_ref()?.1.as_slice())
    } else {
        (s.hello.as_slice(), s.peer_commit.as_ref()?.1.as_slice())
    };
    if s.mode == StreamMode::Dh {
        let peer_dhpart = s.peer_dhpart.as_ref()?.1.as_slice();
        let (dhpart1, dhpart2) = if s.is_initiator { (peer_dhpart, s.dhpart.as_slice()) } else { (s.dhpart.as_slice(), peer_dhpart) };
        Some(hash.hash::<C>(&[hello_r, commit, dhpart1, dhpart2]))
    } else {
        Some(hash.hash::<C>(&[hello_r, commit]))
    }
}

/// `ZIDi`, `ZIDr` for this stream.
pub(crate) fn zids<C: CryptoLayer>(s: &StreamInner<C>, zid: &Zid, peer_zid: &Zid) -> (Zid, Zid) {
    if s.is_initiator {
        (*zid, *peer_zid)
    } else {
        (*peer_zid, *zid)
    }
}

/// Derive S0 and every stream key, returning the SRTP engine for the stream.
///
/// For DH streams `dh_result` is the agreed secret and `matched` the shared secrets that
/// were found. The ZRTP session key is set from the first full stream of the session.
pub(crate) fn derive_keys<C: CryptoLayer>(
    s: &mut StreamInner<C>,
    st: &mut SessionState,
    zid: &Zid,
    dh: Option<(&[u8], &MatchedSecrets)>,
) -> Result<C::Srtp, Error> {
    let peer_zid = st.peer_zid.ok_or(Error::WrongState)?;
    let n = st.negotiated;
    let total = total_hash::<C>(n.hash, s).ok_or(Error::WrongState)?;
    let (zid_i, zid_r) = zids(s, zid, &peer_zid);
    s.kdf_context = kdf_context(&zid_i, &zid_r, &total);
    let ctx = s.kdf_context.clone();
    let hash_len = n.hash.digest_size();
    let key_len = n.cipher.key_size();

    s.s0 = match (s.mode, dh) {
        (StreamMode::Dh, Some((dh_result, m))) => s0_dh::<C>(
            n.hash,
            dh_result,
            &ctx,
            m.s1.as_ref().map(SecretBuf::as_bytes),
            m.s2.as_ref().map(SecretBuf::as_bytes),
            m.s3.as_ref().map(SecretBuf::as_bytes),
        ),
        (StreamMode::Preshared, _) => kdf::<C>(n.hash, s.preshared_key.as_bytes(), LABEL_PRESHARED_KEY, &ctx, hash_len),
        (StreamMode::Multistream, _) if !st.zrtpsess.is_empty() => {
            kdf::<C>(n.hash, st.zrtpsess.as_bytes(), LABEL_MULTISTREAM_KEY, &ctx, hash_len)
        }
        _ => return Err(Error::WrongState),
    };
    s.preshared_key.zeroize();
    let s0 = s.s0.clone();
    let k = |label: &[u8], len: usize| kdf::<C>(n.hash, s0.as_bytes(), label, &ctx, len);

    let (mackey_i, mackey_r) = (k(LABEL_INITIATOR_HMAC_KEY, hash_len), k(LABEL_RESPONDER_HMAC_KEY, hash_len));
    let (zrtpkey_i, zrtpkey_r) = (k(LABEL_INITIATOR_ZRTP_KEY, key_len), k(LABEL_RESPONDER_ZRTP_KEY, key_len));
    let srtp = |key_label: &[u8], salt_label: &[u8]| SrtpProfile {
        master_key: Zeroizing::new(k(key_label, key_len).as_bytes().to_vec()),
        master_salt: Zeroizing::new(k(salt_label, SRTP_SALT_SIZE).as_bytes().try_into().unwrap()),
        auth_tag_len: n.auth_tag.tag_size(),
    };
    let srtp_i = srtp(LABEL_INITIATOR_SRTP_KEY, LABEL_INITIATOR_SRTP_SALT);
    let srtp_r = srtp(LABEL_RESPONDER_SRTP_KEY, LABEL_RESPONDER_SRTP_SALT);

    let engine = if s.is_initiator {
        s.hmac_key = mackey_i;
        s.peer_hmac_key = mackey_r;
        s.zrtp_key = zrtpkey_i;
        s.peer_zrtp_key = zrtpkey_r;
        C::Srtp::new(&srtp_i, &srtp_r)
    } else {
        s.hmac_key = mackey_r;
        s.peer_hmac_key = mackey_i;
        s.zrtp_key = zrtpkey_r;
        s.peer_zrtp_key = zrtpkey_i;
        C::Srtp::new(&srtp_r, &srtp_i)
    };
    if st.zrtpsess.is_empty() && s.mode.is_full() {
        st.zrtpsess = k(LABEL_SESSION_KEY, hash_len);
    }
    engine.ok_or(Error::CryptoOperationFailure)
}

/// Encrypt a Confirm or SASrelay body with our ZRTP key and MAC it with our HMAC key.
pub(crate) fn seal_body<C: CryptoLayer>(
    s: &StreamInner<C>,
    hash: HashType,
    iv: [u8; CFB_IV_SIZE],
    mut body: [u8; CONFIRM_BODY_SIZE],
) -> Result<Sealed, Error> {
    if !CipherType::cfb_encrypt::<C>(s.zrtp_key.as_bytes(), &iv, &mut body) {
        return Err(Error::CryptoOperationFailure);
    }
    let mac = hash.hmac::<C>(s.hmac_key.as_bytes(), &[&body]);
    Ok(Sealed { mac: mac[..MESSAGE_MAC_SIZE].try_into().unwrap(), iv, body })
}

/// Verify a received Confirm or SASrelay with the peer's HMAC key, then decrypt it.
pub(crate) fn open_body<C: CryptoLayer>(s: &StreamInner<C>, hash: HashType, sealed: &Sealed) -> Result<[u8; CONFIRM_BODY_SIZE], Error> {
    let mac = hash.hmac::<C>(s.peer_hmac_key.as_bytes(), &[&sealed.body]);
    if !bool::from(mac[..MESSAGE_MAC_SIZE].ct_eq(&sealed.mac)) {
        return Err(attack!(AttackType::MessageMacMismatch));
    }
    let mut body = sealed.body;
    if !CipherType::cfb_decrypt::<C>(s.peer_zrtp_key.as_bytes(), &sealed.iv, &mut body) {
        return Err(Error::CryptoOperationFailure);
    }
    Ok(body)
}

/// The MAC a GoClear must carry: `MAC(hmackey, "Clear hmac")` truncated to 64 bits.
pub(crate) fn clear_mac<C: CryptoLayer>(hash: HashType, hmac_key: &SecretBuf) -> [u8; MESSAGE_MAC_SIZE] {
    hash.hmac::<C>(hmac_key.as_bytes(), &[LABEL_CLEAR_HMAC])[..MESSAGE_MAC_SIZE].try_into().unwrap()
}

/// The ProtocolError sent to the peer after a failed integrity check.
pub(crate) fn protocol_error_of(e: &Error) -> ProtocolError {
    match e {
        Error::PossibleAttack { error: AttackType::HviMismatch, .. } => ProtocolError::PossibleMitm2,
        Error::PossibleAttack { error: AttackType::InvalidPublicValue, .. } => ProtocolError::PossibleMitm1,
        Error::PossibleAttack { error: AttackType::UntrustedSasRelay, .. } => ProtocolError::PossibleMitm3,
        Error::PossibleAttack { .. } => ProtocolError::WrongMessageHash,
        Error::MalformedPacket => ProtocolError::InvalidPacket,
        Error::AlgorithmUnsupported(c) => ProtocolError::unsupported(*c),
        _ => ProtocolError::Software,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(kind: CommitKind) -> Commit {
        Commit {
            h2: [0u8; 32],
            zid: [0u8; 12],
            hash: *b"S256",
            cipher: *b"AES1",
            auth: *b"HS32",
            pk: *b"DH3k",
            sas: *b"B32 ",
            kind,
            mac: [0u8; 8],
        }
    }

    #[test]
    fn commit_race_is_antisymmetric() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        for i in 0..=255u8 {
            a[0] = i;
            b[0] = i.wrapping_mul(7).wrapping_add(3);
            a[31] = 1;
            let ca = commit(CommitKind::Dh { hvi: a });
            let cb = commit(CommitKind::Dh { hvi: b });
            if a != b {
                assert_ne!(commit_wins(&ca, &cb), commit_wins(&cb, &ca));
            }
        }
    }

    #[test]
    fn dh_beats_fast_modes() {
        let dh = commit(CommitKind::Dh { hvi: [0u8; 32] });
        let mult = commit(CommitKind::Multistream { nonce: [0xFF; 16] });
        let presh = commit(CommitKind::Preshared { nonce: [0xFF; 16], key_id: [0; 8] });
        assert!(commit_wins(&dh, &mult));
        assert!(!commit_wins(&mult, &dh));
        assert!(commit_wins(&dh, &presh));
        assert!(!commit_wins(&presh, &dh));
        let presh_low = commit(CommitKind::Preshared { nonce: [0x01; 16], key_id: [0; 8] });
        assert!(commit_wins(&presh, &presh_low));
        assert!(!commit_wins(&presh_low, &presh));
    }

    #[test]
    fn client_id_is_space_padded() {
        assert_eq!(&pad_client_id("ZRTP def. peer"), b"ZRTP def. peer  ");
        assert_eq!(&pad_client_id("a much longer client identifier"), b"a much longer cl");
    }

    #[test]
    fn accept_commit_checks_mode_consistency() {
        let p = Profile::default_for(crate::profile::LicenseMode::Active);
        let c = commit(CommitKind::Dh { hvi: [0u8; 32] });
        let (n, pk) = accept_commit(&p, &c).unwrap();
        assert_eq!((n.hash, n.cipher, pk), (HashType::Sha256, CipherType::Aes128, PkType::Dh3072));
        let mut bad = c.clone();
        bad.pk = *b"Mult";
        assert_eq!(accept_commit(&p, &bad), Err(ComponentCategory::PublicKey));
        let mut unknown = c;
        unknown.cipher = *b"2FS3";
        assert_eq!(accept_commit(&p, &unknown), Err(ComponentCategory::Cipher));
    }
}

#[cfg(all(test, feature = "default-crypto"))]
mod crypto_tests {
    use super::*;
    use crate::crypto_impl::TestCrypto;

    #[test]
    fn chain_and_message_macs() {
        let h = hash_chain::<TestCrypto>([9u8; 32]);
        assert!(verify_chain::<TestCrypto>(&h[0], &h[3], 3));
        assert!(verify_chain::<TestCrypto>(&h[1], &h[2], 1));
        assert!(!verify_chain::<TestCrypto>(&h[1], &h[3], 1));

        let p = Profile::default_for(crate::profile::LicenseMode::Active);
        let mut hello = build_hello::<TestCrypto>(&p, &pad_client_id("x"), &[1u8; 12], 0, &h);
        assert!(verify_message::<TestCrypto>(&h[2], &hello));
        assert!(!verify_message::<TestCrypto>(&h[1], &hello));
        hello[20] ^= 1;
        assert!(!verify_message::<TestCrypto>(&h[2], &hello));
    }

    #[test]
    fn preshared_combinations_in_order() {
        let mut secrets = Secrets::default();
        secrets.rs1.value = SecretBuf::from_slice(&[1u8; 32]);
        secrets.aux.value = SecretBuf::from_slice(&[2u8; 32]);
        secrets.pbx.value = SecretBuf::from_slice(&[3u8; 32]);
        secrets.cached = SECRET_BIT_RS1 | SECRET_BIT_PBX;
        let h = HashType::Sha256;
        for (aux, pbx) in [(false, false), (false, true), (true, false), (true, true)] {
            let key = preshared_key_for::<TestCrypto>(h, &secrets, aux, pbx);
            let id = preshared_key_id::<TestCrypto>(h, key.as_bytes());
            let (found, bits) = match_preshared_key::<TestCrypto>(h, &secrets, &id).unwrap();
            assert_eq!(found, key);
            assert_eq!(bits & SECRET_BIT_PBX != 0, pbx);
            assert_eq!(bits & SECRET_BIT_AUX != 0, aux);
        }
        secrets.cached = 0;
        let key = preshared_key_for::<TestCrypto>(h, &secrets, false, false);
        assert!(match_preshared_key::<TestCrypto>(h, &secrets, &preshared_key_id::<TestCrypto>(h, key.as_bytes())).is_none());
    }

    #[test]
    fn retained_secret_ids_cross_match() {
        let h = HashType::Sha256;
        let mut alice = Secrets::default();
        let mut bob = Secrets::default();
        alice.rs1.value = SecretBuf::from_slice(&[5u8; 32]);
        alice.rs2.value = SecretBuf::from_slice(&[6u8; 32]);
        // Bob missed the last call and still holds Alice's previous secret as his newest one.
        bob.rs1.value = SecretBuf::from_slice(&[6u8; 32]);
        bob.rs2.value = SecretBuf::from_slice(&[7u8; 32]);
        let id = |v: &SecretBuf, initiator| secret_id::<TestCrypto>(h, v.as_bytes(), initiator);
        let from_bob = DhPart {
            h1: [0u8; 32],
            rs1_id: id(&bob.rs1.value, false),
            rs2_id: id(&bob.rs2.value, false),
            aux_id: [0u8; 8],
            pbx_id: [0u8; 8],
            pv: Vec::new(),
            mac: [0u8; 8],
        };
        let m = match_secrets::<TestCrypto>(h, &alice, &from_bob, true);
        assert_eq!(m.matches, SECRET_BIT_RS1);
        assert_eq!(m.s1.unwrap().as_bytes(), &[6u8; 32]);
        assert!(m.s2.is_none() && m.s3.is_none());
    }
}
