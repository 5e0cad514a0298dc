use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypto::*;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha1 = Hmac<Sha1>;

const RTP_FIXED_HEADER_SIZE: usize = 12;
const RTCP_FIXED_HEADER_SIZE: usize = 8;
const SRTCP_INDEX_SIZE: usize = 4;
const SRTCP_E_FLAG: u32 = 0x8000_0000;
const SALT_SIZE: usize = 14;
const AUTH_KEY_SIZE: usize = 20;
const REPLAY_WINDOW_SIZE: u64 = 64;

/* RFC 3711 section 4.3 key derivation labels. */
const LABEL_RTP_CIPHER: u8 = 0x00;
const LABEL_RTP_AUTH: u8 = 0x01;
const LABEL_RTP_SALT: u8 = 0x02;
const LABEL_RTCP_CIPHER: u8 = 0x03;
const LABEL_RTCP_AUTH: u8 = 0x04;
const LABEL_RTCP_SALT: u8 = 0x05;

/// Apply the AES-CM keystream for `key` and `iv` to `data`. The key size selects AES-128 or AES-256.
fn aes_cm(key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> bool {
    match key.len() {
        AES_128_KEY_SIZE => Aes128Ctr::new_from_slices(key, iv).map(|mut c| c.apply_keystream(data)).is_ok(),
        AES_256_KEY_SIZE => Aes256Ctr::new_from_slices(key, iv).map(|mut c| c.apply_keystream(data)).is_ok(),
        _ => false,
    }
}

/// AES-CM PRF with a key derivation rate of zero.
fn prf(master_key: &[u8], master_salt: &[u8; SALT_SIZE], label: u8, out: &mut [u8]) -> bool {
    let mut iv = [0u8; 16];
    iv[..SALT_SIZE].copy_from_slice(master_salt);
    iv[7] ^= label;
    out.fill(0);
    aes_cm(master_key, &iv, out)
}

/// IV = salt XOR (SSRC << 64) XOR (index << 16).
fn packet_iv(salt: &[u8; SALT_SIZE], ssrc: u32, index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[4..8].copy_from_slice(&ssrc.to_be_bytes());
    iv[8..14].copy_from_slice(&index.to_be_bytes()[2..]);
    for (b, s) in iv.iter_mut().zip(salt.iter()) {
        *b ^= s;
    }
    iv
}

struct SessionKeys {
    cipher_key: Zeroizing<Vec<u8>>,
    auth_key: Zeroizing<[u8; AUTH_KEY_SIZE]>,
    salt: Zeroizing<[u8; SALT_SIZE]>,
}
impl SessionKeys {
    fn derive(master: &SrtpProfile, labels: [u8; 3]) -> Option<Self> {
        let mut keys = Self {
            cipher_key: Zeroizing::new(vec![0u8; master.master_key.len()]),
            auth_key: Zeroizing::new([0u8; AUTH_KEY_SIZE]),
            salt: Zeroizing::new([0u8; SALT_SIZE]),
        };
        let ok = prf(&master.master_key, &master.master_salt, labels[0], &mut keys.cipher_key)
            && prf(&master.master_key, &master.master_salt, labels[1], &mut keys.auth_key[..])
            && prf(&master.master_key, &master.master_salt, labels[2], &mut keys.salt[..]);
        ok.then_some(keys)
    }

    fn tag(&self, authenticated: &[u8], trailer: &[u8], tag_len: usize) -> Zeroizing<[u8; 20]> {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.auth_key[..]).unwrap();
        mac.update(authenticated);
        mac.update(trailer);
        let mut out = Zeroizing::new([0u8; 20]);
        out.copy_from_slice(&mac.finalize().into_bytes());
        out[tag_len..].fill(0);
        out
    }
}

/// Sliding window of the last `REPLAY_WINDOW_SIZE` packet indices.
#[derive(Default)]
struct ReplayWindow {
    highest: Option<u64>,
    bitmap: u64,
}
impl ReplayWindow {
    fn check(&self, index: u64) -> bool {
        match self.highest {
            None => true,
            Some(h) if index > h => true,
            Some(h) => h - index < REPLAY_WINDOW_SIZE && self.bitmap & (1 << (h - index)) == 0,
        }
    }
    fn update(&mut self, index: u64) {
        match self.highest {
            Some(h) if index <= h => self.bitmap |= 1 << (h - index),
            Some(h) => {
                let shift = index - h;
                self.bitmap = if shift >= REPLAY_WINDOW_SIZE { 0 } else { self.bitmap << shift };
                self.bitmap |= 1;
                self.highest = Some(index);
            }
            None => {
                self.bitmap = 1;
                self.highest = Some(index);
            }
        }
    }
}

struct Direction {
    rtp: SessionKeys,
    rtcp: SessionKeys,
    tag_len: usize,
}
impl Direction {
    fn new(master: &SrtpProfile) -> Option<Self> {
        if master.auth_tag_len == 0 || master.auth_tag_len > 20 {
            return None;
        }
        Some(Self {
            rtp: SessionKeys::derive(master, [LABEL_RTP_CIPHER, LABEL_RTP_AUTH, LABEL_RTP_SALT])?,
            rtcp: SessionKeys::derive(master, [LABEL_RTCP_CIPHER, LABEL_RTCP_AUTH, LABEL_RTCP_SALT])?,
            tag_len: master.auth_tag_len,
        })
    }
}

/// Length of the RTP header including CSRCs and the header extension, if the packet holds one.
fn rtp_header_len(packet: &[u8]) -> Option<usize> {
    if packet.len() < RTP_FIXED_HEADER_SIZE {
        return None;
    }
    let mut len = RTP_FIXED_HEADER_SIZE + 4 * (packet[0] & 0x0f) as usize;
    if packet[0] & 0x10 != 0 {
        let ext = packet.get(len + 2..len + 4)?;
        len += 4 + 4 * u16::from_be_bytes([ext[0], ext[1]]) as usize;
    }
    (len <= packet.len()).then_some(len)
}

/// AES-CM/HMAC-SHA1 SRTP and SRTCP with a 64 packet replay window.
pub struct CrateSrtp {
    outbound: Direction,
    inbound: Direction,
    out_roc: u32,
    out_last_seq: Option<u16>,
    out_rtcp_index: u32,
    in_roc: u32,
    in_highest_seq: Option<u16>,
    in_rtp_window: ReplayWindow,
    in_rtcp_window: ReplayWindow,
}

impl CrateSrtp {
    /// RFC 3711 appendix A index estimation.
    fn estimate_roc(&self, seq: u16) -> u32 {
        match self.in_highest_seq {
            None => self.in_roc,
            Some(s_l) if s_l < 0x8000 => {
                if seq > s_l && seq - s_l > 0x8000 {
                    self.in_roc.wrapping_sub(1)
                } else {
                    self.in_roc
                }
            }
            Some(s_l) => {
                if s_l - 0x8000 > seq {
                    self.in_roc.wrapping_add(1)
                } else {
                    self.in_roc
                }
            }
        }
    }
}

impl SrtpEngine for CrateSrtp {
    fn new(outbound: &SrtpProfile, inbound: &SrtpProfile) -> Option<Self> {
        Some(Self {
            outbound: Direction::new(outbound)?,
            inbound: Direction::new(inbound)?,
            out_roc: 0,
            out_last_seq: None,
            out_rtcp_index: 0,
            in_roc: 0,
            in_highest_seq: None,
            in_rtp_window: ReplayWindow::default(),
            in_rtcp_window: ReplayWindow::default(),
        })
    }

    fn protect_rtp(&mut self, packet: &mut Vec<u8>) -> bool {
        let header_len = match rtp_header_len(packet) {
            Some(l) => l,
            None => return false,
        };
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        if let Some(last) = self.out_last_seq {
            if seq < last && last - seq > 0x8000 {
                self.out_roc = self.out_roc.wrapping_add(1);
            }
        }
        self.out_last_seq = Some(seq);

        let keys = &self.outbound.rtp;
        let index = ((self.out_roc as u64) << 16) | seq as u64;
        let iv = packet_iv(&keys.salt, ssrc, index);
        if !aes_cm(&keys.cipher_key, &iv, &mut packet[header_len..]) {
            return false;
        }
        let tag = keys.tag(packet, &self.out_roc.to_be_bytes(), self.outbound.tag_len);
        packet.extend_from_slice(&tag[..self.outbound.tag_len]);
        true
    }

    fn unprotect_rtp(&mut self, packet: &mut Vec<u8>) -> bool {
        let tag_len = self.inbound.tag_len;
        if packet.len() < RTP_FIXED_HEADER_SIZE + tag_len {
            return false;
        }
        let body_len = packet.len() - tag_len;
        let header_len = match rtp_header_len(&packet[..body_len]) {
            Some(l) => l,
            None => return false,
        };
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let roc = self.estimate_roc(seq);
        let index = ((roc as u64) << 16) | seq as u64;
        if !self.in_rtp_window.check(index) {
            return false;
        }

        let keys = &self.inbound.rtp;
        let expected = keys.tag(&packet[..body_len], &roc.to_be_bytes(), tag_len);
        if !bool::from(expected[..tag_len].ct_eq(&packet[body_len..])) {
            return false;
        }
        let iv = packet_iv(&keys.salt, ssrc, index);
        if !aes_cm(&keys.cipher_key, &iv, &mut packet[header_len..body_len]) {
            return false;
        }
        packet.truncate(body_len);

        self.in_rtp_window.update(index);
        let highest = ((self.in_roc as u64) << 16) | self.in_highest_seq.unwrap_or(0) as u64;
        if self.in_highest_seq.is_none() || index > highest {
            self.in_roc = roc;
            self.in_highest_seq = Some(seq);
        }
        true
    }

    fn protect_rtcp(&mut self, packet: &mut Vec<u8>) -> bool {
        if packet.len() < RTCP_FIXED_HEADER_SIZE {
            return false;
        }
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let index = self.out_rtcp_index;
        self.out_rtcp_index = (self.out_rtcp_index + 1) & !SRTCP_E_FLAG;

        let keys = &self.outbound.rtcp;
        let iv = packet_iv(&keys.salt, ssrc, index as u64);
        if !aes_cm(&keys.cipher_key, &iv, &mut packet[RTCP_FIXED_HEADER_SIZE..]) {
            return false;
        }
        packet.extend_from_slice(&(index | SRTCP_E_FLAG).to_be_bytes());
        let tag = keys.tag(packet, &[], self.outbound.tag_len);
        packet.extend_from_slice(&tag[..self.outbound.tag_len]);
        true
    }

    fn unprotect_rtcp(&mut self, packet: &mut Vec<u8>) -> bool {
        let tag_len = self.inbound.tag_len;
        if packet.len() < RTCP_FIXED_HEADER_SIZE + SRTCP_INDEX_SIZE + tag_len {
            return false;
        }
        let auth_len = packet.len() - tag_len;
        let keys = &self.inbound.rtcp;
        let expected = keys.tag(&packet[..auth_len], &[], tag_len);
        if !bool::from(expected[..tag_len].ct_eq(&packet[auth_len..])) {
            return false;
        }
        let body_len = auth_len - SRTCP_INDEX_SIZE;
        let e_index = u32::from_be_bytes([
            packet[body_len],
            packet[body_len + 1],
            packet[body_len + 2],
            packet[body_len + 3],
        ]);
        let index = (e_index & !SRTCP_E_FLAG) as u64;
        if !self.in_rtcp_window.check(index) {
            return false;
        }
        if e_index & SRTCP_E_FLAG != 0 {
            let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
            let iv = packet_iv(&keys.salt, ssrc, index);
            if !aes_cm(&keys.cipher_key, &iv, &mut packet[RTCP_FIXED_HEADER_SIZE..body_len]) {
                return false;
            }
        }
        packet.truncate(body_len);
        self.in_rtcp_window.update(index);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(key: u8, tag: usize) -> SrtpProfile {
        SrtpProfile {
            master_key: Zeroizing::new(vec![key; 16]),
            master_salt: Zeroizing::new([key ^ 0x55; 14]),
            auth_tag_len: tag,
        }
    }

    fn rtp(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0x80, 0x00];
        p.extend_from_slice(&seq.to_be_bytes());
        p.extend_from_slice(&1234u32.to_be_bytes());
        p.extend_from_slice(&0xcafebabeu32.to_be_bytes());
        p.extend_from_slice(payload);
        p
    }

    #[test]
    fn rfc3711_key_derivation() {
        // RFC 3711 appendix B.3.
        let master_key = hex::decode("E1F97A0D3E018BE0D64FA32C06DE4139").unwrap();
        let master_salt: [u8; 14] = hex::decode("0EC675AD498AFEEBB6960B3AABE6").unwrap().try_into().unwrap();
        let mut out = [0u8; 16];
        assert!(prf(&master_key, &master_salt, LABEL_RTP_CIPHER, &mut out));
        assert_eq!(hex::encode_upper(out), "C61E7A93744F39EE10734AFE3FF7A087");
        let mut salt = [0u8; 14];
        assert!(prf(&master_key, &master_salt, LABEL_RTP_SALT, &mut salt));
        assert_eq!(hex::encode_upper(salt), "30CBBC08863D8C85D49DB34A9AE1");
    }

    #[test]
    fn rtp_protect_unprotect() {
        let a = profile(1, 10);
        let b = profile(2, 10);
        let mut alice = CrateSrtp::new(&a, &b).unwrap();
        let mut bob = CrateSrtp::new(&b, &a).unwrap();
        for seq in [65530u16, 65535, 0, 3] {
            let plain = rtp(seq, b"some audio frame");
            let mut p = plain.clone();
            assert!(alice.protect_rtp(&mut p));
            assert_eq!(p.len(), plain.len() + 10);
            assert_ne!(&p[12..plain.len()], &plain[12..]);
            let replay = p.clone();
            assert!(bob.unprotect_rtp(&mut p));
            assert_eq!(p, plain);
            let mut replay = replay;
            assert!(!bob.unprotect_rtp(&mut replay));
        }
        assert_eq!(bob.in_roc, 1);
    }

    #[test]
    fn rtp_rejects_tampering() {
        let a = profile(1, 4);
        let b = profile(2, 4);
        let mut alice = CrateSrtp::new(&a, &b).unwrap();
        let mut bob = CrateSrtp::new(&b, &a).unwrap();
        let mut p = rtp(7, b"payload");
        assert!(alice.protect_rtp(&mut p));
        p[13] ^= 1;
        assert!(!bob.unprotect_rtp(&mut p));
    }

    #[test]
    fn rtcp_protect_unprotect() {
        let a = profile(3, 10);
        let b = profile(4, 10);
        let mut alice = CrateSrtp::new(&a, &b).unwrap();
        let mut bob = CrateSrtp::new(&b, &a).unwrap();
        let plain = vec![0x80, 200, 0, 6, 0xca, 0xfe, 0xba, 0xbe, 1, 2, 3, 4, 5, 6, 7, 8];
        let mut p = plain.clone();
        assert!(alice.protect_rtcp(&mut p));
        assert_eq!(p.len(), plain.len() + 4 + 10);
        assert!(bob.unprotect_rtcp(&mut p));
        assert_eq!(p, plain);
    }
}
