use arrayvec::ArrayVec;
use crc::{Crc, CRC_32_ISCSI};

use crate::proto::*;
use crate::result::Error;

/// CRC-32c as used by SCTP and ZRTP.
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// All ZRTP message types.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum MessageType {
    Hello,
    HelloAck,
    Commit,
    DhPart1,
    DhPart2,
    Confirm1,
    Confirm2,
    Conf2Ack,
    Error,
    ErrorAck,
    GoClear,
    ClearAck,
    SasRelay,
    RelayAck,
    Ping,
    PingAck,
}

impl MessageType {
    const ALL: [Self; 16] = [
        Self::Hello,
        Self::HelloAck,
        Self::Commit,
        Self::DhPart1,
        Self::DhPart2,
        Self::Confirm1,
        Self::Confirm2,
        Self::Conf2Ack,
        Self::Error,
        Self::ErrorAck,
        Self::GoClear,
        Self::ClearAck,
        Self::SasRelay,
        Self::RelayAck,
        Self::Ping,
        Self::PingAck,
    ];

    pub fn tag(self) -> &'static [u8; MESSAGE_TYPE_SIZE] {
        match self {
            Self::Hello => b"Hello   ",
            Self::HelloAck => b"HelloACK",
            Self::Commit => b"Commit  ",
            Self::DhPart1 => b"DHPart1 ",
            Self::DhPart2 => b"DHPart2 ",
            Self::Confirm1 => b"Confirm1",
            Self::Confirm2 => b"Confirm2",
            Self::Conf2Ack => b"Conf2ACK",
            Self::Error => b"Error   ",
            Self::ErrorAck => b"ErrorACK",
            Self::GoClear => b"GoClear ",
            Self::ClearAck => b"ClearACK",
            Self::SasRelay => b"SASrelay",
            Self::RelayAck => b"RelayACK",
            Self::Ping => b"Ping    ",
            Self::PingAck => b"PingACK ",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| &t.tag()[..] == tag)
    }

    /// Smallest and largest valid size of the message, header included.
    fn size_bounds(self) -> (usize, usize) {
        let exact = |n| (n, n);
        match self {
            Self::Hello => (HELLO_STATIC_SIZE + MESSAGE_MAC_SIZE, HELLO_STATIC_SIZE + 5 * MAX_COMPONENTS * COMPONENT_CODE_SIZE + MESSAGE_MAC_SIZE),
            Self::Commit => (COMMIT_MULT_SIZE, COMMIT_DH_SIZE),
            Self::DhPart1 | Self::DhPart2 => (DHPART_STATIC_SIZE + MESSAGE_MAC_SIZE, MAX_ZRTP_PACKET_SIZE),
            Self::Confirm1 | Self::Confirm2 => exact(CONFIRM_SIZE),
            Self::SasRelay => exact(SASRELAY_SIZE),
            Self::Error => exact(ERROR_SIZE),
            Self::GoClear => exact(GOCLEAR_SIZE),
            Self::Ping => exact(PING_SIZE),
            Self::PingAck => exact(PINGACK_SIZE),
            Self::HelloAck | Self::Conf2Ack | Self::ErrorAck | Self::ClearAck | Self::RelayAck => exact(MESSAGE_HEADER_SIZE),
        }
    }

    /// Ping and PingACK are answered without touching any stream state.
    pub(crate) fn is_ping(self) -> bool {
        matches!(self, Self::Ping | Self::PingAck)
    }
}

/// The four byte algorithm codes a Hello advertises, per category.
pub(crate) type CodeList = ArrayVec<[u8; COMPONENT_CODE_SIZE], MAX_COMPONENTS>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Hello {
    pub version: [u8; 4],
    pub client_id: [u8; CLIENT_ID_SIZE],
    pub h3: [u8; HASH_IMAGE_SIZE],
    pub zid: Zid,
    pub flags: u8,
    pub hash: CodeList,
    pub cipher: CodeList,
    pub auth: CodeList,
    pub pk: CodeList,
    pub sas: CodeList,
    pub mac: [u8; MESSAGE_MAC_SIZE],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CommitKind {
    Dh { hvi: [u8; HVI_SIZE] },
    Multistream { nonce: [u8; NONCE_SIZE] },
    Preshared { nonce: [u8; NONCE_SIZE], key_id: [u8; KEY_ID_SIZE] },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Commit {
    pub h2: [u8; HASH_IMAGE_SIZE],
    pub zid: Zid,
    pub hash: [u8; 4],
    pub cipher: [u8; 4],
    pub auth: [u8; 4],
    pub pk: [u8; 4],
    pub sas: [u8; 4],
    pub kind: CommitKind,
    pub mac: [u8; MESSAGE_MAC_SIZE],
}

impl Commit {
    /// The value compared to break a Commit collision: hvi, or the nonce in fast modes.
    pub fn hv(&self) -> &[u8] {
        match &self.kind {
            CommitKind::Dh { hvi } => hvi,
            CommitKind::Multistream { nonce } | CommitKind::Preshared { nonce, .. } => nonce,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DhPart {
    pub h1: [u8; HASH_IMAGE_SIZE],
    pub rs1_id: [u8; SECRET_ID_SIZE],
    pub rs2_id: [u8; SECRET_ID_SIZE],
    pub aux_id: [u8; SECRET_ID_SIZE],
    pub pbx_id: [u8; SECRET_ID_SIZE],
    pub pv: Vec<u8>,
    pub mac: [u8; MESSAGE_MAC_SIZE],
}

/// Confirm and SASrelay share the same envelope: a MAC over the encrypted body, the CFB IV
/// and the encrypted body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Sealed {
    pub mac: [u8; MESSAGE_MAC_SIZE],
    pub iv: [u8; CFB_IV_SIZE],
    pub body: [u8; CONFIRM_BODY_SIZE],
}

/// Plaintext of a Confirm body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ConfirmBody {
    pub h0: [u8; HASH_IMAGE_SIZE],
    pub flags: u8,
    pub expire: u32,
}

impl ConfirmBody {
    pub fn encode(&self) -> [u8; CONFIRM_BODY_SIZE] {
        let mut b = [0u8; CONFIRM_BODY_SIZE];
        b[..HASH_IMAGE_SIZE].copy_from_slice(&self.h0);
        // Two bytes of padding and a zero signature length.
        b[HASH_IMAGE_SIZE + 3] = self.flags;
        b[HASH_IMAGE_SIZE + 4..].copy_from_slice(&self.expire.to_be_bytes());
        b
    }
    pub fn decode(b: &[u8; CONFIRM_BODY_SIZE]) -> Self {
        Self {
            h0: b[..HASH_IMAGE_SIZE].try_into().unwrap(),
            flags: b[HASH_IMAGE_SIZE + 3],
            expire: u32::from_be_bytes(b[HASH_IMAGE_SIZE + 4..].try_into().unwrap()),
        }
    }
}

/// Plaintext of a SASrelay body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SasRelayBody {
    pub flags: u8,
    pub rendering: [u8; COMPONENT_CODE_SIZE],
    pub sas_hash: [u8; SAS_HASH_SIZE],
}

impl SasRelayBody {
    pub fn encode(&self) -> [u8; SASRELAY_BODY_SIZE] {
        let mut b = [0u8; SASRELAY_BODY_SIZE];
        b[3] = self.flags;
        b[4..8].copy_from_slice(&self.rendering);
        b[8..].copy_from_slice(&self.sas_hash);
        b
    }
    pub fn decode(b: &[u8; SASRELAY_BODY_SIZE]) -> Self {
        Self {
            flags: b[3],
            rendering: b[4..8].try_into().unwrap(),
            sas_hash: b[8..].try_into().unwrap(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PingAck {
    pub version: [u8; 4],
    pub endpoint_hash: [u8; ENDPOINT_HASH_SIZE],
    pub peer_endpoint_hash: [u8; ENDPOINT_HASH_SIZE],
    pub ssrc: u32,
}

/// A decoded ZRTP message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    Hello(Hello),
    HelloAck,
    Commit(Commit),
    DhPart1(DhPart),
    DhPart2(DhPart),
    Confirm1(Sealed),
    Confirm2(Sealed),
    Conf2Ack,
    Error(u32),
    ErrorAck,
    GoClear([u8; MESSAGE_MAC_SIZE]),
    ClearAck,
    SasRelay(Sealed),
    RelayAck,
    Ping { version: [u8; 4], endpoint_hash: [u8; ENDPOINT_HASH_SIZE] },
    PingAck(PingAck),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Hello(_) => MessageType::Hello,
            Self::HelloAck => MessageType::HelloAck,
            Self::Commit(_) => MessageType::Commit,
            Self::DhPart1(_) => MessageType::DhPart1,
            Self::DhPart2(_) => MessageType::DhPart2,
            Self::Confirm1(_) => MessageType::Confirm1,
            Self::Confirm2(_) => MessageType::Confirm2,
            Self::Conf2Ack => MessageType::Conf2Ack,
            Self::Error(_) => MessageType::Error,
            Self::ErrorAck => MessageType::ErrorAck,
            Self::GoClear(_) => MessageType::GoClear,
            Self::ClearAck => MessageType::ClearAck,
            Self::SasRelay(_) => MessageType::SasRelay,
            Self::RelayAck => MessageType::RelayAck,
            Self::Ping { .. } => MessageType::Ping,
            Self::PingAck(_) => MessageType::PingAck,
        }
    }

    /// Serialize into a complete message: header, body and trailing MAC where applicable.
    pub fn encode(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(128);
        b.extend_from_slice(&ZRTP_PREAMBLE.to_be_bytes());
        b.extend_from_slice(&[0, 0]);
        b.extend_from_slice(self.message_type().tag());
        match self {
            Self::Hello(h) => {
                b.extend_from_slice(&h.version);
                b.extend_from_slice(&h.client_id);
                b.extend_from_slice(&h.h3);
                b.extend_from_slice(&h.zid);
                b.push(h.flags);
                b.push(h.hash.len() as u8);
                b.push(((h.cipher.len() as u8) << 4) | h.auth.len() as u8);
                b.push(((h.pk.len() as u8) << 4) | h.sas.len() as u8);
                for list in [&h.hash, &h.cipher, &h.auth, &h.pk, &h.sas] {
                    for code in list.iter() {
                        b.extend_from_slice(code);
                    }
                }
                b.extend_from_slice(&h.mac);
            }
            Self::Commit(c) => {
                b.extend_from_slice(&c.h2);
                b.extend_from_slice(&c.zid);
                for code in [&c.hash, &c.cipher, &c.auth, &c.pk, &c.sas] {
                    b.extend_from_slice(code);
                }
                match &c.kind {
                    CommitKind::Dh { hvi } => b.extend_from_slice(hvi),
                    CommitKind::Multistream { nonce } => b.extend_from_slice(nonce),
                    CommitKind::Preshared { nonce, key_id } => {
                        b.extend_from_slice(nonce);
                        b.extend_from_slice(key_id);
                    }
                }
                b.extend_from_slice(&c.mac);
            }
            Self::DhPart1(d) | Self::DhPart2(d) => {
                b.extend_from_slice(&d.h1);
                for id in [&d.rs1_id, &d.rs2_id, &d.aux_id, &d.pbx_id] {
                    b.extend_from_slice(id);
                }
                b.extend_from_slice(&d.pv);
                b.extend_from_slice(&d.mac);
            }
            Self::Confirm1(s) | Self::Confirm2(s) | Self::SasRelay(s) => {
                b.extend_from_slice(&s.mac);
                b.extend_from_slice(&s.iv);
                b.extend_from_slice(&s.body);
            }
            Self::Error(code) => b.extend_from_slice(&code.to_be_bytes()),
            Self::GoClear(mac) => b.extend_from_slice(mac),
            Self::Ping { version, endpoint_hash } => {
                b.extend_from_slice(version);
                b.extend_from_slice(endpoint_hash);
            }
            Self::PingAck(p) => {
                b.extend_from_slice(&p.version);
                b.extend_from_slice(&p.endpoint_hash);
                b.extend_from_slice(&p.peer_endpoint_hash);
                b.extend_from_slice(&p.ssrc.to_be_bytes());
            }
            Self::HelloAck | Self::Conf2Ack | Self::ErrorAck | Self::ClearAck | Self::RelayAck => {}
        }
        let words = (b.len() / 4) as u16;
        b[2..4].copy_from_slice(&words.to_be_bytes());
        b
    }

    /// Parse a complete message. The caller has already checked the CRC.
    pub fn decode(b: &[u8]) -> Result<Self, Error> {
        if b.len() < MESSAGE_HEADER_SIZE || b.len() % 4 != 0 {
            return Err(Error::MalformedPacket);
        }
        if u16::from_be_bytes([b[0], b[1]]) != ZRTP_PREAMBLE || u16::from_be_bytes([b[2], b[3]]) as usize * 4 != b.len() {
            return Err(Error::MalformedPacket);
        }
        let t = MessageType::from_tag(&b[4..MESSAGE_HEADER_SIZE]).ok_or(Error::MalformedPacket)?;
        let (min, max) = t.size_bounds();
        if b.len() < min || b.len() > max {
            return Err(Error::MalformedPacket);
        }
        let body = &b[MESSAGE_HEADER_SIZE..];
        let arr = |at: usize| -> [u8; 4] { body[at..at + 4].try_into().unwrap() };
        let mac_at = |len: usize| -> [u8; MESSAGE_MAC_SIZE] { b[len - MESSAGE_MAC_SIZE..].try_into().unwrap() };
        Ok(match t {
            MessageType::Hello => {
                let counts = [
                    (body[65] & 0x0f) as usize,
                    (body[66] >> 4) as usize,
                    (body[66] & 0x0f) as usize,
                    (body[67] >> 4) as usize,
                    (body[67] & 0x0f) as usize,
                ];
                if counts.iter().any(|n| *n > MAX_COMPONENTS) {
                    return Err(Error::MalformedPacket);
                }
                let total: usize = counts.iter().sum();
                if b.len() != HELLO_STATIC_SIZE + total * COMPONENT_CODE_SIZE + MESSAGE_MAC_SIZE {
                    return Err(Error::MalformedPacket);
                }
                let mut lists: [CodeList; 5] = Default::default();
                let mut at = HELLO_STATIC_SIZE - MESSAGE_HEADER_SIZE;
                for (list, n) in lists.iter_mut().zip(counts) {
                    for _ in 0..n {
                        list.push(arr(at));
                        at += COMPONENT_CODE_SIZE;
                    }
                }
                let [hash, cipher, auth, pk, sas] = lists;
                Message::Hello(Hello {
                    version: arr(0),
                    client_id: body[4..20].try_into().unwrap(),
                    h3: body[20..52].try_into().unwrap(),
                    zid: body[52..64].try_into().unwrap(),
                    flags: body[64],
                    hash,
                    cipher,
                    auth,
                    pk,
                    sas,
                    mac: mac_at(b.len()),
                })
            }
            MessageType::Commit => {
                let pk = arr(56);
                let kind = match (b.len(), &pk) {
                    (COMMIT_MULT_SIZE, b"Mult") => CommitKind::Multistream { nonce: body[64..80].try_into().unwrap() },
                    (COMMIT_PRESH_SIZE, b"Prsh") => CommitKind::Preshared {
                        nonce: body[64..80].try_into().unwrap(),
                        key_id: body[80..88].try_into().unwrap(),
                    },
                    (COMMIT_DH_SIZE, code) if code != b"Mult" && code != b"Prsh" => {
                        CommitKind::Dh { hvi: body[64..96].try_into().unwrap() }
                    }
                    _ => return Err(Error::MalformedPacket),
                };
                Message::Commit(Commit {
                    h2: body[..32].try_into().unwrap(),
                    zid: body[32..44].try_into().unwrap(),
                    hash: arr(44),
                    cipher: arr(48),
                    auth: arr(52),
                    pk,
                    sas: arr(60),
                    kind,
                    mac: mac_at(b.len()),
                })
            }
            MessageType::DhPart1 | MessageType::DhPart2 => {
                let d = DhPart {
                    h1: body[..32].try_into().unwrap(),
                    rs1_id: body[32..40].try_into().unwrap(),
                    rs2_id: body[40..48].try_into().unwrap(),
                    aux_id: body[48..56].try_into().unwrap(),
                    pbx_id: body[56..64].try_into().unwrap(),
                    pv: b[DHPART_STATIC_SIZE..b.len() - MESSAGE_MAC_SIZE].to_vec(),
                    mac: mac_at(b.len()),
                };
                if t == MessageType::DhPart1 {
                    Message::DhPart1(d)
                } else {
                    Message::DhPart2(d)
                }
            }
            MessageType::Confirm1 | MessageType::Confirm2 | MessageType::SasRelay => {
                let s = Sealed {
                    mac: body[..8].try_into().unwrap(),
                    iv: body[8..24].try_into().unwrap(),
                    body: body[24..64].try_into().unwrap(),
                };
                match t {
                    MessageType::Confirm1 => Message::Confirm1(s),
                    MessageType::Confirm2 => Message::Confirm2(s),
                    _ => Message::SasRelay(s),
                }
            }
            MessageType::Error => Message::Error(u32::from_be_bytes(arr(0))),
            MessageType::GoClear => Message::GoClear(body[..8].try_into().unwrap()),
            MessageType::Ping => Message::Ping { version: arr(0), endpoint_hash: body[4..12].try_into().unwrap() },
            MessageType::PingAck => Message::PingAck(PingAck {
                version: arr(0),
                endpoint_hash: body[4..12].try_into().unwrap(),
                peer_endpoint_hash: body[12..20].try_into().unwrap(),
                ssrc: u32::from_be_bytes(arr(20)),
            }),
            MessageType::HelloAck => Message::HelloAck,
            MessageType::Conf2Ack => Message::Conf2Ack,
            MessageType::ErrorAck => Message::ErrorAck,
            MessageType::ClearAck => Message::ClearAck,
            MessageType::RelayAck => Message::RelayAck,
        })
    }
}

/// The part of a message covered by its trailing MAC.
pub(crate) fn mac_input(message: &[u8]) -> &[u8] {
    &message[..message.len().saturating_sub(MESSAGE_MAC_SIZE)]
}

/// True if `packet` carries ZRTP rather than media.
pub fn is_zrtp_packet(packet: &[u8]) -> bool {
    packet.len() >= RTP_HEADER_SIZE && u32::from_be_bytes(packet[4..8].try_into().unwrap()) == ZRTP_MAGIC_COOKIE
}

/// Wrap a message into a ZRTP packet: RTP-shaped header, message, CRC.
pub(crate) fn frame(seq: u16, ssrc: u32, message: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(RTP_HEADER_SIZE + message.len() + CRC_SIZE);
    p.push(ZRTP_PACKET_HEADER_BYTE);
    p.push(0);
    p.extend_from_slice(&seq.to_be_bytes());
    p.extend_from_slice(&ZRTP_MAGIC_COOKIE.to_be_bytes());
    p.extend_from_slice(&ssrc.to_be_bytes());
    p.extend_from_slice(message);
    let crc = CASTAGNOLI.checksum(&p);
    p.extend_from_slice(&crc.to_be_bytes());
    p
}

/// The outer fields of a received ZRTP packet whose CRC checked out.
pub(crate) struct Preparsed<'a> {
    pub seq: u16,
    pub ssrc: u32,
    pub message: &'a [u8],
}

/// Check the framing and CRC of a ZRTP packet.
///
/// Failures here may be plain transmission errors and are never treated as attacks.
pub(crate) fn preparse(packet: &[u8]) -> Result<Preparsed<'_>, Error> {
    if packet.len() < MIN_ZRTP_PACKET_SIZE || packet.len() > MAX_ZRTP_PACKET_SIZE || !is_zrtp_packet(packet) {
        return Err(Error::MalformedPacket);
    }
    let crc_at = packet.len() - CRC_SIZE;
    let crc = u32::from_be_bytes(packet[crc_at..].try_into().unwrap());
    if CASTAGNOLI.checksum(&packet[..crc_at]) != crc {
        return Err(Error::MalformedPacket);
    }
    Ok(Preparsed {
        seq: u16::from_be_bytes([packet[2], packet[3]]),
        ssrc: u32::from_be_bytes(packet[8..12].try_into().unwrap()),
        message: &packet[RTP_HEADER_SIZE..crc_at],
    })
}

/// Extends 16 bit ZRTP sequence numbers to 32 bits the way RFC 3711 extends RTP ones.
#[derive(Default, Clone, Copy)]
pub(crate) struct SeqTracker {
    last: Option<u32>,
}

impl SeqTracker {
    pub fn extend(&self, seq: u16) -> u32 {
        match self.last {
            None => seq as u32,
            Some(last) => {
                let roc = last >> 16;
                let last_seq = last as u16;
                let roc = if last_seq > 0x8000 && seq < last_seq.wrapping_sub(0x8000) {
                    roc.wrapping_add(1)
                } else if last_seq < 0x8000 && seq > last_seq.wrapping_add(0x8000) {
                    roc.wrapping_sub(1)
                } else {
                    roc
                };
                (roc << 16) | seq as u32
            }
        }
    }
    /// Accept `seq` only if it is newer than everything seen so far.
    pub fn accept(&mut self, seq: u16) -> bool {
        let extended = self.extend(seq);
        match self.last {
            Some(last) if extended <= last => false,
            _ => {
                self.last = Some(extended);
                true
            }
        }
    }
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> Hello {
        Hello {
            version: *ZRTP_VERSION,
            client_id: *b"ZRTP def. peer  ",
            h3: [3u8; 32],
            zid: [7u8; 12],
            flags: HELLO_FLAG_MITM,
            hash: [*b"S256"].into_iter().collect(),
            cipher: [*b"AES3", *b"AES1"].into_iter().collect(),
            auth: [*b"HS32", *b"HS80"].into_iter().collect(),
            pk: [*b"EC25", *b"DH3k", *b"Mult"].into_iter().collect(),
            sas: [*b"B32 "].into_iter().collect(),
            mac: [9u8; 8],
        }
    }

    #[test]
    fn hello_layout() {
        let m = Message::Hello(hello()).encode();
        assert_eq!(m.len(), HELLO_STATIC_SIZE + 9 * 4 + MESSAGE_MAC_SIZE);
        assert_eq!(&m[..2], &[0x50, 0x5a]);
        assert_eq!(u16::from_be_bytes([m[2], m[3]]) as usize * 4, m.len());
        assert_eq!(&m[4..12], b"Hello   ");
        // Flags word: M flag, then hc, cc|ac, kc|sc.
        assert_eq!(&m[76..80], &[0x20, 0x01, 0x22, 0x31]);
        assert_eq!(&m[80..84], b"S256");
        assert_eq!(Message::decode(&m).unwrap(), Message::Hello(hello()));
    }

    #[test]
    fn hello_component_counts_must_match_length() {
        let mut m = Message::Hello(hello()).encode();
        m[77] = 2;
        assert_eq!(Message::decode(&m), Err(Error::MalformedPacket));
        m[77] = 8;
        assert_eq!(Message::decode(&m), Err(Error::MalformedPacket));
    }

    #[test]
    fn commit_sizes() {
        let mut c = Commit {
            h2: [2u8; 32],
            zid: [1u8; 12],
            hash: *b"S256",
            cipher: *b"AES1",
            auth: *b"HS32",
            pk: *b"DH3k",
            sas: *b"B32 ",
            kind: CommitKind::Dh { hvi: [5u8; 32] },
            mac: [0u8; 8],
        };
        assert_eq!(Message::Commit(c.clone()).encode().len(), COMMIT_DH_SIZE);
        c.pk = *b"Mult";
        c.kind = CommitKind::Multistream { nonce: [6u8; 16] };
        let m = Message::Commit(c.clone()).encode();
        assert_eq!(m.len(), COMMIT_MULT_SIZE);
        assert_eq!(Message::decode(&m).unwrap(), Message::Commit(c.clone()));
        c.pk = *b"Prsh";
        c.kind = CommitKind::Preshared { nonce: [6u8; 16], key_id: [4u8; 8] };
        assert_eq!(Message::Commit(c).encode().len(), COMMIT_PRESH_SIZE);
    }

    #[test]
    fn commit_kind_must_match_pk_type() {
        let c = Commit {
            h2: [2u8; 32],
            zid: [1u8; 12],
            hash: *b"S256",
            cipher: *b"AES1",
            auth: *b"HS32",
            pk: *b"Mult",
            sas: *b"B32 ",
            kind: CommitKind::Dh { hvi: [5u8; 32] },
            mac: [0u8; 8],
        };
        assert_eq!(Message::decode(&Message::Commit(c).encode()), Err(Error::MalformedPacket));
    }

    #[test]
    fn fixed_size_messages() {
        assert_eq!(Message::HelloAck.encode().len(), MESSAGE_HEADER_SIZE);
        assert_eq!(Message::Error(0x62).encode().len(), ERROR_SIZE);
        assert_eq!(Message::GoClear([1; 8]).encode().len(), GOCLEAR_SIZE);
        let s = Sealed { mac: [1; 8], iv: [2; 16], body: [3; 40] };
        assert_eq!(Message::Confirm1(s.clone()).encode().len(), CONFIRM_SIZE);
        assert_eq!(Message::decode(&Message::SasRelay(s.clone()).encode()).unwrap(), Message::SasRelay(s));
        let p = Message::Ping { version: *ZRTP_VERSION, endpoint_hash: [8; 8] };
        assert_eq!(p.encode().len(), PING_SIZE);
        assert_eq!(Message::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn confirm_body_layout() {
        let c = ConfirmBody { h0: [0xab; 32], flags: CONFIRM_FLAG_VERIFIED | CONFIRM_FLAG_ALLOWCLEAR, expire: 0x01020304 };
        let b = c.encode();
        assert_eq!(&b[32..40], &[0, 0, 0, 0x06, 1, 2, 3, 4]);
        assert_eq!(ConfirmBody::decode(&b), c);
    }

    #[test]
    fn framing_and_crc() {
        let m = Message::HelloAck.encode();
        let mut p = frame(0x1234, 0xdeadbeef, &m);
        assert!(is_zrtp_packet(&p));
        assert_eq!(p.len(), RTP_HEADER_SIZE + m.len() + CRC_SIZE);
        let pp = preparse(&p).unwrap();
        assert_eq!(pp.seq, 0x1234);
        assert_eq!(pp.ssrc, 0xdeadbeef);
        assert_eq!(pp.message, &m[..]);
        p[14] ^= 1;
        assert!(preparse(&p).is_err());
    }

    #[test]
    fn sequence_extension() {
        let mut t = SeqTracker::default();
        assert!(t.accept(65534));
        assert!(t.accept(65535));
        assert!(t.accept(0));
        assert_eq!(t.extend(1), 0x1_0001);
        assert!(!t.accept(65535));
        assert!(!t.accept(0));
        assert!(t.accept(2));
    }
}
