use std::sync::Arc;

use crate::application::CryptoLayer;
use crate::packet::MessageType;
use crate::session::{Session, StreamHandle, StreamState};

/// Why an incoming ZRTP packet was discarded without changing any state.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum DropReason {
    /// Bad CRC, length or message framing.
    Malformed,
    /// The sequence number did not advance.
    Replayed,
    /// The message is not valid in the current state.
    Unexpected(MessageType),
    /// The peer speaks a newer protocol version, we wait for it to downgrade.
    NewerVersion,
    /// The Hello carries both the passive and the unlimited flag.
    ConflictingFlags,
    /// The Hello announces signed SAS, which is not supported.
    SignatureRequested,
    /// A GoClear whose MAC did not verify.
    BadClearMac,
    /// A Commit that lost the race against one of our own streams.
    LostCommitRace,
}

/// ZRTP events that might be interesting to log or aggregate into metrics.
#[allow(missing_docs)]
pub enum LogEvent<'a, C: CryptoLayer> {
    SentMessage(&'a StreamHandle<C>, MessageType),
    ResentMessage(&'a StreamHandle<C>, MessageType),
    ReceivedMessage(&'a StreamHandle<C>, MessageType),
    RetriesExhausted(&'a StreamHandle<C>, MessageType),
    /// `(stream, from, to)`
    StateChanged(&'a StreamHandle<C>, StreamState, StreamState),
    DroppedPacket(&'a StreamHandle<C>, DropReason),
    AnsweredPing(&'a StreamHandle<C>),
    /// `(session, bits of the secrets restored from the cache)`
    LoadedSecrets(&'a Arc<Session<C>>, u32),
    StoredRetainedSecret(&'a Arc<Session<C>>),
    /// A retained secret was withheld from the cache until the SAS is verified.
    DeferredRetainedSecret(&'a Arc<Session<C>>),
    CacheWriteFailed(&'a Arc<Session<C>>),
}

impl<'a, C: CryptoLayer> std::fmt::Debug for LogEvent<'a, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SentMessage(s, t) => f.debug_tuple("SentMessage").field(&s.id()).field(t).finish(),
            Self::ResentMessage(s, t) => f.debug_tuple("ResentMessage").field(&s.id()).field(t).finish(),
            Self::ReceivedMessage(s, t) => f.debug_tuple("ReceivedMessage").field(&s.id()).field(t).finish(),
            Self::RetriesExhausted(s, t) => f.debug_tuple("RetriesExhausted").field(&s.id()).field(t).finish(),
            Self::StateChanged(s, from, to) => write!(f, "StateChanged({}, {:?} -> {:?})", s.id(), from, to),
            Self::DroppedPacket(s, reason) => f.debug_tuple("DroppedPacket").field(&s.id()).field(reason).finish(),
            Self::AnsweredPing(s) => f.debug_tuple("AnsweredPing").field(&s.id()).finish(),
            Self::LoadedSecrets(s, bits) => write!(f, "LoadedSecrets({}, {:#04x})", s.id, bits),
            Self::StoredRetainedSecret(s) => f.debug_tuple("StoredRetainedSecret").field(&s.id).finish(),
            Self::DeferredRetainedSecret(s) => f.debug_tuple("DeferredRetainedSecret").field(&s.id).finish(),
            Self::CacheWriteFailed(_) => write!(f, "CacheWriteFailed"),
        }
    }
}
