use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use zeroize::Zeroize;

use crate::kdf::SecretBuf;
use crate::proto::*;
use crate::result::Error;

/// A retained or trusted MiTM secret together with its lifetime.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct CachedSecret {
    pub value: SecretBuf,
    /// Wall clock time of the last update, in seconds since the UNIX epoch.
    pub last_used: u32,
    /// Lifetime in seconds, `CACHE_TTL_FOREVER` for no expiration.
    pub ttl: u32,
}

impl CachedSecret {
    pub fn is_expired(&self, now: u32) -> bool {
        self.ttl != CACHE_TTL_FOREVER && (self.last_used as u64 + self.ttl as u64) < now as u64
    }
}

/// Summary of one cache record handed to `SecretCache::foreach` visitors.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// The two ZIDs of the pair, in canonical order.
    pub id: [u8; 2 * ZID_SIZE],
    pub secret: CachedSecret,
    pub verified: bool,
    pub secure_since: u32,
}

/// Persistent store of the secrets shared with known peers, keyed by an unordered ZID pair.
///
/// Retained secrets (`put`) keep the current and the previous value. Trusted MiTM secrets
/// (`put_mitm`) keep a single value. Implementations must serialize every operation.
pub trait SecretCache: Send + Sync {
    fn get(&self, a: &Zid, b: &Zid, previous: bool) -> Option<CachedSecret>;
    /// Rotate the current secret of the pair to previous and store `secret` as current.
    fn put(&self, a: &Zid, b: &Zid, secret: &CachedSecret) -> Result<(), Error>;
    fn get_mitm(&self, a: &Zid, b: &Zid) -> Option<CachedSecret>;
    fn put_mitm(&self, a: &Zid, b: &Zid, secret: &CachedSecret) -> Result<(), Error>;
    fn get_verified(&self, a: &Zid, b: &Zid) -> Option<bool>;
    fn set_verified(&self, a: &Zid, b: &Zid, verified: bool) -> Result<(), Error>;
    fn get_presh_counter(&self, a: &Zid, b: &Zid) -> Option<u32>;
    fn set_presh_counter(&self, a: &Zid, b: &Zid, counter: u32) -> Result<(), Error>;
    /// Time at which the pair first went secure, if known.
    fn get_secure_since(&self, a: &Zid, b: &Zid) -> Option<u32>;
    /// Visit every record of one kind. Records for which `visitor` returns false are deleted.
    fn foreach(&self, mitm: bool, visitor: &mut dyn FnMut(&CacheEntry) -> bool);
    /// Flush to the persistent medium.
    fn store(&self) -> Result<(), Error>;
}

/// Canonical record id: the numerically smaller ZID first.
pub fn cache_id(a: &Zid, b: &Zid) -> [u8; 2 * ZID_SIZE] {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut id = [0u8; 2 * ZID_SIZE];
    id[..ZID_SIZE].copy_from_slice(first);
    id[ZID_SIZE..].copy_from_slice(second);
    id
}

/*
File layout, all integers big-endian:
    [0..16]  version tag
    [16..20] number of MiTM records, followed by the MiTM records
    then     number of retained secret records, followed by the retained secret records

MiTM record:
    [0..24]    id
    [24..88]   secret, zero padded
    [88..92]   secret length
    [92..96]   last used
    [96..100]  ttl

Retained secret record:
    [0..24]    id
    [24..88]   current secret, zero padded
    [88..92]   current secret length
    [92..156]  previous secret, zero padded
    [156..160] previous secret length
    [160]      verified flag, followed by 3 bytes of padding
    [164..168] last used
    [168..172] ttl
    [172..176] secure since
    [176..180] preshared counter
*/
const CACHE_FILE_VERSION: &[u8; 16] = b"zrtp cache v1.10";
const CACHE_HEADER_SIZE: usize = CACHE_FILE_VERSION.len();
const CACHE_COUNT_SIZE: usize = 4;
const MITM_RECORD_SIZE: usize = 2 * ZID_SIZE + SECRET_BUFFER_SIZE + 12;
const RECORD_SIZE: usize = 2 * ZID_SIZE + 2 * (SECRET_BUFFER_SIZE + 4) + 20;

#[derive(Default)]
struct MitmRecord {
    id: [u8; 2 * ZID_SIZE],
    secret: CachedSecret,
}

#[derive(Default)]
struct Record {
    id: [u8; 2 * ZID_SIZE],
    curr: CachedSecret,
    prev: SecretBuf,
    verified: bool,
    secure_since: u32,
    presh_counter: u32,
    /// Position of this record in the file, if it was ever written.
    file_index: Option<usize>,
    dirty: bool,
}

fn put_secret(out: &mut Vec<u8>, s: &SecretBuf) {
    let mut padded = [0u8; SECRET_BUFFER_SIZE];
    padded[..s.len()].copy_from_slice(s.as_bytes());
    out.extend_from_slice(&padded);
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    padded.zeroize();
}

fn get_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(b[at..at + 4].try_into().unwrap())
}

fn get_secret(b: &[u8], at: usize) -> Option<SecretBuf> {
    let len = get_u32(b, at + SECRET_BUFFER_SIZE) as usize;
    (len <= SECRET_BUFFER_SIZE).then(|| SecretBuf::from_slice(&b[at..at + len]))
}

impl MitmRecord {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id);
        put_secret(out, &self.secret.value);
        out.extend_from_slice(&self.secret.last_used.to_be_bytes());
        out.extend_from_slice(&self.secret.ttl.to_be_bytes());
    }
    fn decode(b: &[u8]) -> Option<Self> {
        let id = b[..2 * ZID_SIZE].try_into().unwrap();
        let value = get_secret(b, 2 * ZID_SIZE)?;
        Some(Self {
            id,
            secret: CachedSecret { value, last_used: get_u32(b, 92), ttl: get_u32(b, 96) },
        })
    }
}

impl Record {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id);
        put_secret(out, &self.curr.value);
        put_secret(out, &self.prev);
        out.extend_from_slice(&[self.verified as u8, 0, 0, 0]);
        out.extend_from_slice(&self.curr.last_used.to_be_bytes());
        out.extend_from_slice(&self.curr.ttl.to_be_bytes());
        out.extend_from_slice(&self.secure_since.to_be_bytes());
        out.extend_from_slice(&self.presh_counter.to_be_bytes());
    }
    fn decode(b: &[u8], file_index: usize) -> Option<Self> {
        let id = b[..2 * ZID_SIZE].try_into().unwrap();
        let value = get_secret(b, 2 * ZID_SIZE)?;
        let prev = get_secret(b, 2 * ZID_SIZE + SECRET_BUFFER_SIZE + 4)?;
        Some(Self {
            id,
            curr: CachedSecret { value, last_used: get_u32(b, 164), ttl: get_u32(b, 168) },
            prev,
            verified: b[160] != 0,
            secure_since: get_u32(b, 172),
            presh_counter: get_u32(b, 176),
            file_index: Some(file_index),
            dirty: false,
        })
    }
}

#[derive(Default)]
struct CacheState {
    mitm: Vec<MitmRecord>,
    regular: Vec<Record>,
    /// Number of MiTM records currently in the file. The regular section starts after them.
    file_mitm_count: Option<usize>,
    mitm_dirty: bool,
    needs_rewriting: bool,
}

impl CacheState {
    fn find(&self, id: &[u8; 2 * ZID_SIZE]) -> Option<usize> {
        self.regular.iter().position(|r| &r.id == id)
    }
    fn find_mut(&mut self, a: &Zid, b: &Zid) -> Option<&mut Record> {
        let id = cache_id(a, b);
        self.regular.iter_mut().find(|r| r.id == id)
    }
    fn find_or_create(&mut self, a: &Zid, b: &Zid) -> &mut Record {
        let id = cache_id(a, b);
        let idx = match self.find(&id) {
            Some(i) => i,
            None => {
                self.regular.push(Record { id, dirty: true, ..Default::default() });
                self.regular.len() - 1
            }
        };
        &mut self.regular[idx]
    }

    fn parse(data: &[u8]) -> Option<Self> {
        if data.get(..CACHE_HEADER_SIZE)? != CACHE_FILE_VERSION {
            return None;
        }
        let mut at = CACHE_HEADER_SIZE;
        let mitm_count = get_u32(data.get(at..at + CACHE_COUNT_SIZE)?, 0) as usize;
        at += CACHE_COUNT_SIZE;
        let mut s = Self::default();
        for _ in 0..mitm_count {
            s.mitm.push(MitmRecord::decode(data.get(at..at + MITM_RECORD_SIZE)?)?);
            at += MITM_RECORD_SIZE;
        }
        let count = get_u32(data.get(at..at + CACHE_COUNT_SIZE)?, 0) as usize;
        at += CACHE_COUNT_SIZE;
        for i in 0..count {
            s.regular.push(Record::decode(data.get(at..at + RECORD_SIZE)?, i)?);
            at += RECORD_SIZE;
        }
        s.file_mitm_count = Some(mitm_count);
        Some(s)
    }

    fn regular_offset(mitm_count: usize) -> u64 {
        (CACHE_HEADER_SIZE + CACHE_COUNT_SIZE + mitm_count * MITM_RECORD_SIZE) as u64
    }

    fn write_all(&mut self, path: &Path) -> io::Result<()> {
        let mut out = Vec::with_capacity(
            CACHE_HEADER_SIZE + 2 * CACHE_COUNT_SIZE + self.mitm.len() * MITM_RECORD_SIZE + self.regular.len() * RECORD_SIZE,
        );
        out.extend_from_slice(CACHE_FILE_VERSION);
        out.extend_from_slice(&(self.mitm.len() as u32).to_be_bytes());
        for m in self.mitm.iter() {
            m.encode(&mut out);
        }
        out.extend_from_slice(&(self.regular.len() as u32).to_be_bytes());
        for (i, r) in self.regular.iter_mut().enumerate() {
            r.encode(&mut out);
            r.file_index = Some(i);
            r.dirty = false;
        }
        let result = File::create(path).and_then(|mut f| f.write_all(&out));
        out.zeroize();
        result?;
        self.file_mitm_count = Some(self.mitm.len());
        self.mitm_dirty = false;
        self.needs_rewriting = false;
        Ok(())
    }

    /// Rewrite dirty records in place and append the new ones.
    fn write_dirty(&mut self, path: &Path, mitm_count: usize) -> io::Result<()> {
        let mut f = OpenOptions::new().read(true).write(true).open(path)?;
        let base = Self::regular_offset(mitm_count);
        let mut file_count = self.regular.iter().filter(|r| r.file_index.is_some()).count();
        let mut buf = Vec::with_capacity(RECORD_SIZE);
        for r in self.regular.iter_mut().filter(|r| r.dirty) {
            let idx = match r.file_index {
                Some(i) => i,
                None => {
                    file_count += 1;
                    file_count - 1
                }
            };
            buf.clear();
            r.encode(&mut buf);
            f.seek(SeekFrom::Start(base + CACHE_COUNT_SIZE as u64 + (idx * RECORD_SIZE) as u64))?;
            f.write_all(&buf)?;
            r.file_index = Some(idx);
            r.dirty = false;
        }
        buf.zeroize();
        f.seek(SeekFrom::Start(base))?;
        f.write_all(&(file_count as u32).to_be_bytes())?;
        f.flush()
    }
}

/// The default `SecretCache`: an in-memory table optionally backed by a file.
///
/// On `store` only the records modified since the last flush are written back, unless a
/// record was deleted, the set of MiTM secrets changed, or the file does not exist yet, in
/// which case the whole file is rewritten.
pub struct FileCache {
    path: Option<PathBuf>,
    auto_store: bool,
    state: Mutex<CacheState>,
}

impl FileCache {
    /// Open or create the cache file at `path`. A file with a different version or a
    /// truncated file is ignored and replaced on the next store.
    pub fn open<P: AsRef<Path>>(path: P, auto_store: bool) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let state = match File::open(&path) {
            Ok(mut f) => {
                let mut data = Vec::new();
                f.read_to_end(&mut data)?;
                let parsed = CacheState::parse(&data);
                data.zeroize();
                parsed.unwrap_or(CacheState { needs_rewriting: true, ..Default::default() })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => CacheState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path: Some(path), auto_store, state: Mutex::new(state) })
    }

    /// A cache that is never persisted.
    pub fn in_memory() -> Self {
        Self { path: None, auto_store: false, state: Mutex::new(CacheState::default()) }
    }

    fn store_locked(&self, state: &mut CacheState) -> Result<(), Error> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        match state.file_mitm_count {
            Some(n) if !state.needs_rewriting && !state.mitm_dirty && path.exists() => {
                state.write_dirty(path, n)?
            }
            _ => state.write_all(path)?,
        }
        Ok(())
    }

    fn auto_store(&self, state: &mut CacheState) -> Result<(), Error> {
        if self.auto_store {
            self.store_locked(state)
        } else {
            Ok(())
        }
    }
}

impl SecretCache for FileCache {
    fn get(&self, a: &Zid, b: &Zid, previous: bool) -> Option<CachedSecret> {
        let mut state = self.state.lock().unwrap();
        let r = state.find_mut(a, b)?;
        if previous {
            (!r.prev.is_empty()).then(|| CachedSecret { value: r.prev.clone(), ..r.curr.clone() })
        } else {
            (!r.curr.value.is_empty()).then(|| r.curr.clone())
        }
    }

    fn put(&self, a: &Zid, b: &Zid, secret: &CachedSecret) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let r = state.find_or_create(a, b);
        if !r.curr.value.is_empty() {
            r.prev = r.curr.value.clone();
        }
        if r.secure_since == 0 {
            r.secure_since = secret.last_used;
        }
        r.curr = secret.clone();
        r.dirty = true;
        self.auto_store(&mut state)
    }

    fn get_mitm(&self, a: &Zid, b: &Zid) -> Option<CachedSecret> {
        let id = cache_id(a, b);
        let state = self.state.lock().unwrap();
        state.mitm.iter().find(|m| m.id == id).map(|m| m.secret.clone())
    }

    fn put_mitm(&self, a: &Zid, b: &Zid, secret: &CachedSecret) -> Result<(), Error> {
        let id = cache_id(a, b);
        let mut state = self.state.lock().unwrap();
        match state.mitm.iter_mut().find(|m| m.id == id) {
            Some(m) => m.secret = secret.clone(),
            None => state.mitm.push(MitmRecord { id, secret: secret.clone() }),
        }
        state.mitm_dirty = true;
        self.auto_store(&mut state)
    }

    fn get_verified(&self, a: &Zid, b: &Zid) -> Option<bool> {
        self.state.lock().unwrap().find_mut(a, b).map(|r| r.verified)
    }

    fn set_verified(&self, a: &Zid, b: &Zid, verified: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match state.find_mut(a, b) {
            Some(r) => {
                r.verified = verified;
                r.dirty = true;
            }
            None => return Err(Error::BadParameter),
        }
        self.auto_store(&mut state)
    }

    fn get_presh_counter(&self, a: &Zid, b: &Zid) -> Option<u32> {
        self.state.lock().unwrap().find_mut(a, b).map(|r| r.presh_counter)
    }

    fn set_presh_counter(&self, a: &Zid, b: &Zid, counter: u32) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match state.find_mut(a, b) {
            Some(r) => {
                r.presh_counter = counter;
                r.dirty = true;
            }
            None => return Err(Error::BadParameter),
        }
        self.auto_store(&mut state)
    }

    fn get_secure_since(&self, a: &Zid, b: &Zid) -> Option<u32> {
        self.state.lock().unwrap().find_mut(a, b).map(|r| r.secure_since)
    }

    fn foreach(&self, mitm: bool, visitor: &mut dyn FnMut(&CacheEntry) -> bool) {
        let mut state = self.state.lock().unwrap();
        let before = (state.mitm.len(), state.regular.len());
        if mitm {
            state.mitm.retain(|m| {
                visitor(&CacheEntry { id: m.id, secret: m.secret.clone(), verified: false, secure_since: 0 })
            });
        } else {
            state.regular.retain(|r| {
                visitor(&CacheEntry {
                    id: r.id,
                    secret: r.curr.clone(),
                    verified: r.verified,
                    secure_since: r.secure_since,
                })
            });
        }
        if before != (state.mitm.len(), state.regular.len()) {
            // Positions shifted, the file can no longer be patched in place.
            for r in state.regular.iter_mut() {
                r.file_index = None;
            }
            state.needs_rewriting = true;
        }
    }

    fn store(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        self.store_locked(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Zid = [1u8; ZID_SIZE];
    const B: Zid = [2u8; ZID_SIZE];
    const C: Zid = [3u8; ZID_SIZE];

    fn secret(byte: u8) -> CachedSecret {
        CachedSecret { value: SecretBuf::from_slice(&[byte; 32]), last_used: 1000, ttl: CACHE_TTL_FOREVER }
    }

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("zrtp_cache_test_{}_{}.dat", name, std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn round_trip_is_order_independent() {
        let path = temp_path("round_trip");
        let cache = FileCache::open(&path, false).unwrap();
        cache.put(&B, &A, &secret(0x11)).unwrap();
        cache.put_mitm(&A, &C, &secret(0x22)).unwrap();
        cache.set_verified(&A, &B, true).unwrap();
        cache.store().unwrap();
        drop(cache);

        let cache = FileCache::open(&path, false).unwrap();
        assert_eq!(cache.get(&A, &B, false), Some(secret(0x11)));
        assert_eq!(cache.get(&B, &A, false), Some(secret(0x11)));
        assert_eq!(cache.get_mitm(&C, &A), Some(secret(0x22)));
        assert_eq!(cache.get_verified(&B, &A), Some(true));
        assert_eq!(cache.get(&A, &C, false), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn put_rotates_current_to_previous() {
        let cache = FileCache::in_memory();
        cache.put(&A, &B, &secret(1)).unwrap();
        // A fresh record has no previous secret.
        assert_eq!(cache.get(&A, &B, true), None);
        cache.put(&A, &B, &secret(2)).unwrap();
        assert_eq!(cache.get(&A, &B, true).unwrap().value, secret(1).value);
        assert_eq!(cache.get(&A, &B, false), Some(secret(2)));

        cache.put_mitm(&A, &B, &secret(3)).unwrap();
        cache.put_mitm(&A, &B, &secret(4)).unwrap();
        assert_eq!(cache.get_mitm(&A, &B), Some(secret(4)));
    }

    #[test]
    fn storing_unmodified_cache_is_idempotent() {
        let path = temp_path("idempotent");
        let cache = FileCache::open(&path, true).unwrap();
        cache.put(&A, &B, &secret(5)).unwrap();
        cache.put(&A, &C, &secret(6)).unwrap();
        cache.set_presh_counter(&A, &C, 3).unwrap();
        let before = std::fs::read(&path).unwrap();
        cache.store().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);

        let reopened = FileCache::open(&path, false).unwrap();
        reopened.store().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(reopened.get_presh_counter(&C, &A), Some(3));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn selective_flush_patches_records_in_place() {
        let path = temp_path("patch");
        let cache = FileCache::open(&path, false).unwrap();
        cache.put(&A, &B, &secret(7)).unwrap();
        cache.put(&A, &C, &secret(8)).unwrap();
        cache.store().unwrap();
        cache.put(&A, &C, &secret(9)).unwrap();
        cache.put(&B, &C, &secret(10)).unwrap();
        cache.store().unwrap();

        let reopened = FileCache::open(&path, false).unwrap();
        assert_eq!(reopened.get(&A, &B, false), Some(secret(7)));
        assert_eq!(reopened.get(&C, &A, false), Some(secret(9)));
        assert_eq!(reopened.get(&C, &A, true).unwrap().value, secret(8).value);
        assert_eq!(reopened.get(&B, &C, false), Some(secret(10)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn deletion_forces_full_rewrite() {
        let path = temp_path("delete");
        let cache = FileCache::open(&path, false).unwrap();
        cache.put(&A, &B, &secret(1)).unwrap();
        cache.put(&A, &C, &secret(2)).unwrap();
        cache.store().unwrap();
        cache.foreach(false, &mut |e| e.id != cache_id(&A, &B));
        cache.put(&A, &C, &secret(3)).unwrap();
        cache.store().unwrap();

        let reopened = FileCache::open(&path, false).unwrap();
        assert_eq!(reopened.get(&A, &B, false), None);
        assert_eq!(reopened.get(&A, &C, false), Some(secret(3)));
        let mut n = 0;
        reopened.foreach(false, &mut |_| {
            n += 1;
            true
        });
        assert_eq!(n, 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn foreign_file_is_treated_as_absent() {
        let path = temp_path("version");
        std::fs::write(&path, b"some other format entirely").unwrap();
        let cache = FileCache::open(&path, false).unwrap();
        assert_eq!(cache.get(&A, &B, false), None);
        cache.put(&A, &B, &secret(1)).unwrap();
        cache.store().unwrap();
        assert_eq!(FileCache::open(&path, false).unwrap().get(&A, &B, false), Some(secret(1)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn expiry() {
        let s = CachedSecret { value: SecretBuf::from_slice(&[1; 32]), last_used: 100, ttl: 50 };
        assert!(!s.is_expired(150));
        assert!(s.is_expired(151));
        assert!(!CachedSecret { ttl: CACHE_TTL_FOREVER, ..s }.is_expired(u32::MAX));
    }
}
