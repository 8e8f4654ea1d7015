use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use siphasher::sip128::{Hasher128, SipHasher13};

use super::{stripe, Blob, EntryMeta, EvictPolicy, Evicted, Put, Store};
use crate::cancel::Cancel;
use crate::error::StoreError;
use crate::hash::ChainHash;

/// The environment variable that overrides the default cache root.
pub const CACHE_DIR_VAR: &str = "GRAPHCHAIN_CACHE_DIR";

/// The cache root used when neither a path nor the variable is given.
pub const DEFAULT_CACHE_DIR: &str = "./__graphchain_cache__";

const MAGIC: &[u8; 4] = b"GCHN";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 48;
const EXTENSION: &str = "gc";
const FLAG_DEFLATE: u8 = 1;

/// Prefix of in-flight writes. Left-over files older than [`STALE`] belong
/// to writers that died and are swept by eviction.
const TEMP_PREFIX: &str = ".gc-tmp";
const STALE: Duration = Duration::from_secs(60 * 60);

/// Cancellation is checked between chunks of this size.
const CHUNK: usize = 1 << 20;

/// Configuration of a filesystem store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// The directory holding the entries.
    pub root: PathBuf,
    /// Whether new entries are deflate-compressed.
    pub compression: bool,
    /// The number of lock stripes for concurrent writers.
    pub stripes: usize,
}

impl FsConfig {
    /// The default configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), ..Self::default() }
    }

    /// Enable or disable compression of new entries.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }
}

impl Default for FsConfig {
    fn default() -> Self {
        let root = std::env::var_os(CACHE_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
        Self { root, compression: false, stripes: 64 }
    }
}

/// A store keeping one file per entry below a root directory.
///
/// Entries are spread over 256 subdirectories by the first byte of their
/// hash. Each file starts with a fixed-size header:
///
/// ```text
/// magic "GCHN" | version u8 | flags u8 | reserved [u8; 2]
/// payload length u64 | stored length u64 | checksum u128 | created u64
/// ```
///
/// followed by the stored bytes. Integers are little-endian. The checksum is
/// a SipHash-1-3 of the uncompressed payload and only detects damage. Equal
/// content is always decided by comparing the payloads themselves, so a
/// compressed and an uncompressed entry of the same payload are equal.
///
/// Files are written to a temporary file in the target directory and moved
/// into place atomically. Readers never observe a partial entry written by
/// this store; anything truncated or garbled is reported as
/// [`StoreError::Corrupt`]. Writers within the process serialize per hash
/// stripe. Across processes, the atomic move without replacement makes
/// concurrent writers of one hash race benignly: the loser compares its
/// content against the winner's.
pub struct FsStore {
    config: FsConfig,
    locks: Box<[Mutex<()>]>,
}

impl FsStore {
    /// Open a store at `root` with default settings, creating the directory.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_config(FsConfig::new(root))
    }

    /// Open a store at the default location.
    ///
    /// That is `$GRAPHCHAIN_CACHE_DIR` if set and `./__graphchain_cache__`
    /// otherwise.
    pub fn open_default() -> io::Result<Self> {
        Self::with_config(FsConfig::default())
    }

    /// Open a store with the given configuration, creating the directory.
    pub fn with_config(config: FsConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.root)?;
        let stripes = config.stripes.max(1);
        tracing::debug!(root = %config.root.display(), compression = config.compression, "opened cache store");
        Ok(Self { config, locks: (0..stripes).map(|_| Mutex::new(())).collect() })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// The path of the file holding an entry.
    pub fn path_of(&self, hash: &ChainHash) -> PathBuf {
        let hex = hash.to_hex();
        self.config.root.join(&hex[..2]).join(format!("{hex}.{EXTENSION}"))
    }

    /// List the metadata of all readable entries.
    ///
    /// Files whose header cannot be read are listed with their filesystem
    /// metadata, so that eviction gets rid of them as well.
    pub fn entries(&self) -> io::Result<Vec<EntryMeta>> {
        let mut entries = Vec::new();
        for dir in fs::read_dir(&self.config.root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(dir.path())? {
                let path = file?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                    continue;
                }
                let Some(hash) =
                    path.file_stem().and_then(|stem| stem.to_str()).and_then(ChainHash::from_hex)
                else {
                    continue;
                };
                match read_header(&path, &hash) {
                    Ok(Some(header)) => entries.push(EntryMeta {
                        hash,
                        created: header.created,
                        size: header.payload_len,
                    }),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(%hash, %err, "unreadable cache entry");
                        let meta = fs::metadata(&path)?;
                        entries.push(EntryMeta {
                            hash,
                            created: meta.modified().unwrap_or(UNIX_EPOCH),
                            size: meta.len(),
                        });
                    }
                }
            }
        }
        Ok(entries)
    }

    fn lock(&self, hash: &ChainHash) -> &Mutex<()> {
        &self.locks[stripe(hash, self.locks.len())]
    }

    /// Compare an existing entry's payload against a payload about to be
    /// written.
    fn compare(&self, hash: &ChainHash, blob: &[u8], cancel: &Cancel) -> Result<Put, StoreError> {
        match self.payload(hash, cancel, "put") {
            Ok(stored) if stored == blob => Ok(Put::Unchanged),
            Ok(_) => Err(StoreError::Collision { hash: *hash }),
            Err(StoreError::Miss { .. }) => Err(StoreError::Corrupt {
                hash: *hash,
                reason: "entry vanished while writing".into(),
            }),
            Err(err) => Err(err),
        }
    }

    /// Read, inflate and verify an entry's payload.
    fn payload(
        &self,
        hash: &ChainHash,
        cancel: &Cancel,
        op: &'static str,
    ) -> Result<Vec<u8>, StoreError> {
        let path = self.path_of(hash);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Miss { hash: *hash });
            }
            Err(err) => return Err(err.into()),
        };

        let mut bytes = Vec::with_capacity(file.metadata().map_or(0, |m| m.len() as usize));
        let mut buf = vec![0; CHUNK];
        loop {
            cancel.check(op)?;
            match file.read(&mut buf)? {
                0 => break,
                n => bytes.extend_from_slice(&buf[..n]),
            }
        }

        let header = Header::parse(&bytes, hash)?;
        let stored = &bytes[HEADER_LEN..];
        if stored.len() as u64 != header.stored_len {
            return Err(corrupt(hash, "truncated entry"));
        }

        let payload = if header.flags & FLAG_DEFLATE != 0 {
            inflate(stored, header.payload_len)
                .map_err(|err| corrupt(hash, format!("cannot inflate: {err}")))?
        } else {
            stored.to_vec()
        };

        if payload.len() as u64 != header.payload_len || checksum(&payload) != header.checksum {
            return Err(corrupt(hash, "checksum mismatch"));
        }

        Ok(payload)
    }

    /// Delete temporary files of writers that never finished.
    fn sweep(&self, now: SystemTime) -> io::Result<usize> {
        let mut swept = 0;
        for dir in fs::read_dir(&self.config.root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(dir.path())? {
                let file = file?;
                if !file.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }
                let modified = file.metadata()?.modified()?;
                if now.duration_since(modified).is_ok_and(|age| age >= STALE) {
                    match fs::remove_file(file.path()) {
                        Ok(()) => swept += 1,
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(swept)
    }
}

impl Store for FsStore {
    fn contains(&self, hash: &ChainHash, cancel: &Cancel) -> Result<bool, StoreError> {
        cancel.check("contains")?;
        Ok(read_header(&self.path_of(hash), hash)?.is_some())
    }

    fn get(&self, hash: &ChainHash, cancel: &Cancel) -> Result<Blob, StoreError> {
        cancel.check("get")?;
        Ok(Blob::from(self.payload(hash, cancel, "get")?))
    }

    fn put(&self, hash: &ChainHash, blob: &[u8], cancel: &Cancel) -> Result<Put, StoreError> {
        cancel.check("put")?;
        let _guard = self.lock(hash).lock();
        let path = self.path_of(hash);
        if path.exists() {
            return self.compare(hash, blob, cancel);
        }

        let (flags, stored) = if self.config.compression {
            (FLAG_DEFLATE, deflate(blob)?)
        } else {
            (0, blob.to_vec())
        };

        let header = Header {
            flags,
            payload_len: blob.len() as u64,
            stored_len: stored.len() as u64,
            checksum: checksum(blob),
            created: SystemTime::now(),
        };

        let dir = path.parent().unwrap_or(&self.config.root);
        fs::create_dir_all(dir)?;
        let mut file = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir)?;
        file.write_all(&header.encode())?;
        for chunk in stored.chunks(CHUNK) {
            // Dropping the temporary file deletes it.
            cancel.check("put")?;
            file.write_all(chunk)?;
        }
        file.as_file().sync_all()?;

        match file.persist_noclobber(&path) {
            Ok(_) => Ok(Put::Written),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
                // Another process won the race.
                self.compare(hash, blob, cancel)
            }
            Err(err) => Err(err.error.into()),
        }
    }

    fn remove(&self, hash: &ChainHash, cancel: &Cancel) -> Result<bool, StoreError> {
        cancel.check("remove")?;
        let _guard = self.lock(hash).lock();
        match fs::remove_file(self.path_of(hash)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn evict(&self, policy: &EvictPolicy) -> Result<Evicted, StoreError> {
        let now = SystemTime::now();
        let swept = self.sweep(now)?;
        let mut evicted = Evicted::default();
        for meta in policy.select(self.entries()?, now) {
            if self.remove(&meta.hash, &Cancel::never())? {
                evicted.entries += 1;
                evicted.bytes += meta.size;
            }
        }
        tracing::debug!(
            entries = evicted.entries,
            bytes = evicted.bytes,
            swept,
            "evicted cache entries"
        );
        Ok(evicted)
    }
}

/// The decoded fixed-size prefix of an entry file.
#[derive(Debug, Copy, Clone)]
struct Header {
    flags: u8,
    payload_len: u64,
    stored_len: u64,
    checksum: u128,
    created: SystemTime,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let created = self.created.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        let mut out = [0; HEADER_LEN];
        out[0..4].copy_from_slice(MAGIC);
        out[4] = VERSION;
        out[5] = self.flags;
        out[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        out[16..24].copy_from_slice(&self.stored_len.to_le_bytes());
        out[24..40].copy_from_slice(&self.checksum.to_le_bytes());
        out[40..48].copy_from_slice(&created.to_le_bytes());
        out
    }

    fn parse(bytes: &[u8], hash: &ChainHash) -> Result<Self, StoreError> {
        let Some(bytes) = bytes.get(..HEADER_LEN) else {
            return Err(corrupt(hash, "truncated header"));
        };
        if &bytes[0..4] != MAGIC {
            return Err(corrupt(hash, "bad magic"));
        }
        if bytes[4] != VERSION {
            return Err(corrupt(hash, format!("unsupported version {}", bytes[4])));
        }

        let u64_at = |i: usize| {
            let mut word = [0; 8];
            word.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(word)
        };
        let mut checksum = [0; 16];
        checksum.copy_from_slice(&bytes[24..40]);

        Ok(Self {
            flags: bytes[5],
            payload_len: u64_at(8),
            stored_len: u64_at(16),
            checksum: u128::from_le_bytes(checksum),
            created: UNIX_EPOCH + Duration::from_secs(u64_at(40)),
        })
    }
}

/// Read and validate an entry's header without reading its payload.
///
/// Returns `None` if there is no entry. A header that disagrees with the
/// file's length means a torn write and is reported as corrupt.
fn read_header(path: &Path, hash: &ChainHash) -> Result<Option<Header>, StoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut bytes = [0; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match file.read(&mut bytes[filled..])? {
            0 => break,
            n => filled += n,
        }
    }

    let header = Header::parse(&bytes[..filled], hash)?;
    let len = file.metadata()?.len();
    if len != HEADER_LEN as u64 + header.stored_len {
        return Err(corrupt(hash, "length does not match header"));
    }

    Ok(Some(header))
}

fn corrupt(hash: &ChainHash, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt { hash: *hash, reason: reason.into() }
}

/// A fast 128-bit checksum for detecting damaged or differing payloads.
fn checksum(bytes: &[u8]) -> u128 {
    let mut state = SipHasher13::new();
    state.write(bytes);
    state.finish128().as_u128()
}

#[cfg(feature = "compression")]
fn deflate(bytes: &[u8]) -> io::Result<Vec<u8>> {
    use flate2::Compression;
    use flate2::write::DeflateEncoder;

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Inflate at most one byte more than `expected`, enough to tell that a
/// payload is too long without decoding all of it.
#[cfg(feature = "compression")]
fn inflate(bytes: &[u8], expected: u64) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::DeflateDecoder::new(bytes)
        .take(expected.saturating_add(1))
        .read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(not(feature = "compression"))]
fn deflate(_: &[u8]) -> io::Result<Vec<u8>> {
    Err(io::Error::new(ErrorKind::Unsupported, "compression support is disabled"))
}

#[cfg(not(feature = "compression"))]
fn inflate(_: &[u8], _: u64) -> io::Result<Vec<u8>> {
    Err(io::Error::new(ErrorKind::Unsupported, "compression support is disabled"))
}
