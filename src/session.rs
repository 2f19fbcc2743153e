//! Session token cache.
//!
//! A session records the token sequence a context has already evaluated,
//! keyed by a caller-supplied session id. On the next job with the same id
//! the decode loop skips re-evaluating the matching prompt prefix, which is
//! the dominant cost for chat-style workloads that resend the whole
//! conversation every turn.
//!
//! The cache is strictly an optimization: a missing or malformed file is a
//! cache miss, never an error.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::engine::TokenId;
use crate::error::Result;

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

const SESSION_MAGIC: u32 = 0x504f_4453; // "SDOP"
const SESSION_VERSION: u32 = 1;

/// Persistence for per-session token sequences.
pub trait SessionPersistence: Send + Sync {
    /// Load the cached token sequence for a session. `Ok(None)` is a cache
    /// miss; errors are reserved for real IO trouble worth surfacing.
    fn load_tokens(&self, session_id: &str) -> Result<Option<Vec<TokenId>>>;

    /// Persist the token sequence a context has evaluated.
    fn save_tokens(&self, session_id: &str, tokens: &[TokenId]) -> Result<()>;
}

/// File-per-session cache under a base directory.
///
/// Format: `magic, version, count` then `count` token ids, all
/// little-endian 32-bit.
#[derive(Debug, Clone)]
pub struct FileSessionCache {
    dir: PathBuf,
}

impl FileSessionCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileSessionCache { dir: dir.into() }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        // Session ids come from callers; flatten anything that could
        // escape the cache directory.
        let safe: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.session"))
    }

    fn read_file(path: &Path) -> io::Result<Option<Vec<TokenId>>> {
        let mut reader = BufReader::new(File::open(path)?);

        let magic = reader.read_u32::<LittleEndian>()?;
        let version = reader.read_u32::<LittleEndian>()?;
        if magic != SESSION_MAGIC || version != SESSION_VERSION {
            return Ok(None);
        }

        let count = reader.read_u32::<LittleEndian>()? as usize;
        let mut tokens = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            tokens.push(reader.read_i32::<LittleEndian>()?);
        }
        Ok(Some(tokens))
    }
}

impl SessionPersistence for FileSessionCache {
    fn load_tokens(&self, session_id: &str) -> Result<Option<Vec<TokenId>>> {
        let path = self.session_path(session_id);
        match Self::read_file(&path) {
            Ok(Some(tokens)) => {
                debug!(session_id, tokens = tokens.len(), "session cache hit");
                Ok(Some(tokens))
            }
            Ok(None) => {
                warn!(session_id, path = %path.display(), "session file has wrong magic or version, ignoring");
                Ok(None)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                // Truncated or otherwise unreadable file: treat as a miss
                // rather than failing the job.
                warn!(session_id, %err, "session file unreadable, ignoring");
                Ok(None)
            }
        }
    }

    fn save_tokens(&self, session_id: &str, tokens: &[TokenId]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.session_path(session_id);
        let mut writer = BufWriter::new(File::create(&path)?);

        writer.write_u32::<LittleEndian>(SESSION_MAGIC)?;
        writer.write_u32::<LittleEndian>(SESSION_VERSION)?;
        writer.write_u32::<LittleEndian>(tokens.len() as u32)?;
        for &token in tokens {
            writer.write_i32::<LittleEndian>(token)?;
        }

        debug!(session_id, tokens = tokens.len(), "session saved");
        Ok(())
    }
}

/// Longest common prefix of the cached session and the new prompt.
pub(crate) fn matching_prefix(session_tokens: &[TokenId], prompt: &[TokenId]) -> usize {
    session_tokens
        .iter()
        .zip(prompt)
        .take_while(|(a, b)| a == b)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache(tag: &str) -> FileSessionCache {
        let dir = std::env::temp_dir().join(format!(
            "llamapod-session-{tag}-{}",
            std::process::id()
        ));
        FileSessionCache::new(dir)
    }

    #[test]
    fn save_then_load_round_trips() {
        let cache = temp_cache("roundtrip");
        let tokens = vec![1, 529, 29871, -1, 0, 42];
        cache.save_tokens("chat-1", &tokens).unwrap();
        assert_eq!(cache.load_tokens("chat-1").unwrap(), Some(tokens));
    }

    #[test]
    fn missing_session_is_a_miss() {
        let cache = temp_cache("missing");
        assert!(cache.load_tokens("never-saved").unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_a_miss() {
        let cache = temp_cache("corrupt");
        std::fs::create_dir_all(&cache.dir).unwrap();
        std::fs::write(cache.session_path("bad"), b"not a session file").unwrap();
        assert!(cache.load_tokens("bad").unwrap().is_none());
    }

    #[test]
    fn truncated_file_is_a_miss() {
        let cache = temp_cache("truncated");
        cache.save_tokens("short", &[1, 2, 3, 4, 5]).unwrap();
        let path = cache.session_path("short");
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 6]).unwrap();
        assert!(cache.load_tokens("short").unwrap().is_none());
    }

    #[test]
    fn hostile_session_ids_stay_in_the_cache_dir() {
        let cache = temp_cache("hostile");
        let path = cache.session_path("../../etc/passwd");
        assert!(path.starts_with(&cache.dir));
    }

    #[test]
    fn prefix_matching() {
        assert_eq!(matching_prefix(&[1, 2, 3], &[1, 2, 4]), 2);
        assert_eq!(matching_prefix(&[1, 2, 3], &[1, 2, 3]), 3);
        assert_eq!(matching_prefix(&[], &[1]), 0);
        assert_eq!(matching_prefix(&[1, 2, 3, 4], &[1, 2]), 2);
    }
}
