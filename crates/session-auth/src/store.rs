//! Session token storage keyed by resource name
//!
//! Each resource's token lives in its own file (`<dir>/<name>.session`) so a
//! restart can resume sessions without a new handshake. All writes use atomic
//! temp-file + rename and 0600 permissions. A tokio Mutex serializes writers.
//!
//! A bounded in-memory cache fronts the files. It is insertion-ordered: when
//! full, the oldest entry is evicted from the front of a queue. Removal only
//! touches the map and leaves a stale queue slot behind, which eviction skips
//! and compaction drops once stale slots outnumber live ones. The files stay
//! on disk; an evicted entry is simply re-read on next load.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use common::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Extension used for persisted session files.
const SESSION_EXT: &str = "session";

/// Disambiguates temp files when the same name is written twice in one process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Bounded insertion-ordered token cache.
///
/// Each entry carries the generation it was inserted with; a queue slot whose
/// generation no longer matches the map is stale.
struct SessionCache {
    capacity: usize,
    entries: HashMap<String, (u64, Secret<String>)>,
    order: VecDeque<(u64, String)>,
    next_generation: u64,
}

impl SessionCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            next_generation: 0,
        }
    }

    fn get(&self, name: &str) -> Option<String> {
        self.entries.get(name).map(|(_, s)| s.expose().clone())
    }

    fn insert(&mut self, name: &str, token: &str) {
        if self.capacity == 0 {
            return;
        }
        if let Some((_, existing)) = self.entries.get_mut(name) {
            *existing = Secret::new(token.to_owned());
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some((generation, oldest)) = self.order.pop_front() else {
                break;
            };
            if self.is_live(generation, &oldest) {
                self.entries.remove(&oldest);
                debug!(session = oldest, "evicted session from cache");
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.order.push_back((generation, name.to_owned()));
        self.entries
            .insert(name.to_owned(), (generation, Secret::new(token.to_owned())));
        self.compact();
    }

    fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    fn is_live(&self, generation: u64, name: &str) -> bool {
        matches!(self.entries.get(name), Some((g, _)) if *g == generation)
    }

    /// Drop stale queue slots once they outnumber live entries.
    fn compact(&mut self) {
        if self.order.len() <= 2 * self.capacity {
            return;
        }
        let entries = &self.entries;
        self.order.retain(|(generation, name)| {
            matches!(entries.get(name), Some((g, _)) if g == generation)
        });
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// File-backed session token store with a bounded cache.
pub struct SessionStore {
    dir: PathBuf,
    cache: Mutex<SessionCache>,
}

impl SessionStore {
    /// Open (creating if needed) the session directory.
    ///
    /// `cache_capacity` bounds how many tokens are kept in memory; 0 disables
    /// caching and every load reads from disk.
    pub async fn open(dir: PathBuf, cache_capacity: usize) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Io(format!("creating session directory: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|e| Error::Io(format!("setting session directory permissions: {e}")))?;
        }

        info!(dir = %dir.display(), cache_capacity, "session store opened");
        Ok(Self {
            dir,
            cache: Mutex::new(SessionCache::new(cache_capacity)),
        })
    }

    /// Load the persisted token for `name`, if any.
    pub async fn load(&self, name: &str) -> Result<Option<String>> {
        let path = self.path_for(name)?;
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.get(name) {
            return Ok(Some(token));
        }

        let token = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents.trim().to_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(format!("reading session {name}: {e}"))),
        };
        if token.is_empty() {
            return Ok(None);
        }

        debug!(session = name, "loaded session from disk");
        cache.insert(name, &token);
        Ok(Some(token))
    }

    /// Persist `token` for `name`, replacing any previous token.
    pub async fn save(&self, name: &str, token: &str) -> Result<()> {
        let path = self.path_for(name)?;
        let mut cache = self.cache.lock().await;
        write_atomic(&path, token).await?;
        cache.insert(name, token);
        info!(session = name, "session saved");
        Ok(())
    }

    /// Delete the persisted token for `name`. Returns whether a file existed.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        let mut cache = self.cache.lock().await;
        cache.remove(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(session = name, "session removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(format!("removing session {name}: {e}"))),
        }
    }

    /// Number of tokens currently held in memory.
    pub async fn cached(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Map a resource name to its session file, rejecting anything that could
    /// escape the session directory.
    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::InvalidName(name.to_owned()));
        }
        Ok(self.dir.join(format!("{name}.{SESSION_EXT}")))
    }
}

/// Write a token file atomically with 0600 permissions.
async fn write_atomic(path: &Path, token: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("session path has no parent directory".into()))?;
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_path = dir.join(format!(".session.tmp.{}.{seq}", std::process::id()));

    tokio::fs::write(&tmp_path, token.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting session file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp session file: {e}")))?;

    debug!(path = %path.display(), "persisted session");
    Ok(())
}
