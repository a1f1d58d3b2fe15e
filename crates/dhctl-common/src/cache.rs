//! State cache: a keyed byte store used as a crash-resumable scratchpad
//!
//! Every operation owns one cache. Runners write their state files straight
//! to [`StateCache::get_path`]; the cache reads those files back on load, so
//! the disk-backed and in-memory implementations agree on what is "in cache".

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result};

const TEMP_PREFIX: &str = ".tmp-";

/// Keyed byte store
pub trait StateCache: Send + Sync {
    /// Whether the key has a value
    fn in_cache(&self, key: &str) -> Result<bool>;

    /// Value of the key, `None` when absent
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store the value; readers observe either the old or the new bytes
    fn save(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove the key (absent keys are not an error)
    fn delete(&self, key: &str) -> Result<()>;

    /// Visit every key once with its current value
    fn iterate(&self, visit: &mut dyn FnMut(&str, &[u8]) -> Result<()>) -> Result<()>;

    /// Remove every key
    fn clean(&self) -> Result<()>;

    /// Filesystem path backing the key
    fn get_path(&self, key: &str) -> PathBuf;

    /// Directory the cache lives in
    fn dir(&self) -> &Path;

    /// Copy of every key and value
    fn snapshot(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut out = BTreeMap::new();
        self.iterate(&mut |k, v| {
            out.insert(k.to_string(), v.to_vec());
            Ok(())
        })?;
        Ok(out)
    }
}

/// Typed helpers on top of any [`StateCache`]
pub trait StateCacheExt: StateCache {
    /// Store a value as JSON
    fn save_struct<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.save(key, &bytes)
    }

    /// Load a JSON value, `None` when absent
    fn load_struct<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.load(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<C: StateCache + ?Sized> StateCacheExt for C {}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path.display().to_string(), e)),
    }
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path.display().to_string(), e)),
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('/') || key.starts_with(TEMP_PREFIX) || key == ".." {
        return Err(Error::validation_for_field("cache key", format!("invalid key {key:?}")));
    }
    Ok(())
}

/// Disk-backed cache, persistent across runs
#[derive(Debug)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    /// Open (and create) a cache in the directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::io(dir.display().to_string(), e))?;
        debug!(dir = %dir.display(), "State cache opened");
        Ok(Self { dir })
    }

    /// Open the cache of a cluster identity under the root directory
    pub fn for_identity(root: &Path, identity: &str) -> Result<Self> {
        Self::open(root.join(identity))
    }
}

impl StateCache for DiskCache {
    fn in_cache(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.get_path(key).is_file())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        read_file(&self.get_path(key))
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let target = self.get_path(key);
        let ctx = || target.display().to_string();

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| Error::io(ctx(), e))?;
        tmp.write_all(value).map_err(|e| Error::io(ctx(), e))?;
        tmp.as_file().sync_all().map_err(|e| Error::io(ctx(), e))?;
        tmp.persist(&target).map_err(|e| Error::io(ctx(), e.error))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        remove_file(&self.get_path(key))
    }

    fn iterate(&self, visit: &mut dyn FnMut(&str, &[u8]) -> Result<()>) -> Result<()> {
        let ctx = || self.dir.display().to_string();
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| Error::io(ctx(), e))? {
            let entry = entry.map_err(|e| Error::io(ctx(), e))?;
            if !entry.file_type().map_err(|e| Error::io(ctx(), e))?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();

        for name in names {
            if let Some(value) = read_file(&self.get_path(&name))? {
                visit(&name, &value)?;
            }
        }
        Ok(())
    }

    fn clean(&self) -> Result<()> {
        let ctx = || self.dir.display().to_string();
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(ctx(), e)),
        }
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(ctx(), e))
    }

    fn get_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn dir(&self) -> &Path {
        &self.dir
    }
}

/// In-memory cache; keys written directly to their path are picked up too
#[derive(Debug)]
pub struct MemoryCache {
    dir: PathBuf,
    values: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryCache {
    /// Create an empty cache whose paths point into `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            values: Mutex::new(BTreeMap::new()),
        }
    }
}

impl StateCache for MemoryCache {
    fn in_cache(&self, key: &str) -> Result<bool> {
        Ok(self.values.lock().contains_key(key) || self.get_path(key).is_file())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.values.lock().get(key) {
            return Ok(Some(v.clone()));
        }
        read_file(&self.get_path(key))
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        remove_file(&self.get_path(key))
    }

    fn iterate(&self, visit: &mut dyn FnMut(&str, &[u8]) -> Result<()>) -> Result<()> {
        let values = self.values.lock().clone();
        for (k, v) in &values {
            visit(k, v)?;
        }
        Ok(())
    }

    fn clean(&self) -> Result<()> {
        let keys: Vec<String> = self.values.lock().keys().cloned().collect();
        self.values.lock().clear();
        for key in keys {
            remove_file(&self.get_path(&key))?;
        }
        Ok(())
    }

    fn get_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Cache that never keeps anything; used for read-only runs
#[derive(Debug)]
pub struct DummyCache {
    dir: PathBuf,
}

impl DummyCache {
    /// Create a dummy cache whose paths point into `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl StateCache for DummyCache {
    fn in_cache(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    fn load(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn save(&self, _key: &str, _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn iterate(&self, _visit: &mut dyn FnMut(&str, &[u8]) -> Result<()>) -> Result<()> {
        Ok(())
    }

    fn clean(&self) -> Result<()> {
        Ok(())
    }

    fn get_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Options applied when a cache is first used
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Caller-supplied state to seed the cache with
    pub initial_state: Option<BTreeMap<String, Vec<u8>>>,
    /// Wipe the cache before seeding
    pub reset_initial_state: bool,
}

/// Seed a cache from caller-supplied state.
///
/// With `reset_initial_state` the cache is wiped and repopulated. Without it
/// the initial state only populates a cache that is still empty, so a resumed
/// run keeps what it wrote before.
pub fn init_with_options(cache: &dyn StateCache, opts: InitOptions) -> Result<()> {
    let Some(initial) = opts.initial_state else {
        return Ok(());
    };

    if opts.reset_initial_state {
        cache.clean()?;
    } else if !cache.snapshot()?.is_empty() {
        debug!("State cache is not empty, initial state ignored");
        return Ok(());
    }

    for (key, value) in &initial {
        cache.save(key, value)?;
    }
    debug!(keys = initial.len(), "State cache seeded from initial state");
    Ok(())
}

/// What the operation talks to; determines which cache directory it uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheIdentitySource {
    /// SSH connection to the control plane
    Ssh {
        /// SSH user
        user: String,
        /// Hosts in connection order
        hosts: Vec<String>,
        /// Bastion host, if any
        bastion: Option<String>,
    },
    /// Running inside the cluster
    InCluster,
    /// Kubeconfig file plus context
    Kubeconfig {
        /// Kubeconfig path
        path: String,
        /// Context name (empty = current)
        context: String,
    },
}

/// Stable identity of a cluster connection (hex SHA-256)
pub fn cache_identity(source: &CacheIdentitySource) -> String {
    let mut hasher = Sha256::new();
    match source {
        CacheIdentitySource::Ssh { user, hosts, bastion } => {
            hasher.update(b"ssh\0");
            hasher.update(user.as_bytes());
            for host in hosts {
                hasher.update(b"\0");
                hasher.update(host.as_bytes());
            }
            if let Some(b) = bastion {
                hasher.update(b"\0bastion\0");
                hasher.update(b.as_bytes());
            }
        }
        CacheIdentitySource::InCluster => hasher.update(b"in-cluster"),
        CacheIdentitySource::Kubeconfig { path, context } => {
            hasher.update(b"kubeconfig\0");
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            hasher.update(context.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}
