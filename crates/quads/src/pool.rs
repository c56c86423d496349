use crate::{Error, QuadStore, StoreOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "pool.json";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    active: String,
    stores: BTreeMap<String, String>,
}

/// A directory of named stores with one active selection, persisted as
/// `pool.json`. A convenience layer over [`QuadStore`]; each named
/// store lives in its own subdirectory.
pub struct StorePool {
    dir: PathBuf,
    manifest: Manifest,
}

impl StorePool {
    /// Open the pool at `dir`, creating a manifest with a single
    /// "default" store if none exists.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_owned();
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(MANIFEST_FILE);
        let manifest = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let manifest: Manifest = serde_json::from_str(&raw)
                .map_err(|err| Error::Pool(format!("malformed pool.json: {err}")))?;
            if manifest.version != MANIFEST_VERSION {
                return Err(Error::Pool(format!(
                    "unsupported pool.json version {}",
                    manifest.version
                )));
            }
            if !manifest.stores.contains_key(&manifest.active) {
                return Err(Error::Pool(format!(
                    "active store {:?} is not in the pool",
                    manifest.active
                )));
            }
            manifest
        } else {
            let manifest = Manifest {
                version: MANIFEST_VERSION,
                active: "default".to_string(),
                stores: BTreeMap::from([("default".to_string(), "default".to_string())]),
            };
            write_manifest(&path, &manifest)?;
            manifest
        };

        Ok(Self { dir, manifest })
    }

    pub fn active(&self) -> &str {
        &self.manifest.active
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.manifest.stores.keys().map(String::as_str)
    }

    /// Add a new named store. The subdirectory is the name itself.
    pub fn create(&mut self, name: &str) -> Result<(), Error> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(Error::Pool(format!("invalid store name {name:?}")));
        }
        if self.manifest.stores.contains_key(name) {
            return Err(Error::Pool(format!("store {name:?} already exists")));
        }
        self.manifest
            .stores
            .insert(name.to_string(), name.to_string());
        write_manifest(&self.dir.join(MANIFEST_FILE), &self.manifest)
    }

    pub fn set_active(&mut self, name: &str) -> Result<(), Error> {
        if !self.manifest.stores.contains_key(name) {
            return Err(Error::Pool(format!("no store named {name:?}")));
        }
        self.manifest.active = name.to_string();
        write_manifest(&self.dir.join(MANIFEST_FILE), &self.manifest)
    }

    pub fn open_store(&self, name: &str, options: StoreOptions) -> Result<QuadStore, Error> {
        let sub = self
            .manifest
            .stores
            .get(name)
            .ok_or_else(|| Error::Pool(format!("no store named {name:?}")))?;
        QuadStore::open_with(self.dir.join(sub), options)
    }

    pub fn open_active(&self, options: StoreOptions) -> Result<QuadStore, Error> {
        self.open_store(&self.manifest.active, options)
    }
}

fn write_manifest(path: &Path, manifest: &Manifest) -> Result<(), Error> {
    let raw = serde_json::to_string_pretty(manifest)
        .map_err(|err| Error::Pool(format!("encoding pool.json: {err}")))?;
    std::fs::write(path, raw)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fresh_pool_has_default() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StorePool::open(dir.path()).unwrap();
        assert_eq!(pool.active(), "default");
        assert_eq!(pool.names().collect::<Vec<_>>(), vec!["default"]);
        assert!(dir.path().join("pool.json").exists());
    }

    #[test]
    fn test_create_and_switch() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = StorePool::open(dir.path()).unwrap();
        pool.create("scratch").unwrap();
        pool.set_active("scratch").unwrap();

        // Selection survives reopen.
        let pool = StorePool::open(dir.path()).unwrap();
        assert_eq!(pool.active(), "scratch");

        let store = pool.open_active(StoreOptions::default()).unwrap();
        assert!(store.dir().ends_with("scratch"));
    }

    #[test]
    fn test_rejects_unknown_and_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = StorePool::open(dir.path()).unwrap();
        assert!(pool.set_active("nope").is_err());
        assert!(pool.create("default").is_err());
        assert!(pool.create("../evil").is_err());
    }
}
