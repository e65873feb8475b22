use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::CacheError;
use crate::export::ExportArtifact;
use crate::request::ArtifactKey;

/// On-disk artifact tier
///
/// Layout: `<root>/<first two key chars>/<key>.<ext>`. Writes go to a
/// temporary file in the same directory and are renamed into place, so a
/// reader never sees a partial artifact. Stale files and, past the byte
/// budget, the oldest files are swept on open and after every write.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
    max_age: Option<Duration>,
    max_bytes: Option<u64>,
}

struct StoredFile {
    path: PathBuf,
    len: u64,
    modified: SystemTime,
}

impl DiskStore {
    pub fn open(
        root: impl AsRef<Path>,
        max_age: Option<Duration>,
        max_bytes: Option<u64>,
    ) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| CacheError::Io(e.to_string()))?;
        let store = Self {
            root,
            max_age,
            max_bytes,
        };
        store.sweep(None)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        let name = key.as_string();
        let shard: String = name.chars().take(2).collect();
        self.root
            .join(shard)
            .join(format!("{}.{}", name, key.format.extension()))
    }

    fn is_older_than_max_age(&self, modified: SystemTime) -> bool {
        let Some(max_age) = self.max_age else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .is_ok_and(|age| age > max_age)
    }

    fn is_stale(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .is_ok_and(|modified| self.is_older_than_max_age(modified))
    }

    pub fn load(&self, key: &ArtifactKey) -> Result<Option<ExportArtifact>, CacheError> {
        let path = self.path_for(key);
        if self.is_stale(&path) {
            remove(&path);
            return Ok(None);
        }
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(ExportArtifact::new(key.clone(), bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Io(e.to_string())),
        }
    }

    /// Persist an artifact; a fresh file for the same key is left alone
    pub fn store(&self, artifact: &ExportArtifact) -> Result<(), CacheError> {
        let path = self.path_for(&artifact.key);
        if path.exists() && !self.is_stale(&path) {
            return Ok(());
        }
        let dir = path
            .parent()
            .ok_or_else(|| CacheError::Io(format!("no parent directory for {}", path.display())))?;
        fs::create_dir_all(dir).map_err(|e| CacheError::Io(e.to_string()))?;

        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::Io(e.to_string()))?;
        file.write_all(artifact.bytes())
            .map_err(|e| CacheError::Io(e.to_string()))?;
        file.persist(&path).map_err(|e| CacheError::Io(e.to_string()))?;

        self.sweep(Some(&path))
    }

    /// Total bytes of the artifacts currently on disk
    pub fn usage(&self) -> Result<u64, CacheError> {
        Ok(self.files()?.iter().map(|f| f.len).sum())
    }

    fn files(&self) -> Result<Vec<StoredFile>, CacheError> {
        let mut files = Vec::new();
        let shards = fs::read_dir(&self.root).map_err(|e| CacheError::Io(e.to_string()))?;
        for shard in shards.flatten() {
            if !shard.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let Ok(entries) = fs::read_dir(shard.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                // Temporary files from in-flight writes start with a dot
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                if !meta.is_file() {
                    continue;
                }
                files.push(StoredFile {
                    path: entry.path(),
                    len: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
        Ok(files)
    }

    /// Drop stale files, then the oldest ones until the byte budget holds
    fn sweep(&self, keep: Option<&Path>) -> Result<(), CacheError> {
        if self.max_age.is_none() && self.max_bytes.is_none() {
            return Ok(());
        }

        let (stale, mut fresh): (Vec<_>, Vec<_>) = self
            .files()?
            .into_iter()
            .partition(|f| self.is_older_than_max_age(f.modified) && Some(f.path.as_path()) != keep);
        for file in &stale {
            remove(&file.path);
        }

        let Some(budget) = self.max_bytes else {
            return Ok(());
        };
        let mut total: u64 = fresh.iter().map(|f| f.len).sum();
        if total <= budget {
            return Ok(());
        }
        fresh.sort_by_key(|f| f.modified);
        for file in &fresh {
            if total <= budget {
                break;
            }
            if Some(file.path.as_path()) == keep {
                continue;
            }
            tracing::debug!(path = %file.path.display(), bytes = file.len, "evicting artifact from disk");
            remove(&file.path);
            total -= file.len;
        }
        Ok(())
    }
}

fn remove(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), %error, "failed to remove cached artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportFormat, ExportOptions};
    use crate::request::parse_request;

    fn artifact() -> ExportArtifact {
        sized(1, 7)
    }

    fn sized(radius: u32, len: usize) -> ExportArtifact {
        let request = format!(r#"{{"operations": [{{"id": "a", "op": "sphere", "radius": {}}}]}}"#, radius);
        let spec = parse_request(&request).unwrap();
        let key = ArtifactKey::new(spec.fingerprint(), ExportFormat::Obj, &ExportOptions::default());
        ExportArtifact::new(key, vec![b'o'; len])
    }

    fn age(path: &Path, seconds: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(seconds))
            .unwrap();
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), None, None).unwrap();
        let artifact = artifact();

        assert!(store.load(&artifact.key).unwrap().is_none());
        store.store(&artifact).unwrap();

        let path = store.path_for(&artifact.key);
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "obj");
        assert_eq!(
            path.parent().unwrap().file_name().unwrap().to_str().unwrap(),
            &artifact.key.fingerprint.as_str()[..2]
        );

        let loaded = store.load(&artifact.key).unwrap().unwrap();
        assert_eq!(loaded, artifact);
    }

    #[test]
    fn test_stale_files_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), Some(Duration::ZERO), None).unwrap();
        let artifact = artifact();
        store.store(&artifact).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert!(store.load(&artifact.key).unwrap().is_none());
        assert!(!store.path_for(&artifact.key).exists());
    }

    #[test]
    fn test_stale_file_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), Some(Duration::from_secs(60)), None).unwrap();
        let old = sized(1, 4);
        store.store(&old).unwrap();
        let path = store.path_for(&old.key);
        age(&path, 3600);

        let recomputed = ExportArtifact::new(old.key.clone(), vec![b'n'; 6]);
        store.store(&recomputed).unwrap();

        assert!(!store.is_stale(&path));
        let loaded = store.load(&old.key).unwrap().unwrap();
        assert_eq!(loaded.bytes(), &[b'n'; 6]);
    }

    #[test]
    fn test_fresh_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), Some(Duration::from_secs(60)), None).unwrap();
        let first = sized(1, 4);
        store.store(&first).unwrap();
        store.store(&ExportArtifact::new(first.key.clone(), vec![b'x'; 9])).unwrap();

        assert_eq!(store.load(&first.key).unwrap().unwrap(), first);
    }

    #[test]
    fn test_byte_budget_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), None, Some(25)).unwrap();
        let (a, b, c) = (sized(1, 10), sized(2, 10), sized(3, 10));
        store.store(&a).unwrap();
        age(&store.path_for(&a.key), 30);
        store.store(&b).unwrap();
        age(&store.path_for(&b.key), 20);
        store.store(&c).unwrap();

        assert!(!store.path_for(&a.key).exists());
        assert!(store.path_for(&b.key).exists());
        assert!(store.path_for(&c.key).exists());
        assert_eq!(store.usage().unwrap(), 20);
    }

    #[test]
    fn test_open_sweeps_unread_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (sized(1, 10), sized(2, 10));
        {
            let store = DiskStore::open(dir.path(), None, None).unwrap();
            store.store(&a).unwrap();
            store.store(&b).unwrap();
            age(&store.path_for(&a.key), 3600);
        }

        let store = DiskStore::open(dir.path(), Some(Duration::from_secs(60)), None).unwrap();
        assert!(!store.path_for(&a.key).exists());
        assert!(store.path_for(&b.key).exists());

        let small = DiskStore::open(dir.path(), None, Some(5)).unwrap();
        assert_eq!(small.usage().unwrap(), 0);
    }
}
