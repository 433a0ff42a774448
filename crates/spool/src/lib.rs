//! Durable on-disk store for queued messages.
//!
//! Each entry is a triplet of flat files named after the entry id:
//! `<id>.meta`, `<id>.header` and `<id>.body`. Header and body are
//! written (and optionally fsync'd) before the meta file is atomically
//! put in place, so the existence of a readable meta file implies a
//! complete entry. Recovery deletes whatever is left of a triplet that
//! is missing one of its parts.
//!
//! A store owns its directory exclusively; ownership is enforced with
//! an flock'd `lock` pid file.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

mod lock;

pub use lock::lock_pid_file;

pub const LOCK_FILE_NAME: &str = "lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entry {id} has no {part} file")]
    Missing { id: String, part: Part },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }
}

/// The three files that make up one stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    Meta,
    Header,
    Body,
}

impl Part {
    pub const ALL: [Part; 3] = [Part::Meta, Part::Header, Part::Body];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Meta => "meta",
            Self::Header => "header",
            Self::Body => "body",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "meta" => Some(Self::Meta),
            "header" => Some(Self::Header),
            "body" => Some(Self::Body),
            _ => None,
        }
    }
}

impl std::fmt::Display for Part {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.extension())
    }
}

/// An entry that survived the recovery scan, with its meta bytes.
#[derive(Debug)]
pub struct RecoveredEntry {
    pub id: String,
    pub meta: Vec<u8>,
}

#[derive(Debug)]
pub struct DiskStore {
    path: PathBuf,
    flush: bool,
    _lock_file: File,
}

impl DiskStore {
    /// Open (creating if needed) the store directory and take the
    /// exclusive lock. Fails if another process holds the directory.
    pub fn open(path: &Path, flush: bool) -> anyhow::Result<Self> {
        std::fs::create_dir_all(path)?;
        let _lock_file = lock_pid_file(path.join(LOCK_FILE_NAME))?;
        Ok(Self {
            path: path.to_path_buf(),
            flush,
            _lock_file,
        })
    }

    pub fn location(&self) -> &Path {
        &self.path
    }

    pub fn part_path(&self, id: &str, part: Part) -> PathBuf {
        self.path.join(format!("{id}.{}", part.extension()))
    }

    /// Write one part of an entry. The data lands in a temp file first
    /// and is renamed into place, so readers never observe a partial
    /// file; with `flush` enabled the data is fsync'd before the rename.
    pub async fn write_part(&self, id: &str, part: Part, data: Vec<u8>) -> Result<(), StoreError> {
        let path = self.part_path(id, part);
        let dir = self.path.clone();
        let flush = self.flush;
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut temp = NamedTempFile::new_in(&dir)
                .map_err(|err| StoreError::io(format!("creating temp file for {id}.{part}"), err))?;
            temp.write_all(&data)
                .map_err(|err| StoreError::io(format!("writing {id}.{part}"), err))?;
            if flush {
                temp.as_file_mut()
                    .sync_data()
                    .map_err(|err| StoreError::io(format!("syncing {id}.{part}"), err))?;
            }
            temp.persist(&path)
                .map_err(|err| StoreError::io(format!("renaming {id}.{part} into place"), err.error))?;
            Ok(())
        })
        .await
        .map_err(|err| StoreError::io("spawn_blocking".to_string(), std::io::Error::other(err)))?
    }

    pub async fn read_part(&self, id: &str, part: Part) -> Result<Vec<u8>, StoreError> {
        let path = self.part_path(id, part);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::Missing {
                id: id.to_string(),
                part,
            }),
            Err(err) => Err(StoreError::io(format!("reading {id}.{part}"), err)),
        }
    }

    /// Remove whatever parts of the entry exist. Missing files are not
    /// an error; the caller may be cleaning up an incomplete triplet.
    pub async fn remove_entry(&self, id: &str) -> Result<(), StoreError> {
        for part in Part::ALL {
            let path = self.part_path(id, part);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::io(format!("removing {id}.{part}"), err)),
            }
        }
        Ok(())
    }

    /// Scan the directory, delete the remains of incomplete triplets,
    /// and return the surviving entries with their meta bytes.
    pub async fn enumerate(&self) -> anyhow::Result<Vec<RecoveredEntry>> {
        let dir = self.path.clone();
        tokio::task::spawn_blocking(move || enumerate_dir(&dir)).await?
    }
}

fn enumerate_dir(dir: &Path) -> anyhow::Result<Vec<RecoveredEntry>> {
    use std::collections::BTreeMap;

    let mut seen: BTreeMap<String, Vec<Part>> = BTreeMap::new();
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        if !dirent.file_type()?.is_file() {
            anyhow::bail!(
                "unexpected directory {} in spool",
                dirent.path().display()
            );
        }
        let name = dirent.file_name();
        let Some(name) = name.to_str() else {
            tracing::warn!("ignoring non-utf8 file name {name:?} in spool");
            continue;
        };
        if name == LOCK_FILE_NAME {
            continue;
        }
        let Some((stem, ext)) = name.rsplit_once('.') else {
            tracing::warn!("ignoring stray file {name} in spool");
            continue;
        };
        match Part::from_extension(ext) {
            Some(part) => seen.entry(stem.to_string()).or_default().push(part),
            None => {
                // tempfile remains from an interrupted write
                tracing::warn!("removing stray file {name} from spool");
                std::fs::remove_file(dirent.path()).ok();
            }
        }
    }

    let mut entries = Vec::new();
    for (id, parts) in seen {
        let complete = Part::ALL.iter().all(|part| parts.contains(part));
        if !complete {
            tracing::warn!("removing incomplete spool entry {id} (found only {parts:?})");
            for part in parts {
                std::fs::remove_file(dir.join(format!("{id}.{}", part.extension()))).ok();
            }
            continue;
        }
        match std::fs::read(dir.join(format!("{id}.meta"))) {
            Ok(meta) => entries.push(RecoveredEntry { id, meta }),
            Err(err) => {
                tracing::warn!("removing unreadable spool entry {id}: {err}");
                for part in Part::ALL {
                    std::fs::remove_file(dir.join(format!("{id}.{}", part.extension()))).ok();
                }
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn write_read_remove() -> anyhow::Result<()> {
        let location = tempfile::tempdir()?;
        let store = DiskStore::open(location.path(), false)?;

        store
            .write_part("abc123", Part::Header, b"Subject: hi\r\n\r\n".to_vec())
            .await?;
        store
            .write_part("abc123", Part::Body, b"the body".to_vec())
            .await?;
        store
            .write_part("abc123", Part::Meta, b"{}".to_vec())
            .await?;

        k9::assert_equal!(
            store.read_part("abc123", Part::Body).await?,
            b"the body".to_vec()
        );

        store.remove_entry("abc123").await?;
        assert!(store
            .read_part("abc123", Part::Meta)
            .await
            .unwrap_err()
            .is_missing());
        // removing again is fine
        store.remove_entry("abc123").await?;
        Ok(())
    }

    #[tokio::test]
    async fn enumerate_cleans_incomplete_triplets() -> anyhow::Result<()> {
        let location = tempfile::tempdir()?;
        let store = DiskStore::open(location.path(), false)?;

        // complete entry
        for part in Part::ALL {
            store.write_part("keepme", part, b"x".to_vec()).await?;
        }
        // header+body but no meta
        store.write_part("nometa", Part::Header, b"x".to_vec()).await?;
        store.write_part("nometa", Part::Body, b"x".to_vec()).await?;
        // meta only
        store.write_part("metaonly", Part::Meta, b"{}".to_vec()).await?;

        let entries = store.enumerate().await?;
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        k9::assert_equal!(ids, vec!["keepme"]);

        // the stragglers are gone from disk
        let mut files: Vec<String> = std::fs::read_dir(location.path())?
            .map(|d| d.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name != LOCK_FILE_NAME)
            .collect();
        files.sort();
        k9::assert_equal!(files, vec!["keepme.body", "keepme.header", "keepme.meta"]);
        Ok(())
    }

    #[test]
    fn second_open_is_refused() {
        let location = tempfile::tempdir().unwrap();
        let _store = DiskStore::open(location.path(), false).unwrap();
        let err = DiskStore::open(location.path(), false).unwrap_err();
        assert!(format!("{err:#}").contains("unable to lock pid file"));
    }
}
