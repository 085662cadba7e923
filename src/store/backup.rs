//! Timestamped file backups with rotation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

/// Writes backup copies of the database file into a sibling `backups/` directory.
#[derive(Clone, Debug)]
pub struct BackupRotation {
    dir: PathBuf,
    prefix: String,
    keep: usize,
}

impl BackupRotation {
    /// Rotation for `db_path`, keeping the `keep` newest copies.
    #[must_use]
    pub fn for_database(db_path: &Path, keep: usize) -> Self {
        let dir = db_path
            .parent()
            .map_or_else(|| PathBuf::from("backups"), |parent| parent.join("backups"));
        let stem = db_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("store");
        Self {
            dir,
            prefix: format!("{stem}_backup_"),
            keep,
        }
    }

    /// Directory holding the backups.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `source` into a new timestamped file, then prune old copies.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the copy fails.
    /// Pruning failures are not reported.
    pub fn create(&self, source: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        // Millisecond suffix keeps names unique and lexicographically ordered.
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let target = self.dir.join(format!("{}{stamp}.db", self.prefix));
        fs::copy(source, &target)?;
        let _ = self.prune();
        Ok(target)
    }

    /// Existing backups, newest first.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    pub fn list(&self) -> io::Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut backups: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&self.prefix) && n.ends_with(".db"))
            })
            .collect();
        backups.sort_unstable_by(|a, b| b.cmp(a));
        Ok(backups)
    }

    /// Remove everything but the `keep` newest backups. Returns how many were removed.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    pub fn prune(&self) -> io::Result<usize> {
        let mut removed = 0;
        for old in self.list()?.into_iter().skip(self.keep) {
            if fs::remove_file(&old).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_only_newest() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chat.db");
        fs::write(&db, b"payload").unwrap();

        let rotation = BackupRotation::for_database(&db, 5);
        for _ in 0..8 {
            rotation.create(&db).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(3));
        }

        let backups = rotation.list().unwrap();
        assert_eq!(backups.len(), 5);
        assert!(backups.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(fs::read(&backups[0]).unwrap(), b"payload");
    }

    #[test]
    fn test_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chat.db");
        fs::write(&db, b"x").unwrap();

        let rotation = BackupRotation::for_database(&db, 1);
        fs::create_dir_all(rotation.dir()).unwrap();
        fs::write(rotation.dir().join("notes.txt"), b"keep me").unwrap();
        rotation.create(&db).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(3));
        rotation.create(&db).unwrap();

        assert_eq!(rotation.list().unwrap().len(), 1);
        assert!(rotation.dir().join("notes.txt").exists());
    }
}
