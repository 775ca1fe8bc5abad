//! The metadata KV engine.
//!
//! An embedded ordered key/value store keyed by absolute path, valued by
//! the serialized record. Lexicographic key order doubles as directory
//! listing order, so dirent queries are plain prefix scans. Size updates
//! and creation go through the merge-operand protocol of [`super::merge`];
//! the engine serializes same-key merges internally, which is what makes
//! those updates lock-free for callers.

use std::path::Path;

use sled::transaction::ConflictableTransactionError;

use crate::daemon::merge::{self, MergeOperand};
use crate::error::{FsError, FsResult};
use crate::metadata::Metadata;

pub struct MetadataDb {
    db: sled::Db,
}

/// Merge operator registered with the engine: parse the single pending
/// operand and fold it into the base record. A malformed operand must not
/// eat the record, so it is logged and the base kept.
fn metadata_merge(key: &[u8], base: Option<&[u8]>, operand: &[u8]) -> Option<Vec<u8>> {
    let parsed = match MergeOperand::parse(operand) {
        Ok(op) => op,
        Err(err) => {
            log::error!(
                "dropping malformed merge operand for '{}': {}",
                String::from_utf8_lossy(key),
                err
            );
            return base.map(|v| v.to_vec());
        }
    };
    match merge::full_merge(base, &[parsed]) {
        Ok(merged) => merged.map(String::into_bytes),
        Err(err) => {
            log::error!(
                "merge failed for '{}': {}",
                String::from_utf8_lossy(key),
                err
            );
            base.map(|v| v.to_vec())
        }
    }
}

impl MetadataDb {
    /// Open (or create) the database under `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        let db = sled::Config::new()
            .path(path.as_ref())
            .mode(sled::Mode::HighThroughput)
            .open()?;
        db.set_merge_operator(metadata_merge);
        Ok(MetadataDb { db })
    }

    /// Fetch the serialized record stored for `key`.
    pub fn get(&self, key: &str) -> FsResult<String> {
        match self.db.get(key.as_bytes())? {
            Some(value) => Ok(String::from_utf8(value.to_vec())
                .map_err(|_| FsError::InvalidArgument("non-utf8 record".into()))?),
            None => Err(FsError::NotFound),
        }
    }

    /// Unconditional overwrite.
    pub fn put(&self, key: &str, value: &str) -> FsResult<()> {
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    /// Create-if-absent through the merge pipeline: an existing record is
    /// left untouched, so concurrent creates of one path cannot clobber
    /// each other's size updates.
    pub fn create(&self, key: &str, value: &str) -> FsResult<()> {
        let operand = MergeOperand::Create {
            metadata: value.to_string(),
        };
        self.db.merge(key.as_bytes(), operand.serialize().as_bytes())?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> FsResult<()> {
        match self.db.remove(key.as_bytes())? {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound),
        }
    }

    pub fn exists(&self, key: &str) -> FsResult<bool> {
        Ok(self.db.contains_key(key.as_bytes())?)
    }

    /// Atomic rename and overwrite: used when an update would change the
    /// primary key.
    pub fn update(&self, old_key: &str, new_key: &str, value: &str) -> FsResult<()> {
        if old_key == new_key {
            return self.put(new_key, value);
        }
        let old = old_key.as_bytes().to_vec();
        let new = new_key.as_bytes().to_vec();
        let val = value.as_bytes().to_vec();
        self.db
            .transaction(move |tx| {
                tx.remove(old.clone())?;
                tx.insert(new.clone(), val.clone())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|err| FsError::StorageFault {
                errno: libc::EIO,
                msg: format!("rename transaction failed: {:?}", err),
            })?;
        Ok(())
    }

    /// Merge an `IncreaseSize` operand and report the resulting logical
    /// size, or `None` when no record exists for the key.
    pub fn increase_size(&self, key: &str, size: u64, append: bool) -> FsResult<Option<u64>> {
        let operand = MergeOperand::IncreaseSize { size, append };
        let merged = self
            .db
            .merge(key.as_bytes(), operand.serialize().as_bytes())?;
        match merged {
            Some(value) => {
                let s = std::str::from_utf8(&value)
                    .map_err(|_| FsError::InvalidArgument("non-utf8 record".into()))?;
                Ok(Some(Metadata::deserialize(s)?.size()))
            }
            None => Ok(None),
        }
    }

    /// Merge a `DecreaseSize` operand.
    pub fn decrease_size(&self, key: &str, size: u64) -> FsResult<()> {
        let operand = MergeOperand::DecreaseSize { size };
        self.db.merge(key.as_bytes(), operand.serialize().as_bytes())?;
        Ok(())
    }

    /// Read-modify-write of selected record fields under the engine's
    /// single-key atomicity.
    pub fn patch(
        &self,
        key: &str,
        md: &Metadata,
        flags: &crate::rpc::MetadentryUpdateFlags,
    ) -> FsResult<()> {
        let result = self.db.update_and_fetch(key.as_bytes(), |old| {
            let old = old?;
            let mut base = match std::str::from_utf8(old)
                .ok()
                .and_then(|s| Metadata::deserialize(s).ok())
            {
                Some(base) => base,
                // keep an undecodable record instead of destroying it
                None => return Some(old.to_vec()),
            };
            if flags.mode {
                base.set_mode(md.mode());
            }
            if flags.size {
                base.set_size(md.size());
            }
            if flags.atime {
                base.set_atime(md.atime());
            }
            if flags.mtime {
                base.set_mtime(md.mtime());
            }
            if flags.ctime {
                base.set_ctime(md.ctime());
            }
            if flags.link_count {
                base.set_link_count(md.link_count());
            }
            if flags.blocks {
                base.set_blocks(md.blocks());
            }
            Some(base.serialize().into_bytes())
        })?;
        match result {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound),
        }
    }

    /// Immediate children of `dir`: a forward range scan over keys with
    /// prefix `dir + "/"` that contain no further slash. Returns
    /// `(name, is_directory)` pairs in lexicographic order.
    pub fn get_dirents(&self, dir: &str) -> FsResult<Vec<(String, bool)>> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };

        let mut entries = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key = std::str::from_utf8(&key)
                .map_err(|_| FsError::InvalidArgument("non-utf8 key".into()))?;
            let name = &key[prefix.len()..];
            if name.is_empty() || name.contains('/') {
                continue;
            }
            // only the mode prefix of the record is needed here
            let value = std::str::from_utf8(&value)
                .map_err(|_| FsError::InvalidArgument("non-utf8 record".into()))?;
            let mode = value
                .split('|')
                .next()
                .and_then(|m| m.parse::<u32>().ok())
                .ok_or_else(|| FsError::InvalidArgument("malformed record".into()))?;
            let is_dir = mode & libc::S_IFMT == libc::S_IFDIR;
            entries.push((name.to_string(), is_dir));
        }
        Ok(entries)
    }

    /// Flush dirty state to disk.
    pub fn flush(&self) -> FsResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> (tempfile::TempDir, MetadataDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(dir.path().join("db")).unwrap();
        (dir, db)
    }

    fn file_record(size: u64) -> String {
        let mut md = Metadata::new(libc::S_IFREG | 0o644);
        md.set_size(size);
        md.serialize()
    }

    #[test]
    fn get_put_remove() {
        let (_dir, db) = open_db();
        assert!(matches!(db.get("/a"), Err(FsError::NotFound)));
        db.put("/a", &file_record(1)).unwrap();
        assert_eq!(db.get("/a").unwrap(), file_record(1));
        assert!(db.exists("/a").unwrap());
        db.remove("/a").unwrap();
        assert!(!db.exists("/a").unwrap());
        assert!(matches!(db.remove("/a"), Err(FsError::NotFound)));
    }

    #[test]
    fn create_keeps_existing_record() {
        let (_dir, db) = open_db();
        db.create("/a", &file_record(7)).unwrap();
        assert_eq!(db.get("/a").unwrap(), file_record(7));
        // second create must not reset the record
        db.create("/a", &file_record(0)).unwrap();
        assert_eq!(db.get("/a").unwrap(), file_record(7));
    }

    #[test]
    fn size_merges() {
        let (_dir, db) = open_db();
        db.create("/a", &file_record(0)).unwrap();

        let size = db.increase_size("/a", 100, false).unwrap().unwrap();
        assert_eq!(size, 100);
        // smaller non-append increase keeps the larger size
        let size = db.increase_size("/a", 40, false).unwrap().unwrap();
        assert_eq!(size, 100);
        // appends accumulate
        let size = db.increase_size("/a", 10, true).unwrap().unwrap();
        assert_eq!(size, 110);

        db.decrease_size("/a", 2).unwrap();
        assert_eq!(Metadata::deserialize(&db.get("/a").unwrap()).unwrap().size(), 2);

        // size merge against a missing key creates nothing
        assert!(db.increase_size("/nope", 5, true).unwrap().is_none());
        assert!(!db.exists("/nope").unwrap());
    }

    #[test]
    fn rename_update() {
        let (_dir, db) = open_db();
        db.put("/old", &file_record(3)).unwrap();
        db.update("/old", "/new", &file_record(3)).unwrap();
        assert!(!db.exists("/old").unwrap());
        assert_eq!(db.get("/new").unwrap(), file_record(3));
    }

    #[test]
    fn patch_selected_fields() {
        let (_dir, db) = open_db();
        db.put("/a", &file_record(50)).unwrap();

        let mut md = Metadata::new(libc::S_IFREG | 0o600);
        md.set_size(999);
        let flags = crate::rpc::MetadentryUpdateFlags {
            mode: true,
            ..Default::default()
        };
        db.patch("/a", &md, &flags).unwrap();

        let got = Metadata::deserialize(&db.get("/a").unwrap()).unwrap();
        assert_eq!(got.mode(), libc::S_IFREG | 0o600);
        assert_eq!(got.size(), 50); // size flag was off

        assert!(matches!(
            db.patch("/missing", &md, &flags),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn dirents_are_immediate_children_in_order() {
        let (_dir, db) = open_db();
        let dir_record = Metadata::new(libc::S_IFDIR | 0o755).serialize();
        db.put("/", &dir_record).unwrap();
        db.put("/d", &dir_record).unwrap();
        db.put("/d/b", &file_record(0)).unwrap();
        db.put("/d/a", &file_record(0)).unwrap();
        db.put("/d/sub", &dir_record).unwrap();
        db.put("/d/sub/deep", &file_record(0)).unwrap();
        db.put("/other", &file_record(0)).unwrap();

        let entries = db.get_dirents("/d").unwrap();
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), false),
                ("b".to_string(), false),
                ("sub".to_string(), true),
            ]
        );

        let root = db.get_dirents("/").unwrap();
        assert_eq!(
            root,
            vec![("d".to_string(), true), ("other".to_string(), false)]
        );
    }
}
