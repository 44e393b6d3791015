//! Key-value snapshot store.
//!
//! One file per persistent entity, keyed by id. Each file is an
//! append-only sequence of varint-length-prefixed records, every record a
//! complete JSON property map. A save appends a fresh record instead of
//! rewriting the file, so a crash mid-save leaves the previous record
//! intact; load takes the last record that parses completely.
//!
//! The directory is tmpfs-mounted at daemon startup to keep restore
//! independent of host-disk health during boot.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use porto_common::varint::{decode_varint, encode_varint};
use porto_common::{PortoError, PortoResult};

/// One loaded node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvNode {
    /// Entity id, the file name.
    pub id: u32,
    /// Property map, the last complete record.
    pub data: BTreeMap<String, String>,
}

/// A flat directory of append-only nodes.
#[derive(Debug, Clone)]
pub struct KvStore {
    dir: PathBuf,
    record_limit: usize,
}

impl KvStore {
    /// Open a store over a directory, creating it when missing.
    pub fn open(dir: impl Into<PathBuf>, record_limit: usize) -> PortoResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, record_limit })
    }

    /// Mount a tmpfs over the store directory. Skipped when the directory
    /// already is a mount point (a restarted slave re-adopts it).
    pub fn mount_tmpfs(&self, size: u64) -> PortoResult<()> {
        if is_mount_point(&self.dir) {
            return Ok(());
        }
        crate::namespace::mount::mount_tmpfs(&self.dir, &format!("mode=0750,size={size}"))
    }

    /// The store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn node_path(&self, id: u32) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Append a complete record for a node.
    ///
    /// When the file would exceed the record limit it is compacted: the
    /// new record is written to a temp file and renamed into place.
    pub fn save(&self, id: u32, data: &BTreeMap<String, String>) -> PortoResult<()> {
        let record = encode_record(data)?;
        if record.len() > self.record_limit {
            return Err(PortoError::NoSpace {
                message: format!("key-value record for id {id} exceeds limit"),
            });
        }

        let path = self.node_path(id);
        let current = path.metadata().map(|m| m.len()).unwrap_or(0);

        if current as usize + record.len() > self.record_limit * 4 {
            let tmp = self.dir.join(format!("{id}.tmp"));
            std::fs::write(&tmp, &record)?;
            std::fs::rename(&tmp, &path)?;
            return Ok(());
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(&record)?;
        file.sync_data()?;
        Ok(())
    }

    /// Load the last complete record of a node.
    pub fn load(&self, id: u32) -> PortoResult<KvNode> {
        let buf = std::fs::read(self.node_path(id))?;
        let data = decode_last_record(&buf)?;
        Ok(KvNode { id, data })
    }

    /// Whether a node exists.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.node_path(id).exists()
    }

    /// Remove a node.
    pub fn remove(&self, id: u32) -> PortoResult<()> {
        match std::fs::remove_file(self.node_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every node, parents first (ascending id). Nodes that fail to
    /// parse are renamed aside with a `.bad` suffix and counted.
    pub fn load_all(&self) -> PortoResult<(Vec<KvNode>, u64)> {
        let mut nodes = Vec::new();
        let mut failed = 0;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            // Leftover temp files from interrupted compaction.
            if name.ends_with(".tmp") {
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            if name.ends_with(".bad") {
                continue;
            }

            let Ok(id) = name.parse::<u32>() else {
                tracing::warn!(node = %name, "unparsable key-value node name");
                failed += 1;
                let _ = std::fs::rename(entry.path(), self.dir.join(format!("{name}.bad")));
                continue;
            };

            match self.load(id) {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    tracing::warn!(id, error = %e, "dropping corrupt key-value node");
                    failed += 1;
                    let _ = std::fs::rename(entry.path(), self.dir.join(format!("{id}.bad")));
                }
            }
        }

        nodes.sort_by_key(|n| n.id);
        Ok((nodes, failed))
    }
}

fn encode_record(data: &BTreeMap<String, String>) -> PortoResult<Vec<u8>> {
    let body = serde_json::to_vec(data)?;
    let len = u32::try_from(body.len()).map_err(|_| PortoError::NoSpace {
        message: "key-value record too large".to_string(),
    })?;
    let mut record = Vec::with_capacity(body.len() + 5);
    encode_varint(len, &mut record);
    record.extend_from_slice(&body);
    Ok(record)
}

fn decode_last_record(mut buf: &[u8]) -> PortoResult<BTreeMap<String, String>> {
    let mut last = None;

    while !buf.is_empty() {
        let Some((len, used)) = decode_varint(buf)? else {
            break; // torn varint at the tail
        };
        let body = &buf[used..];
        let Some(record) = body.get(..len as usize) else {
            break; // torn record at the tail
        };
        match serde_json::from_slice(record) {
            Ok(data) => last = Some(data),
            Err(_) => break,
        }
        buf = &body[len as usize..];
    }

    last.ok_or_else(|| PortoError::unknown("key-value node holds no complete record"))
}

fn is_mount_point(path: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string("/proc/self/mounts") else {
        return false;
    };
    let needle = path.to_string_lossy();
    text.lines()
        .any(|line| line.split_whitespace().nth(1) == Some(needle.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), 1 << 20).unwrap();

        let data = map(&[("state", "stopped"), ("command", "sleep 5")]);
        store.save(3, &data).unwrap();

        let node = store.load(3).unwrap();
        assert_eq!(node.id, 3);
        assert_eq!(node.data, data);
    }

    #[test]
    fn later_records_win() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), 1 << 20).unwrap();

        store.save(1, &map(&[("state", "starting")])).unwrap();
        store.save(1, &map(&[("state", "running")])).unwrap();

        let node = store.load(1).unwrap();
        assert_eq!(node.data.get("state").unwrap(), "running");
    }

    #[test]
    fn torn_tail_falls_back_to_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), 1 << 20).unwrap();

        store.save(1, &map(&[("state", "dead")])).unwrap();

        // Simulate a crash mid-append: a dangling length prefix.
        let path = dir.path().join("1");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xff, 0x07, b'{']).unwrap();
        drop(file);

        let node = store.load(1).unwrap();
        assert_eq!(node.data.get("state").unwrap(), "dead");
    }

    #[test]
    fn load_all_sorts_and_quarantines() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), 1 << 20).unwrap();

        store.save(7, &map(&[("a", "1")])).unwrap();
        store.save(2, &map(&[("b", "2")])).unwrap();
        std::fs::write(dir.path().join("9"), b"garbage").unwrap();

        let (nodes, failed) = store.load_all().unwrap();
        assert_eq!(nodes.iter().map(|n| n.id).collect::<Vec<_>>(), vec![2, 7]);
        assert_eq!(failed, 1);
        assert!(dir.path().join("9.bad").exists());
        assert!(!dir.path().join("9").exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), 1 << 20).unwrap();
        store.save(5, &map(&[("x", "y")])).unwrap();
        store.remove(5).unwrap();
        store.remove(5).unwrap();
        assert!(!store.contains(5));
    }

    #[test]
    fn oversized_record_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), 64).unwrap();
        let big = "x".repeat(256);
        let data = map(&[("big", big.as_str())]);
        assert!(matches!(
            store.save(1, &data),
            Err(PortoError::NoSpace { .. })
        ));
    }
}
