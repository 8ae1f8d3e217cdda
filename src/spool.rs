//! The message spool: a device/subdir tree under the configured data
//! directory.
//!
//! Outbound reports are dropped into `modem/outbox` by the application; the
//! driver picks them in ascending name order, and on completion deletes them
//! or moves them to `modem/sent` / `modem/error` per the keep-file policy.
//! Received MT messages are written into the tree the router selects.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::mt::{DeviceDir, SubDir};

pub struct Spool {
    root: PathBuf,
}

impl Spool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute directory for a device/subdir pair.
    pub fn dir(&self, device: DeviceDir, subdir: SubDir) -> PathBuf {
        let mut path = self.root.clone();
        if !device.dir_name().is_empty() {
            path.push(device.dir_name());
        }
        if !subdir.dir_name().is_empty() {
            path.push(subdir.dir_name());
        }
        path
    }

    /// Create the directories the driver writes into.
    pub fn ensure_tree(&self) -> Result<(), String> {
        let modem = [SubDir::Outbox, SubDir::Inbox, SubDir::Error, SubDir::Sent];
        for subdir in modem {
            let dir = self.dir(DeviceDir::Modem, subdir);
            fs::create_dir_all(&dir).map_err(|e| format!("create {}: {e}", dir.display()))?;
        }
        Ok(())
    }

    /// Next file to transmit: the ascending-name first regular file in the
    /// modem outbox.
    pub fn next_outbox_file(&self) -> Option<PathBuf> {
        let outbox = self.dir(DeviceDir::Modem, SubDir::Outbox);
        let mut names: Vec<PathBuf> = fs::read_dir(outbox)
            .ok()?
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        names.sort();
        names.into_iter().next()
    }

    /// Move a file into the modem `sent` subdir.
    pub fn mark_sent(&self, path: &Path) -> Result<PathBuf, String> {
        self.move_into(path, self.dir(DeviceDir::Modem, SubDir::Sent))
    }

    /// Move a file into the modem `error` subdir.
    pub fn mark_error(&self, path: &Path) -> Result<PathBuf, String> {
        self.move_into(path, self.dir(DeviceDir::Modem, SubDir::Error))
    }

    pub fn delete(&self, path: &Path) -> Result<(), String> {
        fs::remove_file(path).map_err(|e| format!("delete {}: {e}", path.display()))
    }

    fn move_into(&self, path: &Path, dir: PathBuf) -> Result<PathBuf, String> {
        let name = path
            .file_name()
            .ok_or_else(|| format!("no file name in {}", path.display()))?;
        fs::create_dir_all(&dir).map_err(|e| format!("create {}: {e}", dir.display()))?;
        let dest = dir.join(name);
        fs::rename(path, &dest).map_err(|e| format!("move {}: {e}", path.display()))?;
        Ok(dest)
    }

    /// Write a received MT payload into `device`/`subdir`.
    ///
    /// `system_name` types overwrite a fixed per-type filename; everything
    /// else gets a fresh time-sequenced name.
    pub fn save_mt(
        &self,
        payload: &[u8],
        msg_type: u16,
        device: DeviceDir,
        subdir: SubDir,
        system_name: bool,
    ) -> Result<PathBuf, String> {
        let dir = self.dir(device, subdir);
        fs::create_dir_all(&dir).map_err(|e| format!("create {}: {e}", dir.display()))?;

        let path = if system_name {
            dir.join(format!("sys{msg_type:04x}.msg"))
        } else {
            self.timed_filename(&dir)
        };

        fs::write(&path, payload).map_err(|e| format!("write {}: {e}", path.display()))?;
        debug!("Spool: saved {} bytes to {}", payload.len(), path.display());
        Ok(path)
    }

    /// Copy a saved file into the port-3 tree under the same subdir.
    pub fn copy_to_port3(&self, path: &Path, subdir: SubDir) -> Result<PathBuf, String> {
        let dir = self.dir(DeviceDir::Rs422Port3, subdir);
        fs::create_dir_all(&dir).map_err(|e| format!("create {}: {e}", dir.display()))?;
        let name = path
            .file_name()
            .ok_or_else(|| format!("no file name in {}", path.display()))?;
        let dest = dir.join(name);
        fs::copy(path, &dest).map_err(|e| format!("copy {}: {e}", path.display()))?;
        Ok(dest)
    }

    /// Epoch-seconds name with a collision sequence, `mXXXXXXXXXXnn.sbd`.
    fn timed_filename(&self, dir: &Path) -> PathBuf {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        for seq in 0..100u32 {
            let candidate = dir.join(format!("m{secs:010}{seq:02}.sbd"));
            if !candidate.exists() {
                return candidate;
            }
        }
        dir.join(format!("m{secs:010}99.sbd"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sbdlink-spool-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_outbox_pick_is_ascending() {
        let root = scratch("pick");
        let spool = Spool::new(&root);
        spool.ensure_tree().unwrap();

        let outbox = spool.dir(DeviceDir::Modem, SubDir::Outbox);
        fs::write(outbox.join("b002.rpt"), b"two").unwrap();
        fs::write(outbox.join("a001.rpt"), b"one").unwrap();

        let picked = spool.next_outbox_file().unwrap();
        assert_eq!(picked.file_name().unwrap(), "a001.rpt");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_mark_sent_and_error_move() {
        let root = scratch("moves");
        let spool = Spool::new(&root);
        spool.ensure_tree().unwrap();

        let outbox = spool.dir(DeviceDir::Modem, SubDir::Outbox);
        let f = outbox.join("a001.rpt");
        fs::write(&f, b"payload").unwrap();

        let sent = spool.mark_sent(&f).unwrap();
        assert!(sent.ends_with("modem/sent/a001.rpt"));
        assert!(!f.exists());

        fs::write(&f, b"payload").unwrap();
        let errored = spool.mark_error(&f).unwrap();
        assert!(errored.ends_with("modem/error/a001.rpt"));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_save_mt_system_and_timed_names() {
        let root = scratch("save");
        let spool = Spool::new(&root);

        let sys = spool
            .save_mt(b"cfg", 0x0488, DeviceDir::Modem, SubDir::Inbox, true)
            .unwrap();
        assert_eq!(sys.file_name().unwrap(), "sys0488.msg");
        assert_eq!(fs::read(&sys).unwrap(), b"cfg");

        let a = spool
            .save_mt(b"one", 0x0021, DeviceDir::Modem, SubDir::Inbox, false)
            .unwrap();
        let b = spool
            .save_mt(b"two", 0x0021, DeviceDir::Modem, SubDir::Inbox, false)
            .unwrap();
        assert_ne!(a, b, "timed filenames must not collide");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_copy_to_port3_mirrors_subdir() {
        let root = scratch("copy");
        let spool = Spool::new(&root);

        let saved = spool
            .save_mt(b"msg", 0x00A1, DeviceDir::Rs422Port2, SubDir::Inbox, false)
            .unwrap();
        let copied = spool.copy_to_port3(&saved, SubDir::Inbox).unwrap();
        assert!(copied.to_string_lossy().contains("port3/inbox"));
        assert_eq!(fs::read(&copied).unwrap(), b"msg");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_root_device_saves_at_tree_root() {
        let root = scratch("rootdir");
        let spool = Spool::new(&root);
        let saved = spool
            .save_mt(b"x", 0x0700, DeviceDir::Root, SubDir::None, false)
            .unwrap();
        assert_eq!(saved.parent().unwrap(), root.as_path());
        let _ = fs::remove_dir_all(&root);
    }
}
