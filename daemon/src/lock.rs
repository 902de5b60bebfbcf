//! Single-instance lock (spec §7/§9): an exclusive file lock with the
//! holder's PID written inside, so a second bridge process refuses to
//! start while one is already running.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use fs2::FileExt;

pub struct InstanceLock {
    file: File,
}

impl InstanceLock {
    /// Acquires the exclusive lock at `path`, creating it if needed.
    /// Fails immediately (does not block) if another process holds it.
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;

        file.try_lock_exclusive().with_context(|| {
            format!(
                "another bridge instance holds the lock at {} (is it already running?)",
                path.display()
            )
        })?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self { file })
    }

    /// Reads the PID recorded by whoever currently holds (or last held)
    /// the lock file, for diagnostics.
    pub fn read_recorded_pid(path: &Path) -> anyhow::Result<Option<u32>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("open lock file for inspection"),
        };
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents.trim().parse().ok())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_on_same_path_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.lock");
        let first = InstanceLock::acquire(&path).unwrap();
        assert!(InstanceLock::acquire(&path).is_err());
        drop(first);
        assert!(InstanceLock::acquire(&path).is_ok());
    }

    #[test]
    fn records_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.lock");
        let _lock = InstanceLock::acquire(&path).unwrap();
        let pid = InstanceLock::read_recorded_pid(&path).unwrap();
        assert_eq!(pid, Some(std::process::id()));
    }
}
