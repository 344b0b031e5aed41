//! The scheduler's singleton lock.
//!
//! An advisory exclusive lock on a dedicated file makes overlapping cron
//! invocations safe: whoever loses the race skips its pass. The lock lives
//! in the file descriptor, not in the file's existence, so a crashed holder
//! never blocks the next run.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

pub enum LockOutcome {
    Acquired(PassLock),
    Held,
}

/// Held for as long as the scheduler may touch shared state. Unlocks on drop.
pub struct PassLock {
    file: File,
}

impl Drop for PassLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn try_acquire(path: &Path) -> io::Result<LockOutcome> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            // record the holder's pid now that the lock is ours
            let mut file = file;
            file.set_len(0)?;
            writeln!(file, "{}", std::process::id())?;
            Ok(LockOutcome::Acquired(PassLock { file }))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(LockOutcome::Held),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("tinysched.lock");

        let first = try_acquire(&path).unwrap();
        assert!(matches!(first, LockOutcome::Acquired(_)));

        // flock ownership follows the descriptor, so a second open contends
        // even within one process
        let second = try_acquire(&path).unwrap();
        assert!(matches!(second, LockOutcome::Held));

        drop(first);
        let third = try_acquire(&path).unwrap();
        assert!(matches!(third, LockOutcome::Acquired(_)));
    }

    #[test]
    fn test_lock_file_records_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tinysched.lock");

        let _lock = try_acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_stale_lock_file_does_not_block() {
        // existence alone must not block: simulate a crashed holder by
        // writing the file without locking it
        let dir = tempdir().unwrap();
        let path = dir.path().join("tinysched.lock");
        std::fs::write(&path, "99999\n").unwrap();

        let outcome = try_acquire(&path).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(_)));
    }
}
