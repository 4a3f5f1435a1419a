//! Per-task state directories and their exclusive locks.
//!
//! Every task keeps its stores and its offset checkpoint in
//! `<state_dir>/<task_id>/`. Two tasks must never open the same
//! directory at once, so a task holds an exclusive `flock` on a lock
//! file with its process id for as long as it lives.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Seek;
use std::io::Write;
#[cfg(unix)]
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;

use sysinfo::Pid;
use sysinfo::System;

use crate::errors::InitContext;
use crate::errors::Result;
use crate::errors::StandbyError;
use crate::model::TaskId;

const LOCK_FILE_NAME: &str = ".lock";

/// Check whether a process exists, to tell if a lock file is stale.
fn process_exists(pid: u32) -> bool {
    let s = System::new_all();
    s.process(Pid::from(pid as usize)).is_some()
}

/// An exclusive, non-blocking `flock` on an open file, released when
/// dropped.
#[derive(Debug)]
struct FlockGuard(File);

impl FlockGuard {
    fn new(file: File) -> io::Result<Self> {
        #[cfg(unix)]
        {
            let r = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if r != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self(file))
    }
}

impl Drop for FlockGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            let r = unsafe { libc::flock(self.0.as_raw_fd(), libc::LOCK_UN) };
            if r != 0 {
                tracing::debug!("Unable to unlock lock file: {}", io::Error::last_os_error());
            }
        }
    }
}

/// Is `file` still the one linked at `path`?
///
/// A previous owner removes the lock file when it lets go, so a
/// `flock` won on a file opened just before that is worthless.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(linked) => Ok(held.dev() == linked.dev() && held.ino() == linked.ino()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, _path: &Path) -> io::Result<bool> {
    Ok(true)
}

/// Directory of one task, locked while this value is alive.
#[derive(Debug)]
pub struct TaskDir {
    task: TaskId,
    path: PathBuf,
    lock_path: PathBuf,
    flock: FlockGuard,
}

impl TaskDir {
    /// Create the task's directory if needed and take its lock.
    ///
    /// A lock file left behind by a process that no longer runs is
    /// taken over.
    pub fn lock(root: &Path, task: TaskId) -> Result<Self> {
        let path = root.join(task.to_string());
        fs::create_dir_all(&path).init_err(task, "can't create task state directory")?;
        let lock_path = path.join(LOCK_FILE_NAME);
        let me = std::process::id();

        loop {
            // Never truncate before holding the flock: the file may be
            // somebody else's.
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .init_err(task, "can't open task lock file")?;
            let mut guard = match FlockGuard::new(file) {
                Ok(guard) => guard,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    let owner = fs::read_to_string(&lock_path).unwrap_or_default();
                    return Err(StandbyError::init(
                        task,
                        format!(
                            "state directory {path:?} is locked by process {}",
                            owner.trim()
                        ),
                    ));
                }
                Err(err) => {
                    return Err::<Self, _>(err).init_err(task, "can't lock task lock file")
                }
            };
            if !still_linked(&guard.0, &lock_path).init_err(task, "can't stat task lock file")? {
                tracing::debug!("Lock file {lock_path:?} was released under us; retrying");
                continue;
            }

            // From here on we hold the lock.
            let mut contents = String::new();
            guard
                .0
                .read_to_string(&mut contents)
                .init_err(task, "can't read task lock file")?;
            let contents = contents.trim();
            if !contents.is_empty() {
                match contents.parse::<u32>() {
                    Ok(pid) if pid == me => {}
                    Ok(pid) if process_exists(pid) => {
                        return Err(StandbyError::init(
                            task,
                            format!("state directory {path:?} is locked by process {pid}"),
                        ));
                    }
                    Ok(pid) => {
                        tracing::warn!("Taking over stale lock on {path:?} left by process {pid}");
                    }
                    Err(_) => {
                        tracing::error!(
                            "Invalid lock file contents {contents:?} in {lock_path:?}; \
                             refusing to take over the state directory"
                        );
                        return Err(StandbyError::init(
                            task,
                            format!("state directory {path:?} has an unreadable lock file"),
                        ));
                    }
                }
            }

            guard
                .0
                .set_len(0)
                .and_then(|()| guard.0.rewind())
                .and_then(|()| write!(guard.0, "{me}"))
                .and_then(|()| guard.0.sync_all())
                .init_err(task, "can't write task lock file")?;
            tracing::debug!("Locked state directory {path:?} for task {task}");
            return Ok(Self {
                task,
                path,
                lock_path,
                flock: guard,
            });
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TaskDir {
    fn drop(&mut self) {
        // Unlink while still holding the flock; `flock` itself is
        // released right after, when its guard drops.
        match still_linked(&self.flock.0, &self.lock_path) {
            Ok(true) => {
                if let Err(err) = fs::remove_file(&self.lock_path) {
                    tracing::warn!("Unable to release lock {:?}: {err}", self.lock_path);
                } else {
                    tracing::debug!("Unlocked state directory {:?}", self.path);
                }
            }
            Ok(false) => {
                tracing::warn!("Lock file {:?} was replaced while held", self.lock_path);
            }
            Err(err) => {
                tracing::warn!("Unable to check lock {:?}: {err}", self.lock_path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Barrier;

    use super::*;

    /// No OS hands out pids this large.
    const DEAD_PID: u32 = u32::MAX;

    fn stale_lock(root: &Path, task: TaskId) -> PathBuf {
        let path = root.join(task.to_string());
        fs::create_dir_all(&path).unwrap();
        let lock_path = path.join(LOCK_FILE_NAME);
        fs::write(&lock_path, DEAD_PID.to_string()).unwrap();
        lock_path
    }

    #[test]
    fn second_lock_fails_until_first_dropped() {
        let root = tempfile::tempdir().unwrap();
        let task = TaskId::new(0, 2);

        let dir = TaskDir::lock(root.path(), task).unwrap();
        assert_eq!(dir.path(), root.path().join("0_2"));
        let contents = fs::read_to_string(root.path().join("0_2").join(LOCK_FILE_NAME)).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        let err = TaskDir::lock(root.path(), task).unwrap_err();
        assert!(err.to_string().contains("locked by process"), "{err}");

        drop(dir);
        assert!(!root.path().join("0_2").join(LOCK_FILE_NAME).exists());
        assert!(TaskDir::lock(root.path(), task).is_ok());
    }

    #[test]
    fn different_tasks_do_not_conflict() {
        let root = tempfile::tempdir().unwrap();

        let _a = TaskDir::lock(root.path(), TaskId::new(0, 0)).unwrap();
        let _b = TaskDir::lock(root.path(), TaskId::new(0, 1)).unwrap();
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let root = tempfile::tempdir().unwrap();
        let task = TaskId::new(1, 1);
        let lock_path = stale_lock(root.path(), task);

        let dir = TaskDir::lock(root.path(), task).unwrap();

        assert_eq!(dir.task(), task);
        assert_eq!(
            fs::read_to_string(&lock_path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn garbage_lock_file_is_not_taken_over() {
        let root = tempfile::tempdir().unwrap();
        let task = TaskId::new(1, 2);
        let lock_path = stale_lock(root.path(), task);
        fs::write(&lock_path, "not a pid").unwrap();

        let err = TaskDir::lock(root.path(), task).unwrap_err();

        assert!(err.to_string().contains("unreadable lock file"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn racing_takeovers_of_stale_lock_have_one_winner() {
        for _round in 0..20 {
            let root = tempfile::tempdir().unwrap();
            let task = TaskId::new(3, 0);
            stale_lock(root.path(), task);
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let root = root.path().to_path_buf();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        TaskDir::lock(&root, task)
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            let winners = results.iter().filter(|res| res.is_ok()).count();
            assert_eq!(winners, 1, "{results:?}");
        }
    }
}
