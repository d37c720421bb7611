//! Registry of running `worker start` processes.
//!
//! Each process leaves `<pid>.pid` in a `<db>.workers` directory beside the
//! database for as long as it runs. `worker stop` signals whatever is listed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

/// Directory holding the records for the database at `db`.
pub fn registry_dir(db: &Path) -> PathBuf {
    let mut name = db.as_os_str().to_owned();
    name.push(".workers");
    PathBuf::from(name)
}

/// Record file for `pid` under the database at `db`.
pub fn record_path(db: &Path, pid: u32) -> PathBuf {
    registry_dir(db).join(format!("{pid}.pid"))
}

/// This process's record; removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(db: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let dir = registry_dir(db);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create worker registry {}", dir.display()))?;
        let path = record_path(db, pid);
        fs::write(&path, format!("{pid}\n"))
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "failed to remove pid file");
        }
    }
}

/// Recorded worker processes, lowest pid first. Files that are not
/// `<pid>.pid` are ignored.
pub fn recorded(db: &Path) -> anyhow::Result<Vec<(u32, PathBuf)>> {
    let dir = registry_dir(db);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut workers = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("pid") {
            continue;
        }
        let pid = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u32>().ok());
        if let Some(pid) = pid {
            workers.push((pid, path));
        }
    }
    workers.sort();
    Ok(workers)
}

/// Send SIGTERM to `pid`. `Ok(false)` means no such process exists.
#[cfg(unix)]
pub fn terminate(pid: u32) -> anyhow::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).with_context(|| format!("pid {pid} is out of range"))?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to signal process {pid}")),
    }
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> anyhow::Result<bool> {
    anyhow::bail!("worker stop needs unix signals; press Ctrl+C in the worker's terminal")
}
