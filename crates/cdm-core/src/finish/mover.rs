use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::url_model::{shorten, MAX_FILE_NAME_BYTES};

const MAX_CONFLICTS: u32 = 10_000;
const MOVE_BACKOFF: Duration = Duration::from_millis(100);

/// `dir/name.ext` → `dir/name (n).ext`.
pub fn conflict_name(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    };
    path.with_file_name(name)
}

/// Final path for `dest`: parent created, name shortened to fit, and unless
/// `overwrite` is set a free `name (n).ext` variant starting at `conflicts`.
pub fn resolve_destination(dest: &Path, conflicts: u32, overwrite: bool) -> io::Result<(PathBuf, u32)> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"))?;
    // Leave room for a " (nnnn)" suffix.
    let dest = dest.with_file_name(shorten(&name, MAX_FILE_NAME_BYTES - 8));
    if overwrite || !dest.exists() {
        return Ok((dest, conflicts));
    }
    for n in conflicts.max(1)..MAX_CONFLICTS {
        let candidate = conflict_name(&dest, n);
        if !candidate.exists() {
            return Ok((candidate, n));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {}", dest.display()),
    ))
}

/// Move `src` to `dst`: rename, or copy and delete when renaming is not possible
/// (other filesystem). Transient failures are retried up to `attempts` times.
pub fn move_file(src: &Path, dst: &Path, attempts: u32) -> io::Result<()> {
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match fs::rename(src, dst) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(e),
            Err(e) => tracing::debug!(error = %e, attempt, "rename failed, copying"),
        }
        match copy_and_remove(src, dst) {
            Ok(()) => return Ok(()),
            Err(e) if is_permanent(&e) => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, attempt, "move failed, retrying");
                last = Some(e);
                thread::sleep(MOVE_BACKOFF * attempt);
            }
        }
    }
    Err(last.unwrap_or_else(|| io::Error::other("move failed")))
}

fn copy_and_remove(src: &Path, dst: &Path) -> io::Result<()> {
    if let Err(e) = fs::copy(src, dst) {
        let _ = fs::remove_file(dst);
        return Err(e);
    }
    fs::remove_file(src)
}

fn is_permanent(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if matches!(e.raw_os_error(), Some(libc::ENOSPC) | Some(libc::ENAMETOOLONG) | Some(libc::EROFS)) {
            return true;
        }
    }
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput
    )
}
