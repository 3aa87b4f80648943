//! Small helpers shared across the engine.

use std::path::Path;

use anyhow::{bail, Error};
use nix::sys::statvfs::statvfs;
use nix::unistd;

/// Run a blocking closure from async context without stalling the
/// scheduler.
///
/// Calls into the LSM library are plain blocking FFI; inside the runtime
/// they get moved off the cooperative executor. Outside any runtime (static
/// init, unit tests without an executor, teardown) the closure runs inline.
pub fn block_in_place<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    match tokio::runtime::Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(f),
        Err(_) => f(),
    }
}

/// Create `path` with the given contents, atomically.
///
/// Note: mkstemp is used so this stays correct across processes, threads
/// and tasks writing the same path.
pub fn file_set_contents<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };

    let tmp_path = tmp_path.as_path();

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };

    use std::io::Write;
    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        bail!("write {:?} failed: {}", tmp_path, err);
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        bail!("atomic rename to {:?} failed: {}", path, err);
    }

    Ok(())
}

/// Block size of the filesystem holding `path`.
///
/// This is the alignment direct I/O has to respect on that filesystem.
pub fn fs_block_size<P: AsRef<Path>>(path: P) -> Result<usize, Error> {
    let stat = statvfs(path.as_ref())?;
    Ok(stat.block_size() as usize)
}
