//! Write-side file adapters: append-oriented files and the directory
//! handle.
//!
//! The direct variant keeps the tail of the file in an aligned scratch
//! block so that every physical write lands block-aligned, and truncates
//! the file back to its logical length on close. Skipping that truncate
//! leaves padding on disk which a reopen would read as a corrupt tail, so
//! it is treated as a hard invariant here.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::error;
use nix::fcntl::{fallocate, posix_fadvise, FallocateFlags, PosixFadviseAdvice};
use nix::sys::uio::pwrite;
use nix::unistd::ftruncate;

use crate::error::Result;
use crate::tools::block_in_place;

use super::align::{Alignment, AlignedBuf};
use super::file::FileOpts;

/// Pre-allocation behaviour for writable files.
#[derive(Debug, Clone, Copy)]
pub struct WritableOpts {
    /// Window growth granularity; the page size by default.
    pub prealloc_block: usize,
    /// Whether to back the window with fallocate. Off by default; not all
    /// filesystems support it together with direct I/O.
    pub use_fallocate: bool,
    /// Pass KEEP_SIZE so pre-allocation never shows in the file length.
    pub keep_size: bool,
}

impl Default for WritableOpts {
    fn default() -> Self {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        WritableOpts {
            prealloc_block: page.max(4096),
            use_fallocate: false,
            keep_size: true,
        }
    }
}

/// Monotonically growing pre-allocation window.
///
/// Requests entirely inside the window are no-ops; the window is never
/// shrunk.
struct PreallocWindow {
    end: u64,
    opts: WritableOpts,
}

impl PreallocWindow {
    fn new(opts: WritableOpts) -> Self {
        PreallocWindow { end: 0, opts }
    }

    fn extend(&mut self, fd: i32, offset: u64, len: u64) -> Result<()> {
        let needed = offset + len;
        if needed <= self.end {
            return Ok(());
        }
        let block = self.opts.prealloc_block as u64;
        let new_end = ((needed + block - 1) / block) * block;
        if self.opts.use_fallocate {
            let flags = if self.opts.keep_size {
                FallocateFlags::FALLOC_FL_KEEP_SIZE
            } else {
                FallocateFlags::empty()
            };
            block_in_place(|| {
                fallocate(
                    fd,
                    flags,
                    self.end as libc::off_t,
                    (new_end - self.end) as libc::off_t,
                )
            })?;
        }
        self.end = new_end;
        Ok(())
    }
}

/// Block-aligned physical write; every direct write funnels through here.
fn write_aligned(
    file: &std::fs::File,
    window: &mut PreallocWindow,
    a: Alignment,
    offset: u64,
    buf: &[u8],
) -> Result<()> {
    debug_assert!(a.aligned_offset(offset));
    debug_assert!(a.aligned_buf(buf));
    let fd = file.as_raw_fd();
    window.extend(fd, offset, buf.len() as u64)?;
    let mut written = 0;
    while written < buf.len() {
        let n = block_in_place(|| {
            pwrite(fd, &buf[written..], (offset + written as u64) as libc::off_t)
        })?;
        written += n;
    }
    Ok(())
}

fn open_writable(path: &Path, extra_flags: libc::c_int) -> Result<std::fs::File> {
    let mut oo = OpenOptions::new();
    oo.write(true).create(true);
    if extra_flags != 0 {
        oo.custom_flags(extra_flags);
    }
    Ok(oo.open(path)?)
}

/// Append-only file through the page cache.
pub struct WritableFile {
    file: std::fs::File,
    path: PathBuf,
    offset: u64,
    window: PreallocWindow,
}

impl WritableFile {
    pub fn create<P: AsRef<Path>>(path: P, opts: WritableOpts) -> Result<Self> {
        Ok(WritableFile {
            file: open_writable(path.as_ref(), 0)?,
            path: path.as_ref().to_owned(),
            offset: 0,
            window: PreallocWindow::new(opts),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current logical end of file.
    pub fn size(&self) -> u64 {
        self.offset
    }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.prepare_write(self.offset, data.len() as u64)?;
        let fd = self.file.as_raw_fd();
        let mut written = 0;
        while written < data.len() {
            let n = block_in_place(|| {
                pwrite(fd, &data[written..], (self.offset + written as u64) as libc::off_t)
            })?;
            written += n;
        }
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Flush dirty pages of `[offset, offset+n)` without touching
    /// metadata.
    pub fn range_sync(&self, offset: u64, n: u64) -> Result<()> {
        let fd = self.file.as_raw_fd();
        let rc = block_in_place(|| unsafe {
            libc::sync_file_range(
                fd,
                offset as libc::off64_t,
                n as libc::off64_t,
                libc::SYNC_FILE_RANGE_WAIT_BEFORE | libc::SYNC_FILE_RANGE_WRITE,
            )
        });
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Advise eviction of `[offset, offset+n)` from the page cache.
    pub fn invalidate_cache(&self, offset: u64, n: u64) -> Result<()> {
        posix_fadvise(
            self.file.as_raw_fd(),
            offset as libc::off_t,
            n as libc::off_t,
            PosixFadviseAdvice::POSIX_FADV_DONTNEED,
        )?;
        Ok(())
    }

    pub fn prepare_write(&mut self, offset: u64, len: u64) -> Result<()> {
        let fd = self.file.as_raw_fd();
        self.window.extend(fd, offset, len)
    }

    pub fn allocate(&mut self, offset: u64, len: u64) -> Result<()> {
        self.prepare_write(offset, len)
    }

    pub fn truncate(&mut self, len: u64) -> Result<()> {
        block_in_place(|| ftruncate(self.file.as_raw_fd(), len as libc::off_t))?;
        self.offset = len;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        block_in_place(|| self.file.sync_data())?;
        Ok(())
    }

    pub fn fsync(&self) -> Result<()> {
        block_in_place(|| self.file.sync_all())?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.fsync()
    }
}

/// Append-only file bypassing the page cache.
///
/// The logical end may sit anywhere inside the final block; on disk the
/// file is padded to the next boundary until close/truncate cuts it back.
pub struct DirectWritableFile {
    file: std::fs::File,
    path: PathBuf,
    alignment: Alignment,
    logical: u64,
    scratch: AlignedBuf,
    scratch_len: usize,
    window: PreallocWindow,
    closed: bool,
}

impl DirectWritableFile {
    pub fn create<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        opts: WritableOpts,
    ) -> Result<Self> {
        let alignment = Alignment(block_size);
        Ok(DirectWritableFile {
            file: open_writable(path.as_ref(), libc::O_DIRECT)?,
            path: path.as_ref().to_owned(),
            alignment,
            logical: 0,
            scratch: AlignedBuf::zeroed(block_size, alignment),
            scratch_len: 0,
            window: PreallocWindow::new(opts),
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical end of file; the on-disk size may be rounded up until
    /// close.
    pub fn size(&self) -> u64 {
        self.logical
    }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let mut data = data;
        let a = self.alignment;
        let block = a.0;

        // Case 1/2: top up the partial tail block first.
        if self.scratch_len > 0 {
            let take = (block - self.scratch_len).min(data.len());
            let base = a.align(self.logical);
            self.scratch[self.scratch_len..self.scratch_len + take]
                .copy_from_slice(&data[..take]);
            self.scratch_len += take;
            write_aligned(&self.file, &mut self.window, a, base, &self.scratch)?;
            self.logical += take as u64;
            data = &data[take..];
            if self.scratch_len == block {
                self.scratch_len = 0;
                for b in self.scratch.iter_mut() {
                    *b = 0;
                }
            }
            if data.is_empty() {
                return Ok(());
            }
        }

        // Case 3: aligned bulk of whole blocks.
        let whole = a.align(data.len() as u64) as usize;
        if whole > 0 {
            let mut bulk = AlignedBuf::zeroed(whole, a);
            bulk.copy_from_slice(&data[..whole]);
            let base = a.align(self.logical);
            write_aligned(&self.file, &mut self.window, a, base, &bulk)?;
            self.logical += whole as u64;
            data = &data[whole..];
        }

        // Case 4: remainder becomes the new padded tail block.
        if !data.is_empty() {
            for b in self.scratch.iter_mut() {
                *b = 0;
            }
            self.scratch[..data.len()].copy_from_slice(data);
            self.scratch_len = data.len();
            let base = a.align(self.logical);
            write_aligned(&self.file, &mut self.window, a, base, &self.scratch)?;
            self.logical += data.len() as u64;
        }

        Ok(())
    }

    pub fn prepare_write(&mut self, offset: u64, len: u64) -> Result<()> {
        let fd = self.file.as_raw_fd();
        self.window.extend(fd, offset, len)
    }

    pub fn allocate(&mut self, offset: u64, len: u64) -> Result<()> {
        self.prepare_write(offset, len)
    }

    /// Physically truncate to `len` and make it the new logical end.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        assert!(len <= self.logical, "truncate beyond logical end");
        block_in_place(|| ftruncate(self.file.as_raw_fd(), len as libc::off_t))?;
        self.logical = len;
        self.scratch_len = (len - self.alignment.align(len)) as usize;
        if self.scratch_len > 0 {
            // The partial tail has to be resident for the next append.
            let base = self.alignment.align(len);
            let back = super::file::RandomAccessFile::open(
                &self.path,
                FileOpts { direct: false, alignment: Alignment::none() },
            )?
            .read(base, self.scratch_len)?;
            for b in self.scratch.iter_mut() {
                *b = 0;
            }
            self.scratch[..back.len()].copy_from_slice(&back);
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        block_in_place(|| self.file.sync_data())?;
        Ok(())
    }

    pub fn fsync(&self) -> Result<()> {
        block_in_place(|| self.file.sync_all())?;
        Ok(())
    }

    /// Cut the on-disk padding back to the logical length and sync.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        block_in_place(|| ftruncate(self.file.as_raw_fd(), self.logical as libc::off_t))?;
        self.fsync()
    }
}

impl Drop for DirectWritableFile {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Last chance to honour the truncate invariant.
        if let Err(err) =
            block_in_place(|| ftruncate(self.file.as_raw_fd(), self.logical as libc::off_t))
        {
            error!("direct file {:?}: truncate on drop failed: {}", self.path, err);
        }
    }
}

/// Directory handle; only fsync is needed by the library.
pub struct Dir {
    file: std::fs::File,
}

impl Dir {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Dir { file: std::fs::File::open(path.as_ref())? })
    }

    pub fn fsync(&self) -> Result<()> {
        block_in_place(|| self.file.sync_all())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_append_and_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf");
        let mut f = WritableFile::create(&path, WritableOpts::default()).unwrap();

        f.append(b"hello ").unwrap();
        f.append(b"world").unwrap();
        assert_eq!(f.size(), 11);

        // requests inside the window are no-ops
        f.allocate(0, 4).unwrap();
        let end = f.window.end;
        f.allocate(2, 2).unwrap();
        assert_eq!(f.window.end, end);

        f.range_sync(0, 11).unwrap();
        f.invalidate_cache(0, 11).unwrap();
        f.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn window_grows_in_blocks_and_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w");
        let opts = WritableOpts { prealloc_block: 4096, ..WritableOpts::default() };
        let mut f = WritableFile::create(&path, opts).unwrap();

        f.prepare_write(0, 1).unwrap();
        assert_eq!(f.window.end, 4096);
        f.prepare_write(4000, 200).unwrap();
        assert_eq!(f.window.end, 8192);
        f.prepare_write(0, 100).unwrap();
        assert_eq!(f.window.end, 8192);
    }

    // Direct I/O against tmpfs fails with EINVAL; these tests run against
    // the build directory's filesystem instead.
    fn direct_capable_dir() -> Option<tempfile::TempDir> {
        let base = std::env::current_dir().ok()?;
        let dir = tempfile::tempdir_in(base).ok()?;
        let probe = dir.path().join("probe");
        let ok = OpenOptions::new()
            .write(true)
            .create(true)
            .custom_flags(libc::O_DIRECT)
            .open(&probe)
            .is_ok();
        if ok {
            Some(dir)
        } else {
            None
        }
    }

    #[test]
    fn direct_file_truncates_to_logical_size() {
        let dir = match direct_capable_dir() {
            Some(dir) => dir,
            None => return,
        };
        let path = dir.path().join("direct");
        let mut f = DirectWritableFile::create(&path, 4096, WritableOpts::default()).unwrap();

        // three appends straddling block boundaries
        f.append(&[b'a'; 100]).unwrap();
        f.append(&[b'b'; 4000]).unwrap();
        f.append(&[b'c'; 7]).unwrap();
        assert_eq!(f.size(), 4107);
        f.close().unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 4107);

        let data = std::fs::read(&path).unwrap();
        assert!(data[..100].iter().all(|b| *b == b'a'));
        assert!(data[100..4100].iter().all(|b| *b == b'b'));
        assert!(data[4100..].iter().all(|b| *b == b'c'));
    }

    #[test]
    fn direct_file_drop_still_truncates() {
        let dir = match direct_capable_dir() {
            Some(dir) => dir,
            None => return,
        };
        let path = dir.path().join("dropped");
        {
            let mut f =
                DirectWritableFile::create(&path, 4096, WritableOpts::default()).unwrap();
            f.append(&[b'x'; 10]).unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
    }
}
