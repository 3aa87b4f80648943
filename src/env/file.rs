//! Read-side file adapters for the environment.
//!
//! All positional I/O goes through pread/pwrite on the raw descriptor so
//! adapters carry no kernel file offset; the logical offset of the
//! sequential reader is engine state. Blocking syscalls are moved off the
//! cooperative executor by the callers' `block_in_place` wrapping here.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::fcntl::{posix_fadvise, PosixFadviseAdvice};
use nix::sys::uio::{pread, pwrite};

use crate::error::Result;
use crate::tools::block_in_place;

use super::align::{Alignment, AlignedBuf};
use super::coop::{CoopMutex, CoopRwLock};

/// How the environment opens files on this database's filesystem.
#[derive(Debug, Clone, Copy)]
pub struct FileOpts {
    pub direct: bool,
    pub alignment: Alignment,
}

impl FileOpts {
    pub fn buffered() -> Self {
        FileOpts { direct: false, alignment: Alignment::none() }
    }

    pub fn direct(block_size: usize) -> Self {
        FileOpts { direct: true, alignment: Alignment(block_size) }
    }
}

fn open_read(path: &Path, opts: &FileOpts) -> Result<std::fs::File> {
    let mut oo = OpenOptions::new();
    oo.read(true);
    if opts.direct {
        oo.custom_flags(libc::O_DIRECT);
    }
    Ok(oo.open(path)?)
}

/// Positional read honouring direct-I/O alignment via a bounce buffer.
fn pread_at(fd: RawFd, opts: &FileOpts, offset: u64, len: usize) -> Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }

    if !opts.direct {
        let mut buf = vec![0u8; len];
        let got = block_in_place(|| pread(fd, &mut buf, offset as libc::off_t))?;
        buf.truncate(got);
        return Ok(buf);
    }

    let a = opts.alignment;
    let start = a.align(offset);
    let pad = (offset - start) as usize;
    let span = pad + len;
    let rounded = (a.align(span as u64 - 1) + a.0 as u64) as usize;

    let mut bounce = AlignedBuf::zeroed(rounded, a);
    debug_assert!(a.aligned_buf(&bounce) && a.aligned_offset(start));
    let got = block_in_place(|| pread(fd, &mut bounce, start as libc::off_t))?;

    let avail = got.saturating_sub(pad).min(len);
    Ok(bounce[pad..pad + avail].to_vec())
}

/// Sequential reader with a logical offset.
///
/// The library contract says callers serialise access; the per-instance
/// non-recursive lock turns a violation into a loud failure instead of a
/// silent misread.
pub struct SequentialFile {
    file: std::fs::File,
    opts: FileOpts,
    offset: AtomicU64,
    reader: CoopMutex,
}

impl SequentialFile {
    pub fn open<P: AsRef<Path>>(path: P, opts: FileOpts) -> Result<Self> {
        Ok(SequentialFile {
            file: open_read(path.as_ref(), &opts)?,
            opts,
            offset: AtomicU64::new(0),
            reader: CoopMutex::new(),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Read up to `n` bytes at the current offset and advance by the
    /// amount read.
    pub fn read(&self, n: usize) -> Result<Vec<u8>> {
        let _guard = self
            .reader
            .try_lock()
            .expect("concurrent read on sequential file");
        let offset = self.offset.load(Ordering::Acquire);
        let buf = pread_at(self.file.as_raw_fd(), &self.opts, offset, n)?;
        self.offset.store(offset + buf.len() as u64, Ordering::Release);
        Ok(buf)
    }

    /// Positional read independent of the sequential offset.
    pub fn positioned_read(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        let _guard = self
            .reader
            .try_lock()
            .expect("concurrent read on sequential file");
        pread_at(self.file.as_raw_fd(), &self.opts, offset, n)
    }

    /// Advance the offset without transferring data.
    pub fn skip(&self, n: u64) -> Result<()> {
        let _guard = self
            .reader
            .try_lock()
            .expect("concurrent read on sequential file");
        self.offset.fetch_add(n, Ordering::AcqRel);
        Ok(())
    }
}

/// Stateless positional reader.
pub struct RandomAccessFile {
    file: std::fs::File,
    opts: FileOpts,
    path: PathBuf,
}

impl RandomAccessFile {
    pub fn open<P: AsRef<Path>>(path: P, opts: FileOpts) -> Result<Self> {
        Ok(RandomAccessFile {
            file: open_read(path.as_ref(), &opts)?,
            opts,
            path: path.as_ref().to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn use_direct_io(&self) -> bool {
        self.opts.direct
    }

    /// Buffer alignment required of callers: the filesystem block size
    /// under direct I/O, otherwise 1.
    pub fn required_buffer_alignment(&self) -> usize {
        if self.opts.direct {
            self.opts.alignment.0
        } else {
            1
        }
    }

    pub fn read(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        pread_at(self.file.as_raw_fd(), &self.opts, offset, n)
    }

    /// Advise the kernel to stage `[offset, offset+n)`.
    ///
    /// Under direct I/O there is no page cache to warm; the library skips
    /// calling this then, and we ignore it likewise.
    pub fn prefetch(&self, offset: u64, n: u64) -> Result<()> {
        if self.opts.direct {
            return Ok(());
        }
        posix_fadvise(
            self.file.as_raw_fd(),
            offset as libc::off_t,
            n as libc::off_t,
            PosixFadviseAdvice::POSIX_FADV_WILLNEED,
        )?;
        Ok(())
    }
}

/// Positional read/write file. Readers share, writers are exclusive.
pub struct RandomRwFile {
    file: std::fs::File,
    opts: FileOpts,
    lock: CoopRwLock,
}

impl RandomRwFile {
    pub fn open<P: AsRef<Path>>(path: P, opts: FileOpts) -> Result<Self> {
        let mut oo = OpenOptions::new();
        oo.read(true).write(true).create(true);
        if opts.direct {
            oo.custom_flags(libc::O_DIRECT);
        }
        Ok(RandomRwFile {
            file: oo.open(path.as_ref())?,
            opts,
            lock: CoopRwLock::new(),
        })
    }

    pub fn use_direct_io(&self) -> bool {
        self.opts.direct
    }

    pub async fn read(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        let _guard = self.lock.read().await;
        pread_at(self.file.as_raw_fd(), &self.opts, offset, n)
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let _guard = self.lock.write().await;
        debug_assert!(
            !self.opts.direct
                || (self.opts.alignment.aligned_offset(offset)
                    && self.opts.alignment.aligned_buf(data))
        );
        let fd = self.file.as_raw_fd();
        let n = block_in_place(|| pwrite(fd, data, offset as libc::off_t))?;
        Ok(n)
    }

    pub async fn sync(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        block_in_place(|| self.file.sync_all())?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        block_in_place(|| self.file.sync_data())?;
        Ok(())
    }
}
