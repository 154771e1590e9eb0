//! Sandbox state for one machine.
//!
//! A [`Container`] holds the directories the guest may open files under and
//! the table of guest file descriptors. Only `open` consults the allow-list;
//! a descriptor, once handed out, is trusted by every later call.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::Result;

/// Guest descriptors are always below this value, which keeps them clear
/// of the failure sentinel.
pub const MAX_DESCRIPTORS: u64 = 65536;

const FIRST_DESCRIPTOR: u64 = 3;

/// Host side of a guest descriptor.
pub(crate) enum HostFile {
    Stdin,
    Output { fd: RawFd, sink: Box<dyn Write + Send> },
    File(File),
}

impl HostFile {
    fn stdout() -> Self {
        HostFile::Output {
            fd: libc::STDOUT_FILENO,
            sink: Box::new(io::stdout()),
        }
    }

    fn stderr() -> Self {
        HostFile::Output {
            fd: libc::STDERR_FILENO,
            sink: Box::new(io::stderr()),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        match self {
            HostFile::Stdin => libc::STDIN_FILENO,
            HostFile::Output { fd, .. } => *fd,
            HostFile::File(file) => file.as_raw_fd(),
        }
    }

    pub(crate) fn as_file(&self) -> Option<&File> {
        match self {
            HostFile::File(file) => Some(file),
            _ => None,
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            HostFile::Stdin => io::stdin().read(buf),
            HostFile::Output { .. } => Err(io::Error::from_raw_os_error(libc::EBADF)),
            HostFile::File(file) => file.read(buf),
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            HostFile::Stdin => Err(io::Error::from_raw_os_error(libc::EBADF)),
            HostFile::Output { sink, .. } => {
                sink.write_all(data)?;
                sink.flush()?;
                Ok(data.len())
            }
            HostFile::File(file) => file.write(data),
        }
    }

    pub(crate) fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            HostFile::File(file) => file.seek(pos),
            _ => Err(io::Error::from_raw_os_error(libc::ESPIPE)),
        }
    }
}

/// Guest descriptor table.
///
/// Descriptors are handed out in increasing order and never reused.
pub(crate) struct FdTable {
    files: HashMap<u64, HostFile>,
    next: u64,
}

impl FdTable {
    fn new() -> Self {
        let mut files = HashMap::new();
        files.insert(0, HostFile::Stdin);
        files.insert(1, HostFile::stdout());
        files.insert(2, HostFile::stderr());
        Self {
            files,
            next: FIRST_DESCRIPTOR,
        }
    }

    /// Record `file` under a fresh descriptor, or `None` once the
    /// descriptor space is used up.
    pub(crate) fn insert(&mut self, file: HostFile) -> Option<u64> {
        if self.next >= MAX_DESCRIPTORS {
            return None;
        }
        let fd = self.next;
        self.next += 1;
        self.files.insert(fd, file);
        Some(fd)
    }

    pub(crate) fn get_mut(&mut self, fd: u64) -> Option<&mut HostFile> {
        self.files.get_mut(&fd)
    }

    pub(crate) fn remove(&mut self, fd: u64) -> Option<HostFile> {
        self.files.remove(&fd)
    }

    pub(crate) fn len(&self) -> usize {
        self.files.len()
    }
}

/// Filesystem sandbox and descriptor table shared by all VCPUs.
pub struct Container {
    dirs: Option<Vec<PathBuf>>,
    table: Mutex<FdTable>,
}

impl Container {
    /// A sandbox that only allows opens under `dirs`.
    pub fn new<I, P>(dirs: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let dirs = dirs
            .into_iter()
            .map(|dir| Self::resolve(dir.as_ref()))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            dirs: Some(dirs),
            table: Mutex::new(FdTable::new()),
        })
    }

    /// A sandbox that allows every path.
    pub fn unrestricted() -> Self {
        Self {
            dirs: None,
            table: Mutex::new(FdTable::new()),
        }
    }

    /// Send guest writes to descriptor 1 into `sink` instead of stdout.
    pub fn with_stdout(self, sink: impl Write + Send + 'static) -> Self {
        self.bind_output(1, libc::STDOUT_FILENO, Box::new(sink))
    }

    /// Send guest writes to descriptor 2 into `sink` instead of stderr.
    pub fn with_stderr(self, sink: impl Write + Send + 'static) -> Self {
        self.bind_output(2, libc::STDERR_FILENO, Box::new(sink))
    }

    fn bind_output(mut self, guest_fd: u64, fd: RawFd, sink: Box<dyn Write + Send>) -> Self {
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        table.files.insert(guest_fd, HostFile::Output { fd, sink });
        self
    }

    /// Allow-listed directories, or `None` when unrestricted.
    pub fn dirs(&self) -> Option<&[PathBuf]> {
        self.dirs.as_deref()
    }

    /// Whether a resolved path lies under one of the allowed directories.
    pub fn is_allowed(&self, path: &Path) -> bool {
        match &self.dirs {
            None => true,
            Some(dirs) => dirs.iter().any(|dir| path.starts_with(dir)),
        }
    }

    /// Make `path` absolute, fold `.` and `..`, and resolve symlinks.
    ///
    /// A path that does not exist yet resolves through its parent. If the
    /// parent is missing too, the lexically normalized path is returned.
    pub fn resolve(path: &Path) -> io::Result<PathBuf> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let normal = normalize(&absolute);
        if let Ok(real) = normal.canonicalize() {
            return Ok(real);
        }
        if let (Some(parent), Some(name)) = (normal.parent(), normal.file_name()) {
            if let Ok(real) = parent.canonicalize() {
                return Ok(real.join(name));
            }
        }
        Ok(normal)
    }

    /// Number of open guest descriptors, standard streams included.
    pub fn open_descriptors(&self) -> usize {
        self.table().len()
    }

    pub(crate) fn table(&self) -> MutexGuard<'_, FdTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Remove `.` and resolve `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
