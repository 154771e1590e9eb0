//! Hypercall handlers.
//!
//! Each handler either returns a value for the guest or fails; failures
//! reach the guest as [`FAILURE`] and are only logged on the host. Guest
//! pointers are always resolved through a [`GuestView`].

use std::convert::TryFrom;
use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::io::{self, Read, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};
use vmm_sys_util::errno;

use super::abi::{Hypercall, HypercallArgs, Outcome, FAILURE, MAX_PATH, MAX_TRANSFER};
use super::container::{Container, HostFile};
use crate::error::{Error, Result};
use crate::translate::GuestView;

fn host_error(e: errno::Error) -> Error {
    Error::Io(io::Error::from_raw_os_error(e.errno()))
}

fn os_error(code: i32) -> Error {
    host_error(errno::Error::new(code))
}

fn bad_fd() -> Error {
    os_error(libc::EBADF)
}

/// Clamp a guest length to what one call transfers.
fn transfer_len(len: u64) -> usize {
    len.min(MAX_TRANSFER as u64) as usize
}

/// Translate guest `open(2)` flags and mode into host open options.
fn open_options(flags: i32, mode: u32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    // Creation and status flags pass through untouched.
    options.custom_flags(flags & !libc::O_ACCMODE);
    if flags & libc::O_CREAT != 0 {
        options.mode(mode);
    }
    options
}

impl Container {
    /// Service one hypercall.
    ///
    /// Returns an error only for calls the guest ABI does not define.
    pub fn dispatch(&self, call: &HypercallArgs, guest: &GuestView<'_>) -> Result<Outcome> {
        let nr = Hypercall::try_from(call.nr)
            .map_err(|nr| Error::UnknownHypercall { nr, pc: call.pc })?;
        let [a0, a1, a2, ..] = call.args;

        let result = match nr {
            Hypercall::Exit => {
                debug!(code = a0, "guest exit");
                return Ok(Outcome::Exit(a0));
            }
            Hypercall::Write => self.write(a0, a1, a2, guest),
            Hypercall::Open => self.open(a0, a1 as i32, a2 as u32, guest),
            Hypercall::Read => self.read(a0, a1, a2, guest),
            Hypercall::Close => self.close(a0),
            Hypercall::Lseek => self.lseek(a0, a1, a2),
            Hypercall::Time => self.time(a0, a1, guest),
            Hypercall::Fstat => self.fstat(a0, a1, guest),
            Hypercall::Getdents64 => self.getdents64(a0, a1, a2, guest),
        };

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                debug!(call = %nr, args = ?&call.args[..3], error = %e, "hypercall failed");
                FAILURE
            }
        };
        Ok(Outcome::Return(value))
    }

    fn write(&self, fd: u64, ptr: u64, len: u64, guest: &GuestView<'_>) -> Result<u64> {
        let mut table = self.table();
        let file = table.get_mut(fd).ok_or_else(bad_fd)?;
        let mut buf = vec![0u8; transfer_len(len)];
        guest.read(ptr, &mut buf)?;
        Ok(file.write(&buf)? as u64)
    }

    fn read(&self, fd: u64, ptr: u64, len: u64, guest: &GuestView<'_>) -> Result<u64> {
        let mut buf = vec![0u8; transfer_len(len)];
        // Nothing is consumed from the host file unless the guest can take it.
        guest.check_writable(ptr, buf.len())?;

        let n = match self.table().get_mut(fd).ok_or_else(bad_fd)? {
            HostFile::Stdin => None,
            file => Some(file.read(&mut buf)?),
        };
        // Stdin may block; other VCPUs keep using the table meanwhile.
        let n = match n {
            Some(n) => n,
            None => io::stdin().read(&mut buf)?,
        };
        guest.write(ptr, &buf[..n])?;
        Ok(n as u64)
    }

    fn open(&self, path_ptr: u64, mut flags: i32, mode: u32, guest: &GuestView<'_>) -> Result<u64> {
        let raw = guest.read_cstr(path_ptr, MAX_PATH)?;
        let path = Container::resolve(Path::new(OsStr::from_bytes(&raw)))?;
        if !self.is_allowed(&path) {
            warn!(path = %path.display(), "blocked access");
            return Err(os_error(libc::EACCES));
        }
        // A resolved path only ends in a symlink when the link dangles;
        // following it would let O_CREAT land outside the sandbox.
        if self.dirs().is_some() {
            flags |= libc::O_NOFOLLOW;
        }

        let file = open_options(flags, mode).open(&path)?;
        let fd = self
            .table()
            .insert(HostFile::File(file))
            .ok_or_else(|| os_error(libc::EMFILE))?;
        debug!(fd, path = %path.display(), flags, "opened");
        Ok(fd)
    }

    fn close(&self, fd: u64) -> Result<u64> {
        self.table().remove(fd).ok_or_else(bad_fd)?;
        Ok(0)
    }

    fn lseek(&self, fd: u64, offset: u64, whence: u64) -> Result<u64> {
        let pos = match whence as i32 {
            libc::SEEK_SET => SeekFrom::Start(offset),
            libc::SEEK_CUR => SeekFrom::Current(offset as i64),
            libc::SEEK_END => SeekFrom::End(offset as i64),
            _ => return Err(os_error(libc::EINVAL)),
        };
        let mut table = self.table();
        let file = table.get_mut(fd).ok_or_else(bad_fd)?;
        Ok(file.seek(pos)?)
    }

    /// Store seconds and nanoseconds since the epoch as two 64-bit values.
    fn time(&self, sec_ptr: u64, nsec_ptr: u64, guest: &GuestView<'_>) -> Result<u64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| os_error(libc::EINVAL))?;
        if sec_ptr != 0 {
            guest.write(sec_ptr, &now.as_secs().to_ne_bytes())?;
        }
        if nsec_ptr != 0 {
            guest.write(nsec_ptr, &(now.subsec_nanos() as u64).to_ne_bytes())?;
        }
        Ok(0)
    }

    /// Copy the host `struct stat` verbatim; guest and host share an ABI.
    fn fstat(&self, fd: u64, ptr: u64, guest: &GuestView<'_>) -> Result<u64> {
        let mut table = self.table();
        let file = table.get_mut(fd).ok_or_else(bad_fd)?;

        let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
        // Safety: st is a valid, writable stat buffer.
        if unsafe { libc::fstat(file.raw_fd(), st.as_mut_ptr()) } != 0 {
            return Err(host_error(errno::Error::last()));
        }
        // Safety: zero-initialized and filled in by fstat; stat is plain data.
        let bytes = unsafe {
            std::slice::from_raw_parts(st.as_ptr() as *const u8, std::mem::size_of::<libc::stat>())
        };
        guest.write(ptr, bytes)?;
        Ok(0)
    }

    /// Copy raw `linux_dirent64` records for a directory descriptor.
    fn getdents64(&self, fd: u64, ptr: u64, count: u64, guest: &GuestView<'_>) -> Result<u64> {
        let mut table = self.table();
        let dir = table
            .get_mut(fd)
            .and_then(|f| f.as_file())
            .ok_or_else(bad_fd)?;

        let mut buf = vec![0u8; transfer_len(count)];
        // Safety: buf is writable for buf.len() bytes.
        let n = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                dir.as_raw_fd(),
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
        if n < 0 {
            return Err(host_error(errno::Error::last()));
        }
        let n = n as usize;
        guest.write(ptr, &buf[..n])?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestMemory;
    use crate::translate::IdentityTranslator;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    const BUF: u64 = 0x10_0000;
    const PATH: u64 = 0x10_8000;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn memory() -> GuestMemory {
        let mut mem = GuestMemory::new();
        mem.add_region(BUF, 0x1_0000, false).unwrap();
        mem
    }

    fn call(container: &Container, mem: &GuestMemory, nr: Hypercall, args: &[u64]) -> u64 {
        let mut regs = [0u64; 6];
        regs[..args.len()].copy_from_slice(args);
        let view = GuestView::new(mem, &IdentityTranslator);
        let args = HypercallArgs {
            nr: nr as u64,
            args: regs,
            pc: 0x4000_8000,
        };
        match container.dispatch(&args, &view).unwrap() {
            Outcome::Return(v) => v,
            Outcome::Exit(code) => panic!("unexpected exit {}", code),
        }
    }

    fn put_path(mem: &GuestMemory, path: &Path) {
        let mut bytes = path.as_os_str().as_bytes().to_vec();
        bytes.push(0);
        mem.write(PATH, &bytes).unwrap();
    }

    #[test]
    fn test_write_stdout() {
        let out = Captured::default();
        let container = Container::unrestricted().with_stdout(out.clone());
        let mem = memory();
        mem.write(BUF, b"hello\nworld").unwrap();

        assert_eq!(call(&container, &mem, Hypercall::Write, &[1, BUF, 6]), 6);
        assert_eq!(out.0.lock().unwrap().as_slice(), b"hello\n");
    }

    #[test]
    fn test_write_unknown_fd() {
        let container = Container::unrestricted();
        let mem = memory();
        assert_eq!(call(&container, &mem, Hypercall::Write, &[99, BUF, 4]), FAILURE);
    }

    #[test]
    fn test_write_bad_pointer() {
        let out = Captured::default();
        let container = Container::unrestricted().with_stdout(out.clone());
        let mem = memory();
        assert_eq!(call(&container, &mem, Hypercall::Write, &[1, 0x9000_0000, 4]), FAILURE);
        assert!(out.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_open_read_close() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, b"sandboxed").unwrap();

        let container = Container::new([dir.path()]).unwrap();
        let mem = memory();
        put_path(&mem, &file);

        let fd = call(&container, &mem, Hypercall::Open, &[PATH, libc::O_RDONLY as u64, 0]);
        assert_eq!(fd, 3);
        let fd2 = call(&container, &mem, Hypercall::Open, &[PATH, libc::O_RDONLY as u64, 0]);
        assert!(fd2 > fd);

        assert_eq!(call(&container, &mem, Hypercall::Read, &[fd, BUF, 64]), 9);
        let mut buf = [0u8; 9];
        mem.read(BUF, &mut buf).unwrap();
        assert_eq!(&buf, b"sandboxed");

        // End of file is not a failure.
        assert_eq!(call(&container, &mem, Hypercall::Read, &[fd, BUF, 64]), 0);

        assert_eq!(call(&container, &mem, Hypercall::Close, &[fd]), 0);
        assert_eq!(call(&container, &mem, Hypercall::Read, &[fd, BUF, 64]), FAILURE);
        assert_eq!(call(&container, &mem, Hypercall::Close, &[fd]), FAILURE);

        // Descriptors are not recycled.
        let fd3 = call(&container, &mem, Hypercall::Open, &[PATH, libc::O_RDONLY as u64, 0]);
        assert!(fd3 > fd2);
    }

    #[test]
    fn test_open_blocked() {
        let allowed = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let container = Container::new([allowed.path()]).unwrap();
        let mem = memory();

        put_path(&mem, Path::new("/etc/passwd"));
        assert_eq!(
            call(&container, &mem, Hypercall::Open, &[PATH, libc::O_RDONLY as u64, 0]),
            FAILURE
        );

        let target = outside.path().join("created");
        put_path(&mem, &target);
        let flags = (libc::O_WRONLY | libc::O_CREAT) as u64;
        assert_eq!(call(&container, &mem, Hypercall::Open, &[PATH, flags, 0o644]), FAILURE);
        assert!(!target.exists());

        let escape = allowed.path().join("..").join(outside.path().file_name().unwrap()).join("x");
        put_path(&mem, &escape);
        assert_eq!(call(&container, &mem, Hypercall::Open, &[PATH, flags, 0o644]), FAILURE);
        assert_eq!(container.open_descriptors(), 3);
    }

    #[test]
    fn test_open_dangling_symlink() {
        let allowed = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("escaped");
        let link = allowed.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let container = Container::new([allowed.path()]).unwrap();
        let mem = memory();
        put_path(&mem, &link);

        let flags = (libc::O_WRONLY | libc::O_CREAT) as u64;
        assert_eq!(call(&container, &mem, Hypercall::Open, &[PATH, flags, 0o644]), FAILURE);
        assert!(!target.exists());
        assert_eq!(container.open_descriptors(), 3);

        // Links that resolve inside the sandbox still open.
        let inner = allowed.path().join("inner");
        std::fs::write(&inner, b"ok").unwrap();
        let good = allowed.path().join("good");
        std::os::unix::fs::symlink(&inner, &good).unwrap();
        put_path(&mem, &good);
        let fd = call(&container, &mem, Hypercall::Open, &[PATH, libc::O_RDONLY as u64, 0]);
        assert_eq!(fd, 3);
    }

    #[test]
    fn test_read_bad_pointer_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, b"kept").unwrap();
        let container = Container::new([dir.path()]).unwrap();
        let mem = memory();
        put_path(&mem, &file);

        let fd = call(&container, &mem, Hypercall::Open, &[PATH, libc::O_RDONLY as u64, 0]);
        assert_eq!(call(&container, &mem, Hypercall::Read, &[fd, 0x9000_0000, 4]), FAILURE);
        // Straddles the end of guest memory.
        assert_eq!(call(&container, &mem, Hypercall::Read, &[fd, BUF + 0xfffe, 4]), FAILURE);

        assert_eq!(call(&container, &mem, Hypercall::Read, &[fd, BUF, 4]), 4);
        let mut buf = [0u8; 4];
        mem.read(BUF, &mut buf).unwrap();
        assert_eq!(&buf, b"kept");
    }

    #[test]
    fn test_create_write_seek() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let container = Container::new([dir.path()]).unwrap();
        let mem = memory();
        put_path(&mem, &target);

        let flags = (libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC) as u64;
        let fd = call(&container, &mem, Hypercall::Open, &[PATH, flags, 0o600]);
        assert!(fd >= 3 && fd != FAILURE);

        mem.write(BUF, b"0123456789").unwrap();
        assert_eq!(call(&container, &mem, Hypercall::Write, &[fd, BUF, 10]), 10);
        assert_eq!(
            call(&container, &mem, Hypercall::Lseek, &[fd, 4, libc::SEEK_SET as u64]),
            4
        );
        assert_eq!(call(&container, &mem, Hypercall::Read, &[fd, BUF + 0x100, 3]), 3);
        let mut buf = [0u8; 3];
        mem.read(BUF + 0x100, &mut buf).unwrap();
        assert_eq!(&buf, b"456");

        assert_eq!(
            call(&container, &mem, Hypercall::Lseek, &[fd, 0, libc::SEEK_END as u64]),
            10
        );
        assert_eq!(call(&container, &mem, Hypercall::Lseek, &[fd, 0, 7]), FAILURE);
        assert_eq!(std::fs::read(&target).unwrap(), b"0123456789");
    }

    #[test]
    fn test_fstat() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sized");
        std::fs::write(&file, vec![7u8; 1234]).unwrap();
        let container = Container::new([dir.path()]).unwrap();
        let mem = memory();
        put_path(&mem, &file);

        let fd = call(&container, &mem, Hypercall::Open, &[PATH, libc::O_RDONLY as u64, 0]);
        assert_eq!(call(&container, &mem, Hypercall::Fstat, &[fd, BUF]), 0);
        let st: libc::stat = mem.read_obj(BUF).unwrap();
        assert_eq!(st.st_size, 1234);
        assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFREG);

        assert_eq!(call(&container, &mem, Hypercall::Fstat, &[77, BUF]), FAILURE);
    }

    #[test]
    fn test_getdents64() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("needle"), b"").unwrap();
        let container = Container::new([dir.path()]).unwrap();
        let mem = memory();
        put_path(&mem, dir.path());

        let flags = (libc::O_RDONLY | libc::O_DIRECTORY) as u64;
        let fd = call(&container, &mem, Hypercall::Open, &[PATH, flags, 0]);
        let n = call(&container, &mem, Hypercall::Getdents64, &[fd, BUF, 4096]);
        assert!(n > 0 && n != FAILURE);

        let mut buf = vec![0u8; n as usize];
        mem.read(BUF, &mut buf).unwrap();
        assert!(buf.windows(6).any(|w| w == b"needle"));

        // Standard streams are not directories.
        assert_eq!(call(&container, &mem, Hypercall::Getdents64, &[1, BUF, 4096]), FAILURE);
    }

    #[test]
    fn test_time() {
        let container = Container::unrestricted();
        let mem = memory();
        assert_eq!(call(&container, &mem, Hypercall::Time, &[BUF, BUF + 8]), 0);
        let sec: u64 = mem.read_obj(BUF).unwrap();
        let nsec: u64 = mem.read_obj(BUF + 8).unwrap();
        assert!(sec > 1_600_000_000);
        assert!(nsec < 1_000_000_000);
    }

    #[test]
    fn test_exit() {
        let container = Container::unrestricted();
        let mem = memory();
        let view = GuestView::new(&mem, &IdentityTranslator);
        let args = HypercallArgs {
            nr: Hypercall::Exit as u64,
            args: [3, 0, 0, 0, 0, 0],
            pc: 0,
        };
        assert_eq!(container.dispatch(&args, &view).unwrap(), Outcome::Exit(3));
    }

    #[test]
    fn test_unknown_call() {
        let container = Container::unrestricted();
        let mem = memory();
        let view = GuestView::new(&mem, &IdentityTranslator);
        let args = HypercallArgs {
            nr: 42,
            args: [0; 6],
            pc: 0x4000_8010,
        };
        match container.dispatch(&args, &view) {
            Err(Error::UnknownHypercall { nr, pc }) => {
                assert_eq!(nr, 42);
                assert_eq!(pc, 0x4000_8010);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
