//! Restore archives into the file system.
//!
//! Every file, directory and symlink is created exclusively. Names which
//! already exist, including names a case insensitive or normalizing file
//! system considers equal to an earlier entry, fail the restore with
//! [`ArchiveError::Collision`] instead of replacing what is there.

use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::path::Path;

use anyhow::{bail, format_err, Context, Error};
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::{mkdirat, Mode};

use crate::config::ArchiveSettings;
use crate::error::ArchiveError;
use crate::sink::{parse_dump, FileSink, Sink};

/// Creates archive entries inside of an open directory.
pub struct DiskSink {
    dir: Dir,
    /// Name the root node gets inside of `dir`. Only set for the top level sink.
    root_name: Option<CString>,
    settings: ArchiveSettings,
}

fn c_name(name: &[u8]) -> Result<CString, Error> {
    CString::new(name).map_err(|_| {
        format_err!(
            "file name {:?} contains a nul byte",
            String::from_utf8_lossy(name)
        )
    })
}

/// `EEXIST` means the exclusive create found something in the way.
fn create_error(err: Errno, kind: &str, name: &CString) -> Error {
    if err == Errno::EEXIST {
        ArchiveError::Collision(format!("{} {:?} already exists", kind, name)).into()
    } else {
        Error::from(err).context(format!("failed to create {} {:?}", kind, name))
    }
}

impl DiskSink {
    /// A sink restoring the archive root to `path`, which must not exist yet.
    pub fn new<P: AsRef<Path>>(path: P, settings: &ArchiveSettings) -> Result<Self, Error> {
        let path = path.as_ref();

        let file_name = match path.file_name() {
            Some(name) => name,
            None => bail!("invalid restore target {:?}", path),
        };

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let dir = Dir::open(
            parent,
            OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .with_context(|| format!("unable to open directory {:?}", parent))?;

        Ok(Self {
            dir,
            root_name: Some(c_name(file_name.as_bytes())?),
            settings: settings.clone(),
        })
    }

    fn target(&self, name: &[u8]) -> Result<CString, Error> {
        if name.is_empty() {
            match &self.root_name {
                Some(root) => Ok(root.clone()),
                None => bail!("empty file name inside of a directory"),
            }
        } else {
            c_name(name)
        }
    }

    fn fd(&self) -> RawFd {
        self.dir.as_raw_fd()
    }

    fn preallocate(&self, file: &File, size: u64) -> Result<(), Error> {
        if !self.settings.preallocate_contents || size == 0 {
            return Ok(());
        }
        preallocate(file.as_raw_fd(), size)
    }
}

#[cfg(target_os = "linux")]
fn preallocate(fd: RawFd, size: u64) -> Result<(), Error> {
    match nix::fcntl::posix_fallocate(fd, 0, size as libc::off_t) {
        Ok(()) => Ok(()),
        // not supported by the file system, the data is written anyway
        Err(err @ (Errno::EINVAL | Errno::EOPNOTSUPP | Errno::ENOSYS)) => {
            log::debug!("ignoring failure to preallocate {} bytes - {}", size, err);
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("preallocating file of {} bytes", size)),
    }
}

#[cfg(not(target_os = "linux"))]
fn preallocate(_fd: RawFd, _size: u64) -> Result<(), Error> {
    Ok(())
}

impl Sink for DiskSink {
    fn create_directory(&mut self, name: &[u8]) -> Result<Box<dyn Sink>, Error> {
        let target = self.target(name)?;

        mkdirat(self.fd(), target.as_c_str(), Mode::from_bits_truncate(0o777))
            .map_err(|err| create_error(err, "directory", &target))?;

        let dir = Dir::openat(
            self.fd(),
            target.as_c_str(),
            OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .with_context(|| format!("unable to open directory {:?}", target))?;

        Ok(Box::new(DiskSink {
            dir,
            root_name: None,
            settings: self.settings.clone(),
        }))
    }

    fn create_file(
        &mut self,
        name: &[u8],
        size: u64,
        executable: bool,
    ) -> Result<Box<dyn FileSink>, Error> {
        let target = self.target(name)?;

        let fd = nix::fcntl::openat(
            self.fd(),
            target.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|err| create_error(err, "file", &target))?;
        let file = unsafe { File::from_raw_fd(fd) };

        if executable {
            let stat = nix::sys::stat::fstat(file.as_raw_fd())
                .with_context(|| format!("fstat of {:?} failed", target))?;
            let mode = Mode::from_bits_truncate(stat.st_mode)
                | Mode::S_IXUSR
                | Mode::S_IXGRP
                | Mode::S_IXOTH;
            nix::sys::stat::fchmod(file.as_raw_fd(), mode)
                .with_context(|| format!("fchmod of {:?} failed", target))?;
        }

        self.preallocate(&file, size)?;

        Ok(Box::new(DiskFile {
            file,
            name: target,
            size,
            written: 0,
        }))
    }

    fn create_symlink(&mut self, name: &[u8], target: &[u8]) -> Result<(), Error> {
        let link_name = self.target(name)?;
        let target = c_name(target)?;

        nix::unistd::symlinkat(target.as_c_str(), Some(self.fd()), link_name.as_c_str())
            .map_err(|err| create_error(err, "symlink", &link_name))
    }
}

struct DiskFile {
    file: File,
    name: CString,
    size: u64,
    written: u64,
}

impl FileSink for DiskFile {
    fn receive(&mut self, data: &[u8]) -> Result<(), Error> {
        self.file
            .write_all(data)
            .with_context(|| format!("failed to write {:?}", self.name))?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        let this = *self;
        if this.written != this.size {
            bail!(
                "restored {} bytes of a file of {} bytes",
                this.written,
                this.size
            );
        }
        // dropping a File ignores errors reported by close(2)
        nix::unistd::close(this.file.into_raw_fd())
            .with_context(|| format!("failed to close {:?}", this.name))
    }
}

/// Restore the archive read from `input` to `path`, which must not exist yet.
pub fn restore_path<P: AsRef<Path>, R: Read>(
    path: P,
    input: R,
    settings: &ArchiveSettings,
) -> Result<(), Error> {
    let path = path.as_ref();
    let mut sink = DiskSink::new(path, settings)?;
    parse_dump(&mut sink, input, settings)
        .with_context(|| format!("failed to restore archive to {:?}", path))
}
