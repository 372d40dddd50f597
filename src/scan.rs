//! File system scanner.
//!
//! Turns a path into an [`Entry`] tree for the serializer. Directory listings
//! are read, stripped of the case hack suffix if enabled and sorted by name
//! before they are handed out.
//!
//! There are two modes:
//!  * [`dump_path`] and [`scan_path`] are lazy: nothing below the root is
//!    looked at until the serializer asks for it.
//!  * [`prepare_dump`] applies a path filter once and keeps a snapshot of the
//!    tree's structure. File contents are still only read while dumping, and
//!    the snapshot can be dumped repeatedly.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::File as StdFile;
use std::io::{self, Read};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use bytes::Bytes;
use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::{FileStat, Mode};

use crate::case_hack;
use crate::config::ArchiveSettings;
use crate::dump::Dump;
use crate::entry::{Directory, Entry, File, Symlink};
use crate::error::ArchiveError;
use crate::format::CONTENT_BLOCK_SIZE;
use crate::task::{check_abort, AbortHandle};

/// Highest modification time seen while scanning.
///
/// Lazy scans update the value while the dump is consumed, so it is only
/// final once the whole dump was read.
#[derive(Clone, Debug)]
pub struct MaxMtime(Arc<AtomicI64>);

impl MaxMtime {
    fn new() -> Self {
        Self(Arc::new(AtomicI64::new(i64::MIN)))
    }

    fn update(&self, mtime: i64) {
        self.0.fetch_max(mtime, Ordering::AcqRel);
    }

    /// Seconds since the epoch, `i64::MIN` if nothing was scanned yet.
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    File { executable: bool, size: u64 },
    Symlink,
    Directory,
}

fn stat_path(path: &Path) -> Result<(Kind, FileStat), Error> {
    let stat = nix::sys::stat::lstat(path).with_context(|| format!("failed to stat {:?}", path))?;
    let kind = match stat.st_mode & libc::S_IFMT {
        libc::S_IFREG => Kind::File {
            executable: stat.st_mode & libc::S_IXUSR != 0,
            size: stat.st_size as u64,
        },
        libc::S_IFLNK => Kind::Symlink,
        libc::S_IFDIR => Kind::Directory,
        _ => bail!("file {:?} has an unsupported type", path),
    };
    Ok((kind, stat))
}

fn read_link(path: &Path) -> Result<Vec<u8>, Error> {
    let target = nix::fcntl::readlink(path)
        .with_context(|| format!("failed to read symlink {:?}", path))?;
    Ok(target.into_vec())
}

/// Read a directory, returning archive names mapped to on-disk names.
fn list_directory(path: &Path, use_case_hack: bool) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, Error> {
    let mut dir = Dir::open(
        path,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("failed to open directory {:?}", path))?;

    let mut names = BTreeMap::new();
    for entry in dir.iter() {
        let entry = entry.with_context(|| format!("failed to read directory {:?}", path))?;
        let disk_name = entry.file_name().to_bytes();
        if disk_name == b"." || disk_name == b".." {
            continue;
        }

        let name = match case_hack::strip_suffix(disk_name) {
            Some(stripped) if use_case_hack => {
                log::debug!(
                    "removing case hack suffix from {:?}",
                    path.join(OsStr::from_bytes(disk_name))
                );
                stripped
            }
            _ => disk_name,
        };

        match names.entry(name.to_vec()) {
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(disk_name.to_vec());
            }
            btree_map::Entry::Occupied(occupied) => {
                return Err(ArchiveError::Collision(format!(
                    "file name collision in between {:?} and {:?}",
                    path.join(OsStr::from_bytes(occupied.get())),
                    path.join(OsStr::from_bytes(disk_name)),
                ))
                .into());
            }
        }
    }

    Ok(names)
}

/// Lazily read contents of a file, which must still have the scanned size.
struct FileContents {
    path: PathBuf,
    file: Option<StdFile>,
    left: u64,
    abort: Option<AbortHandle>,
    done: bool,
}

impl FileContents {
    fn new(path: PathBuf, size: u64, abort: Option<AbortHandle>) -> Self {
        Self {
            path,
            file: None,
            left: size,
            abort,
            done: false,
        }
    }

    fn next_block(&mut self) -> Result<Option<Bytes>, Error> {
        check_abort(&self.abort)?;

        if self.file.is_none() {
            let file = StdFile::open(&self.path)
                .with_context(|| format!("failed to open {:?}", self.path))?;
            self.file = Some(file);
        }
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(None),
        };

        if self.left == 0 {
            let mut probe = [0u8; 1];
            let got = file
                .read(&mut probe)
                .with_context(|| format!("failed to read {:?}", self.path))?;
            if got != 0 {
                bail!("file {:?} grew while dumping", self.path);
            }
            return Ok(None);
        }

        let len = self.left.min(CONTENT_BLOCK_SIZE as u64) as usize;
        let mut data = vec![0u8; len];
        match file.read_exact(&mut data) {
            Ok(()) => (),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                bail!("file {:?} shrank while dumping", self.path)
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {:?}", self.path));
            }
        }
        self.left -= len as u64;
        Ok(Some(Bytes::from(data)))
    }
}

impl Iterator for FileContents {
    type Item = Result<Bytes, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let res = self.next_block();
        if !matches!(res, Ok(Some(_))) {
            self.done = true;
        }
        res.transpose()
    }
}

#[derive(Clone)]
struct Scanner {
    use_case_hack: bool,
    mtime: MaxMtime,
    abort: Option<AbortHandle>,
}

impl Scanner {
    fn entry(&self, path: PathBuf) -> Result<Entry, Error> {
        check_abort(&self.abort)?;

        let (kind, stat) = stat_path(&path)?;
        self.mtime.update(i64::from(stat.st_mtime));

        Ok(match kind {
            Kind::File { executable, size } => Entry::File(File {
                executable,
                size,
                contents: Box::new(FileContents::new(path, size, self.abort.clone())),
            }),
            Kind::Symlink => Entry::Symlink(Symlink {
                target: read_link(&path)?,
            }),
            Kind::Directory => Entry::Directory(Directory {
                entries: Box::new(LazyDirectory {
                    scanner: self.clone(),
                    path,
                    names: None,
                    done: false,
                }),
            }),
        })
    }
}

/// Directory listing which is read on first access.
struct LazyDirectory {
    scanner: Scanner,
    path: PathBuf,
    names: Option<btree_map::IntoIter<Vec<u8>, Vec<u8>>>,
    done: bool,
}

impl LazyDirectory {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Entry)>, Error> {
        if self.names.is_none() {
            let names = list_directory(&self.path, self.scanner.use_case_hack)?;
            self.names = Some(names.into_iter());
        }

        let (name, disk_name) = match self.names.as_mut().and_then(Iterator::next) {
            Some(next) => next,
            None => return Ok(None),
        };

        let entry = self
            .scanner
            .entry(self.path.join(OsStr::from_bytes(&disk_name)))?;
        Ok(Some((name, entry)))
    }
}

impl Iterator for LazyDirectory {
    type Item = Result<(Vec<u8>, Entry), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let res = self.next_entry();
        if !matches!(res, Ok(Some(_))) {
            self.done = true;
        }
        res.transpose()
    }
}

/// Lazily scan `path`. The returned [`MaxMtime`] is updated while the tree is
/// consumed.
pub fn scan_path<P: AsRef<Path>>(
    path: P,
    settings: &ArchiveSettings,
    abort: Option<AbortHandle>,
) -> Result<(Entry, MaxMtime), Error> {
    let scanner = Scanner {
        use_case_hack: settings.use_case_hack,
        mtime: MaxMtime::new(),
        abort,
    };
    let entry = scanner.entry(path.as_ref().to_path_buf())?;
    Ok((entry, scanner.mtime))
}

/// Serialize everything below `path`.
pub fn dump_path<P: AsRef<Path>>(path: P, settings: &ArchiveSettings) -> Result<Dump, Error> {
    let (entry, _) = scan_path(path, settings, None)?;
    Ok(crate::dump::dump(entry))
}

/// Like [`dump_path`], also tracking the highest modification time in the tree.
pub fn dump_path_and_get_mtime<P: AsRef<Path>>(
    path: P,
    settings: &ArchiveSettings,
) -> Result<(Dump, MaxMtime), Error> {
    let (entry, mtime) = scan_path(path, settings, None)?;
    Ok((crate::dump::dump(entry), mtime))
}

#[derive(Debug)]
enum Snapshot {
    File { executable: bool, size: u64 },
    Symlink { target: Vec<u8> },
    Directory(Arc<Vec<SnapshotEntry>>),
}

#[derive(Debug)]
struct SnapshotEntry {
    name: Vec<u8>,
    disk_name: Vec<u8>,
    node: Snapshot,
}

/// A filtered tree whose structure was captured up front.
pub struct PreparedDump {
    path: PathBuf,
    root: Snapshot,
    max_mtime: i64,
    abort: Option<AbortHandle>,
}

/// Scan `path`, keeping only entries for which `filter` returns `true`.
///
/// The filter sees the path of each entry below `path` with the case hack
/// suffix removed. Excluded directories are not descended into. The root is
/// always included.
pub fn prepare_dump<P, F>(
    path: P,
    settings: &ArchiveSettings,
    mut filter: F,
) -> Result<PreparedDump, Error>
where
    P: AsRef<Path>,
    F: FnMut(&Path) -> bool,
{
    let path = path.as_ref().to_path_buf();
    let mut max_mtime = i64::MIN;
    let root = snapshot(&path, &path, settings.use_case_hack, &mut filter, &mut max_mtime)?;
    Ok(PreparedDump {
        path,
        root,
        max_mtime,
        abort: None,
    })
}

fn snapshot<F>(
    disk_path: &Path,
    filter_path: &Path,
    use_case_hack: bool,
    filter: &mut F,
    max_mtime: &mut i64,
) -> Result<Snapshot, Error>
where
    F: FnMut(&Path) -> bool,
{
    let (kind, stat) = stat_path(disk_path)?;
    *max_mtime = (*max_mtime).max(i64::from(stat.st_mtime));

    Ok(match kind {
        Kind::File { executable, size } => Snapshot::File { executable, size },
        Kind::Symlink => Snapshot::Symlink {
            target: read_link(disk_path)?,
        },
        Kind::Directory => {
            let mut entries = Vec::new();
            for (name, disk_name) in list_directory(disk_path, use_case_hack)? {
                let child_filter_path = filter_path.join(OsStr::from_bytes(&name));
                if !filter(&child_filter_path) {
                    continue;
                }
                let child_disk_path = disk_path.join(OsStr::from_bytes(&disk_name));
                let node = snapshot(
                    &child_disk_path,
                    &child_filter_path,
                    use_case_hack,
                    filter,
                    max_mtime,
                )?;
                entries.push(SnapshotEntry {
                    name,
                    disk_name,
                    node,
                });
            }
            Snapshot::Directory(Arc::new(entries))
        }
    })
}

impl PreparedDump {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest modification time of the included entries at scan time.
    pub fn max_mtime(&self) -> i64 {
        self.max_mtime
    }

    pub fn set_abort(&mut self, abort: AbortHandle) {
        self.abort = Some(abort);
    }

    /// The tree as an entry. File contents are read from disk on demand.
    pub fn entry(&self) -> Entry {
        snapshot_entry(&self.root, self.path.clone(), &self.abort)
    }

    /// Serialize the snapshot. May be called any number of times.
    pub fn dump(&self) -> Dump {
        crate::dump::dump(self.entry())
    }

    /// On-disk path of an archive path inside of the snapshot.
    pub fn disk_path(&self, archive_path: &str) -> Result<PathBuf, Error> {
        let mut node = &self.root;
        let mut path = self.path.clone();
        for component in archive_path.split('/').filter(|c| !c.is_empty()) {
            let entries = match node {
                Snapshot::Directory(entries) => entries,
                _ => bail!("{:?} is not a directory", path),
            };
            let entry = entries
                .iter()
                .find(|entry| entry.name == component.as_bytes())
                .ok_or_else(|| format_err!("{:?} not found in prepared dump", archive_path))?;
            path.push(OsStr::from_bytes(&entry.disk_name));
            node = &entry.node;
        }
        Ok(path)
    }
}

fn snapshot_entry(node: &Snapshot, path: PathBuf, abort: &Option<AbortHandle>) -> Entry {
    match node {
        Snapshot::File { executable, size } => Entry::File(File {
            executable: *executable,
            size: *size,
            contents: Box::new(FileContents::new(path, *size, abort.clone())),
        }),
        Snapshot::Symlink { target } => Entry::symlink(target.clone()),
        Snapshot::Directory(entries) => Entry::Directory(Directory {
            entries: Box::new(SnapshotDirectory {
                path,
                entries: Arc::clone(entries),
                pos: 0,
                abort: abort.clone(),
            }),
        }),
    }
}

struct SnapshotDirectory {
    path: PathBuf,
    entries: Arc<Vec<SnapshotEntry>>,
    pos: usize,
    abort: Option<AbortHandle>,
}

impl Iterator for SnapshotDirectory {
    type Item = Result<(Vec<u8>, Entry), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.pos)?;
        if let Err(err) = check_abort(&self.abort) {
            self.pos = self.entries.len();
            return Some(Err(err.into()));
        }
        self.pos += 1;

        let path = self.path.join(OsStr::from_bytes(&entry.disk_name));
        Some(Ok((
            entry.name.clone(),
            snapshot_entry(&entry.node, path, &self.abort),
        )))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::os::unix::fs::{symlink, PermissionsExt};

    use crate::decoder::Decoder;
    use crate::parser::Event;

    fn settings() -> ArchiveSettings {
        ArchiveSettings::default().with_case_hack(false)
    }

    fn names(data: &[u8]) -> Result<Vec<Event>, Error> {
        Decoder::new(data, &settings())?.collect()
    }

    fn make_tree(root: &Path) -> Result<(), Error> {
        std::fs::create_dir(root)?;
        std::fs::write(root.join("b"), b"bee")?;
        std::fs::write(root.join("a"), b"ay")?;
        std::fs::create_dir(root.join("dir"))?;
        std::fs::write(root.join("dir/exe"), b"#!")?;
        std::fs::set_permissions(root.join("dir/exe"), std::fs::Permissions::from_mode(0o755))?;
        symlink("../a", root.join("dir/link"))?;
        Ok(())
    }

    #[test]
    fn test_scan_sorted() -> Result<(), Error> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().join("tree");
        make_tree(&root)?;

        let (dump, mtime) = dump_path_and_get_mtime(&root, &settings())?;
        let data = dump.to_vec()?;
        assert!(mtime.get() > 0);

        let events = names(&data)?;
        let names: Vec<&[u8]> = events.iter().filter_map(Event::name).collect();
        assert_eq!(
            names,
            vec![&b""[..], b"a", b"b", b"dir", b"exe", b"link"]
        );
        assert!(events.contains(&Event::File {
            name: b"exe".to_vec(),
            executable: true,
            size: 2
        }));
        assert!(events.contains(&Event::Symlink {
            name: b"link".to_vec(),
            target: b"../a".to_vec()
        }));
        Ok(())
    }

    #[test]
    fn test_prepared_dump_filter() -> Result<(), Error> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().join("tree");
        make_tree(&root)?;

        let mut seen = Vec::new();
        let prepared = prepare_dump(&root, &settings(), |path| {
            seen.push(path.to_path_buf());
            path.file_name() != Some(OsStr::new("dir"))
        })?;
        assert!(!seen.contains(&root.join("dir/exe")));

        let first = prepared.dump().to_vec()?;
        let second = prepared.dump().to_vec()?;
        assert_eq!(first, second);

        let events = names(&first)?;
        assert_eq!(events.len(), 4);
        assert_eq!(prepared.disk_path("/b")?, root.join("b"));

        // contents are read at dump time
        std::fs::write(root.join("a"), b"AY")?;
        let third = prepared.dump().to_vec()?;
        assert_ne!(first, third);

        std::fs::write(root.join("a"), b"longer")?;
        assert!(prepared.dump().to_vec().is_err());
        Ok(())
    }

    #[test]
    fn test_case_hack_removed() -> Result<(), Error> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().join("tree");
        std::fs::create_dir(&root)?;
        std::fs::write(root.join("foo"), b"1")?;
        std::fs::write(root.join("FOO~nix~case~hack~1"), b"2")?;

        let hacked = settings().with_case_hack(true);
        let data = dump_path(&root, &hacked)?.to_vec()?;
        let events = names(&data)?;
        let names: Vec<&[u8]> = events.iter().filter_map(Event::name).collect();
        assert_eq!(names, vec![&b""[..], b"FOO", b"foo"]);

        // without the case hack the marker makes the name invalid
        assert!(dump_path(&root, &settings())?.to_vec().is_err());

        std::fs::write(root.join("foo~nix~case~hack~2"), b"3")?;
        let err = dump_path(&root, &hacked)?.to_vec().unwrap_err();
        assert!(err.downcast_ref::<ArchiveError>().unwrap().is_collision());
        Ok(())
    }

    fn is_aborted(err: &Error) -> bool {
        matches!(err.downcast_ref::<ArchiveError>(), Some(ArchiveError::Aborted))
    }

    #[test]
    fn test_abort() -> Result<(), Error> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().join("tree");
        make_tree(&root)?;

        // the lazy scan checks while the dump is consumed
        let abort = AbortHandle::new();
        let (entry, _) = scan_path(&root, &settings(), Some(abort.clone()))?;
        abort.abort();
        let err = crate::dump::dump(entry).to_vec().unwrap_err();
        assert!(is_aborted(&err));

        let err = scan_path(&root, &settings(), Some(abort)).unwrap_err();
        assert!(is_aborted(&err));

        let mut prepared = prepare_dump(&root, &settings(), |_| true)?;
        assert!(prepared.dump().to_vec().is_ok());
        let abort = AbortHandle::new();
        prepared.set_abort(abort.clone());
        abort.abort();
        let err = prepared.dump().to_vec().unwrap_err();
        assert!(is_aborted(&err));
        Ok(())
    }

    #[test]
    fn test_unsupported_type() -> Result<(), Error> {
        let tmp = tempfile::tempdir()?;
        let fifo = tmp.path().join("fifo");
        nix::unistd::mkfifo(&fifo, Mode::from_bits_truncate(0o600))?;
        assert!(dump_path(&fifo, &settings()).is_err());
        Ok(())
    }
}
