//! Producer side tree model.
//!
//! An [`Entry`] describes one node of a tree which is about to be serialized.
//! File contents and directory listings are lazy iterators, so a tree backed
//! by the file system (see [`scan`](crate::scan)) only reads data when the
//! serializer gets to it. Both are single pass: once consumed they are gone.

use anyhow::Error;
use bytes::Bytes;

/// Lazily produced file contents.
pub type ContentStream = Box<dyn Iterator<Item = Result<Bytes, Error>> + Send>;

/// Lazily produced directory entries, which must be sorted by name.
pub type DirectoryStream = Box<dyn Iterator<Item = Result<(Vec<u8>, Entry), Error>> + Send>;

pub struct File {
    pub executable: bool,
    /// Declared size. The contents must produce exactly this many bytes.
    pub size: u64,
    pub contents: ContentStream,
}

pub struct Symlink {
    pub target: Vec<u8>,
}

pub struct Directory {
    /// Entries in strictly increasing byte order of their names.
    pub entries: DirectoryStream,
}

pub enum Entry {
    File(File),
    Symlink(Symlink),
    Directory(Directory),
}

impl Entry {
    /// A regular file with in-memory contents.
    pub fn file<B: Into<Bytes>>(executable: bool, data: B) -> Self {
        let data: Bytes = data.into();
        let size = data.len() as u64;
        let contents: ContentStream = if data.is_empty() {
            Box::new(std::iter::empty())
        } else {
            Box::new(std::iter::once(Ok(data)))
        };
        Entry::File(File {
            executable,
            size,
            contents,
        })
    }

    pub fn symlink<T: Into<Vec<u8>>>(target: T) -> Self {
        Entry::Symlink(Symlink {
            target: target.into(),
        })
    }

    /// A directory from an already sorted iterator of entries.
    pub fn directory<I>(entries: I) -> Self
    where
        I: Iterator<Item = Result<(Vec<u8>, Entry), Error>> + Send + 'static,
    {
        Entry::Directory(Directory {
            entries: Box::new(entries),
        })
    }

    /// A directory from a list of entries in any order. The entries are sorted
    /// by name before being handed out.
    pub fn directory_from<N: Into<Vec<u8>>>(entries: Vec<(N, Entry)>) -> Self {
        let mut entries: Vec<(Vec<u8>, Entry)> = entries
            .into_iter()
            .map(|(name, entry)| (name.into(), entry))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Self::directory(entries.into_iter().map(Ok))
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entry::File(file) => f
                .debug_struct("File")
                .field("executable", &file.executable)
                .field("size", &file.size)
                .finish_non_exhaustive(),
            Entry::Symlink(link) => f
                .debug_struct("Symlink")
                .field("target", &String::from_utf8_lossy(&link.target))
                .finish(),
            Entry::Directory(_) => f.debug_struct("Directory").finish_non_exhaustive(),
        }
    }
}
