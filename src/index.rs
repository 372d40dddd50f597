//! Offset index and random access to archive members.
//!
//! [`create_index`] walks an archive once without copying file contents and
//! records where the contents of every file start. With a seekable source
//! [`NarAccessor`] then reads single members without parsing the archive
//! again.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{bail, format_err, Context, Error};
use serde_json::{json, Map, Value};

use crate::config::ArchiveSettings;
use crate::decoder::Decoder;
use crate::parser::Event;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexEntry {
    File {
        executable: bool,
        size: u64,
        /// Offset of the file contents from the start of the archive.
        offset: u64,
    },
    Symlink {
        target: Vec<u8>,
    },
    Directory(BTreeMap<Vec<u8>, IndexEntry>),
}

impl IndexEntry {
    pub fn type_str(&self) -> &'static str {
        match self {
            IndexEntry::File { .. } => "regular",
            IndexEntry::Symlink { .. } => "symlink",
            IndexEntry::Directory(_) => "directory",
        }
    }

    /// Resolve a `/` separated path relative to this entry.
    pub fn lookup(&self, path: &str) -> Option<&IndexEntry> {
        let mut entry = self;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            entry = match entry {
                IndexEntry::Directory(entries) => entries.get(component.as_bytes())?,
                _ => return None,
            };
        }
        Some(entry)
    }

    /// JSON listing as used by binary cache `.ls` files.
    pub fn to_json(&self) -> Value {
        match self {
            IndexEntry::File {
                executable,
                size,
                offset,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!("regular"));
                obj.insert("size".into(), json!(size));
                if *executable {
                    obj.insert("executable".into(), json!(true));
                }
                obj.insert("narOffset".into(), json!(offset));
                Value::Object(obj)
            }
            IndexEntry::Symlink { target } => json!({
                "type": "symlink",
                "target": String::from_utf8_lossy(target),
            }),
            IndexEntry::Directory(entries) => {
                let entries: Map<String, Value> = entries
                    .iter()
                    .map(|(name, entry)| {
                        (String::from_utf8_lossy(name).into_owned(), entry.to_json())
                    })
                    .collect();
                json!({
                    "type": "directory",
                    "entries": entries,
                })
            }
        }
    }

    /// Call `callback` for every entry with its `/` separated path, in
    /// archive order.
    pub fn walk<F>(&self, callback: &mut F)
    where
        F: FnMut(&str, &IndexEntry),
    {
        self.walk_at(&mut String::new(), callback)
    }

    fn walk_at<F>(&self, path: &mut String, callback: &mut F)
    where
        F: FnMut(&str, &IndexEntry),
    {
        callback(if path.is_empty() { "/" } else { path.as_str() }, self);
        if let IndexEntry::Directory(entries) = self {
            for (name, entry) in entries {
                let len = path.len();
                path.push('/');
                path.push_str(&String::from_utf8_lossy(name));
                entry.walk_at(path, callback);
                path.truncate(len);
            }
        }
    }
}

/// Index an archive. Names are taken verbatim, the case hack does not apply.
pub fn create_index<R: Read>(input: R) -> Result<IndexEntry, Error> {
    let settings = ArchiveSettings::default().with_case_hack(false);
    let mut decoder = Decoder::new(input, &settings)?;

    let mut stack: Vec<(Vec<u8>, BTreeMap<Vec<u8>, IndexEntry>)> = Vec::new();
    let mut root = None;

    while let Some(event) = decoder.next_event()? {
        let (name, entry) = match event {
            Event::Directory { name } => {
                stack.push((name, BTreeMap::new()));
                continue;
            }
            Event::EndDirectory => match stack.pop() {
                Some((name, entries)) => (name, IndexEntry::Directory(entries)),
                None => bail!("unexpected end of directory"),
            },
            Event::File {
                name,
                executable,
                size,
            } => (
                name,
                IndexEntry::File {
                    executable,
                    size,
                    offset: decoder.position(),
                },
            ),
            Event::Symlink { name, target } => (name, IndexEntry::Symlink { target }),
        };

        match stack.last_mut() {
            Some((_, entries)) => {
                entries.insert(name, entry);
            }
            None => root = Some(entry),
        }
    }

    root.ok_or_else(|| format_err!("archive without root node"))
}

/// Random access to the members of an archive in a seekable source.
pub struct NarAccessor<R> {
    index: IndexEntry,
    input: R,
}

impl<R: Read + Seek> NarAccessor<R> {
    /// Index the archive, which starts at the current position of `input`.
    pub fn new(mut input: R) -> Result<Self, Error> {
        let start = input.stream_position()?;
        let index = create_index(&mut input)?;
        input.seek(SeekFrom::Start(start))?;
        Ok(Self::with_index(index, input, start))
    }

    /// Use an existing index. `start` is the offset of the archive in `input`.
    pub fn with_index(index: IndexEntry, input: R, start: u64) -> Self {
        let index = if start == 0 {
            index
        } else {
            rebase(index, start)
        };
        Self { index, input }
    }

    pub fn root(&self) -> &IndexEntry {
        &self.index
    }

    pub fn stat(&self, path: &str) -> Option<&IndexEntry> {
        self.index.lookup(path)
    }

    fn get(&self, path: &str) -> Result<&IndexEntry, Error> {
        self.stat(path)
            .ok_or_else(|| format_err!("path {:?} does not exist in archive", path))
    }

    pub fn read_directory(&self, path: &str) -> Result<Vec<Vec<u8>>, Error> {
        match self.get(path)? {
            IndexEntry::Directory(entries) => Ok(entries.keys().cloned().collect()),
            _ => bail!("path {:?} inside archive is not a directory", path),
        }
    }

    pub fn read_link(&self, path: &str) -> Result<Vec<u8>, Error> {
        match self.get(path)? {
            IndexEntry::Symlink { target } => Ok(target.clone()),
            _ => bail!("path {:?} inside archive is not a symlink", path),
        }
    }

    /// Reader for the contents of a regular file.
    pub fn open_file(&mut self, path: &str) -> Result<std::io::Take<&mut R>, Error> {
        let (size, offset) = match self.get(path)? {
            IndexEntry::File { size, offset, .. } => (*size, *offset),
            _ => bail!("path {:?} inside archive is not a regular file", path),
        };
        self.input
            .seek(SeekFrom::Start(offset))
            .with_context(|| format!("failed to seek to contents of {:?}", path))?;
        Ok((&mut self.input).take(size))
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, Error> {
        let mut reader = self.open_file(path)?;
        let size = reader.limit();
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {:?} from archive", path))?;
        if data.len() as u64 != size {
            bail!("archive truncated while reading {:?}", path);
        }
        Ok(data)
    }
}

fn rebase(entry: IndexEntry, start: u64) -> IndexEntry {
    match entry {
        IndexEntry::File {
            executable,
            size,
            offset,
        } => IndexEntry::File {
            executable,
            size,
            offset: offset + start,
        },
        IndexEntry::Directory(entries) => IndexEntry::Directory(
            entries
                .into_iter()
                .map(|(name, entry)| (name, rebase(entry, start)))
                .collect(),
        ),
        other => other,
    }
}
