//! Lazy serializer.
//!
//! [`Dump`] turns an [`Entry`] tree into the canonical byte stream as an
//! iterator of chunks. Tokens are collected into small chunks, file contents are
//! passed through in the blocks produced by the entry, so memory usage does not
//! depend on file sizes or the size of the tree. Nested directories are kept on
//! an explicit stack instead of recursing.

use std::io::Write;

use anyhow::{bail, Context, Error};
use bytes::{Bytes, BytesMut};

use crate::entry::{ContentStream, DirectoryStream, Entry};
use crate::error::ArchiveError;
use crate::format::{self, NAR_VERSION_MAGIC_1};
use crate::task::{check_abort, AbortHandle};

/// Serialize a tree, starting with the archive header.
pub fn dump(root: Entry) -> Dump {
    Dump::new(root)
}

/// Serialize `data` as an archive consisting of a single non-executable file.
pub fn dump_string<B: Into<Bytes>>(data: B) -> Dump {
    Dump::new(Entry::file(false, data))
}

struct DirState {
    entries: DirectoryStream,
    last_name: Option<Vec<u8>>,
}

struct ContentState {
    contents: ContentStream,
    size: u64,
    left: u64,
}

/// Iterator over the chunks of a serialized archive.
///
/// Errors of the underlying entries surface at the chunk where they occur.
/// After an error the iterator is exhausted.
pub struct Dump {
    out: BytesMut,
    pending: Option<Entry>,
    dirs: Vec<DirState>,
    content: Option<ContentState>,
    abort: Option<AbortHandle>,
    done: bool,
}

impl Dump {
    pub fn new(root: Entry) -> Self {
        let mut out = BytesMut::with_capacity(4096);
        format::put_str(&mut out, NAR_VERSION_MAGIC_1);
        Self {
            out,
            pending: Some(root),
            dirs: Vec::new(),
            content: None,
            abort: None,
            done: false,
        }
    }

    /// Make the dump fail with [`ArchiveError::Aborted`] once `abort` fires.
    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Write the whole archive into `writer`, returning the number of bytes written.
    pub fn write_to<W: Write + ?Sized>(self, writer: &mut W) -> Result<u64, Error> {
        let mut written = 0u64;
        for chunk in self {
            let chunk = chunk?;
            writer
                .write_all(&chunk)
                .context("failed to write archive data")?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    /// Collect the whole archive in memory.
    pub fn to_vec(self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        self.write_to(&mut data)?;
        Ok(data)
    }

    fn flush(&mut self) -> Option<Bytes> {
        if self.out.is_empty() {
            None
        } else {
            Some(self.out.split().freeze())
        }
    }

    /// A node was fully written; close the surrounding directory entry.
    fn node_finished(&mut self) {
        if !self.dirs.is_empty() {
            format::put_entry_trailer(&mut self.out);
        }
    }

    fn start_node(&mut self, entry: Entry) -> Result<(), Error> {
        match entry {
            Entry::File(file) => {
                format::put_file_header(&mut self.out, file.executable, file.size);
                self.content = Some(ContentState {
                    contents: file.contents,
                    size: file.size,
                    left: file.size,
                });
            }
            Entry::Symlink(link) => {
                format::check_string_size(&link.target, "symlink target")?;
                format::put_symlink(&mut self.out, &link.target);
                self.node_finished();
            }
            Entry::Directory(dir) => {
                format::put_directory_header(&mut self.out);
                self.dirs.push(DirState {
                    entries: dir.entries,
                    last_name: None,
                });
            }
        }
        Ok(())
    }

    /// Produce the next block of the current file.
    fn next_content(&mut self) -> Result<Option<Bytes>, Error> {
        let content = match self.content.as_mut() {
            Some(content) => content,
            None => return Ok(None),
        };

        check_abort(&self.abort)?;

        match content.contents.next() {
            Some(Ok(block)) => {
                let len = block.len() as u64;
                if len > content.left {
                    bail!(
                        "file contents exceed the declared size of {} bytes",
                        content.size
                    );
                }
                content.left -= len;
                Ok(Some(block))
            }
            Some(Err(err)) => Err(err),
            None => {
                if content.left != 0 {
                    bail!(
                        "file contents ended {} bytes short of the declared size of {} bytes",
                        content.left,
                        content.size,
                    );
                }
                let size = content.size;
                self.content = None;
                format::put_file_trailer(&mut self.out, size);
                self.node_finished();
                Ok(None)
            }
        }
    }

    /// Advance the current directory by one entry.
    fn next_dir_entry(&mut self) -> Result<(), Error> {
        check_abort(&self.abort)?;

        let dir = match self.dirs.last_mut() {
            Some(dir) => dir,
            None => return Ok(()),
        };

        match dir.entries.next() {
            Some(Ok((name, entry))) => {
                format::check_entry_name(&name)?;
                format::check_string_size(&name, "file name")?;
                if let Some(last) = &dir.last_name {
                    if name <= *last {
                        return Err(ArchiveError::format(format!(
                            "directory entries not sorted: {:?} after {:?}",
                            String::from_utf8_lossy(&name),
                            String::from_utf8_lossy(last),
                        ))
                        .into());
                    }
                }
                format::put_entry_header(&mut self.out, &name);
                dir.last_name = Some(name);
                self.pending = Some(entry);
            }
            Some(Err(err)) => return Err(err),
            None => {
                self.dirs.pop();
                format::put_close(&mut self.out);
                self.node_finished();
            }
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            if self.content.is_some() {
                // tokens written so far precede the content block
                if let Some(chunk) = self.flush() {
                    return Ok(Some(chunk));
                }
                if let Some(block) = self.next_content()? {
                    if !block.is_empty() {
                        return Ok(Some(block));
                    }
                }
                continue;
            }

            if let Some(entry) = self.pending.take() {
                self.start_node(entry)?;
                continue;
            }

            if !self.dirs.is_empty() {
                self.next_dir_entry()?;
                if self.out.len() >= format::CONTENT_BLOCK_SIZE {
                    return Ok(self.flush());
                }
                continue;
            }

            return Ok(self.flush());
        }
    }
}

impl Iterator for Dump {
    type Item = Result<Bytes, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.advance() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
