//! Parse and re-encode an archive in one pass.
//!
//! Used to validate archives received from elsewhere. Every event is encoded
//! again as soon as it was parsed and file contents pass through unchanged,
//! so only the names of the currently open directories are held in memory.
//! The output of a valid archive is byte identical to its input.

use std::io::{Read, Write};

use anyhow::{format_err, Context, Error};
use bytes::{Bytes, BytesMut};

use crate::config::ArchiveSettings;
use crate::decoder::Decoder;
use crate::format::{self, CONTENT_BLOCK_SIZE, NAR_VERSION_MAGIC_1};
use crate::parser::Event;

/// Token encoder shared by the blocking and async recoder.
#[derive(Default)]
pub(crate) struct Recoder {
    pub(crate) out: BytesMut,
    depth: usize,
    /// Size of the file whose contents are currently passed through.
    pub(crate) file: Option<u64>,
}

impl Recoder {
    pub(crate) fn new() -> Self {
        let mut out = BytesMut::with_capacity(4096);
        format::put_str(&mut out, NAR_VERSION_MAGIC_1);
        Self {
            out,
            ..Default::default()
        }
    }

    pub(crate) fn event(&mut self, event: &Event) {
        match event {
            Event::Directory { name } => {
                if self.depth > 0 {
                    format::put_entry_header(&mut self.out, name);
                }
                format::put_directory_header(&mut self.out);
                self.depth += 1;
            }
            Event::EndDirectory => {
                format::put_close(&mut self.out);
                self.depth = self.depth.saturating_sub(1);
                self.node_finished();
            }
            Event::Symlink { name, target } => {
                if self.depth > 0 {
                    format::put_entry_header(&mut self.out, name);
                }
                format::put_symlink(&mut self.out, target);
                self.node_finished();
            }
            Event::File {
                name,
                executable,
                size,
            } => {
                if self.depth > 0 {
                    format::put_entry_header(&mut self.out, name);
                }
                format::put_file_header(&mut self.out, *executable, *size);
                self.file = Some(*size);
            }
        }
    }

    pub(crate) fn file_finished(&mut self) {
        if let Some(size) = self.file.take() {
            format::put_file_trailer(&mut self.out, size);
            self.node_finished();
        }
    }

    fn node_finished(&mut self) {
        if self.depth > 0 {
            format::put_entry_trailer(&mut self.out);
        }
    }

    pub(crate) fn flush(&mut self) -> Option<Bytes> {
        if self.out.is_empty() {
            None
        } else {
            Some(self.out.split().freeze())
        }
    }
}

/// Iterator over the chunks of the re-encoded archive.
pub struct CopyArchive<R> {
    decoder: Decoder<R>,
    recoder: Recoder,
    done: bool,
}

/// Start copying the archive from `input`. The header is checked right away.
pub fn copy_archive<R: Read>(input: R) -> Result<CopyArchive<R>, Error> {
    // names are copied verbatim
    let settings = ArchiveSettings::default().with_case_hack(false);
    Ok(CopyArchive {
        decoder: Decoder::new(input, &settings)?,
        recoder: Recoder::new(),
        done: false,
    })
}

impl<R: Read> CopyArchive<R> {
    fn advance(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            if self.recoder.file.is_some() {
                if let Some(chunk) = self.recoder.flush() {
                    return Ok(Some(chunk));
                }
                let mut contents = self
                    .decoder
                    .contents()
                    .ok_or_else(|| format_err!("found regular file entry without contents"))?;
                match contents.next_chunk()? {
                    Some(chunk) => return Ok(Some(chunk)),
                    None => {
                        self.recoder.file_finished();
                        continue;
                    }
                }
            }

            if self.recoder.out.len() >= CONTENT_BLOCK_SIZE {
                return Ok(self.recoder.flush());
            }

            match self.decoder.next_event()? {
                Some(event) => self.recoder.event(&event),
                None => return Ok(self.recoder.flush()),
            }
        }
    }

    /// Copy everything to `writer`, returning the number of bytes written.
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
}

impl<R: Read> Iterator for CopyArchive<R> {
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
