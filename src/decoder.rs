//! Blocking archive decoder.

use std::io::{self, Read};

use anyhow::{bail, Error};
use bytes::Bytes;

use crate::config::ArchiveSettings;
use crate::error::{read_error, ArchiveError};
use crate::format::CONTENT_BLOCK_SIZE;
use crate::parser::{Event, Parser, Step};
use crate::task::{check_abort, AbortHandle};

/// Decodes an archive from a [`Read`] source.
///
/// The decoder is an iterator of [`Event`]s. After an [`Event::File`] its
/// contents can be read with [`Decoder::contents`]; contents which were not
/// read are skipped when advancing to the next event.
pub struct Decoder<R> {
    input: R,
    parser: Parser,
    abort: Option<AbortHandle>,
    done: bool,
}

impl<R: Read> Decoder<R> {
    /// Create a decoder and check the archive header.
    pub fn new(input: R, settings: &ArchiveSettings) -> Result<Self, Error> {
        let mut this = Self {
            input,
            parser: Parser::new(settings),
            abort: None,
            done: false,
        };

        loop {
            match this.parser.step()? {
                Step::Need(_) => this.fill()?,
                other => bail!("unexpected parser step {:?} in archive header", other),
            }
            if this.parser.header_checked() {
                break;
            }
        }

        Ok(this)
    }

    /// Fail with [`ArchiveError::Aborted`] once `abort` fires.
    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Number of archive bytes consumed from the input.
    pub fn position(&self) -> u64 {
        self.parser.position()
    }

    pub fn into_inner(self) -> R {
        self.input
    }

    fn fill(&mut self) -> Result<(), ArchiveError> {
        self.input
            .read_exact(self.parser.input())
            .map_err(read_error)
    }

    fn skip_contents(&mut self, left: u64) -> Result<(), Error> {
        let skipped = io::copy(&mut (&mut self.input).take(left), &mut io::sink())
            .map_err(ArchiveError::Io)?;
        if skipped < left {
            return Err(ArchiveError::truncated().into());
        }
        self.parser.consume_contents(skipped)?;
        Ok(())
    }

    /// Advance to the next event, or `None` at the end of the archive.
    pub fn next_event(&mut self) -> Result<Option<Event>, Error> {
        if self.done {
            return Ok(None);
        }

        let res = self.do_next_event();
        if !matches!(res, Ok(Some(_))) {
            self.done = true;
        }
        res
    }

    fn do_next_event(&mut self) -> Result<Option<Event>, Error> {
        loop {
            check_abort(&self.abort)?;
            match self.parser.step()? {
                Step::Need(_) => self.fill()?,
                Step::Contents(left) => self.skip_contents(left)?,
                Step::Event(event) => return Ok(Some(event)),
                Step::Finished => return Ok(None),
            }
        }
    }

    /// Access the contents of the file reported by the last event.
    pub fn contents(&mut self) -> Option<Contents<'_, R>> {
        if self.parser.in_contents() {
            Some(Contents { decoder: self })
        } else {
            None
        }
    }
}

impl<R: Read> Iterator for Decoder<R> {
    type Item = Result<Event, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

/// Contents of the current file.
pub struct Contents<'a, R> {
    decoder: &'a mut Decoder<R>,
}

impl<'a, R: Read> Contents<'a, R> {
    /// Number of bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.decoder.parser.contents_remaining()
    }

    /// Read the next block of at most [`CONTENT_BLOCK_SIZE`] bytes.
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        let left = self.remaining();
        if left == 0 {
            return Ok(None);
        }
        check_abort(&self.decoder.abort)?;

        let len = left.min(CONTENT_BLOCK_SIZE as u64) as usize;
        let mut data = vec![0u8; len];
        self.decoder
            .input
            .read_exact(&mut data)
            .map_err(read_error)?;
        self.decoder.parser.consume_contents(len as u64)?;
        Ok(Some(Bytes::from(data)))
    }
}

impl<'a, R: Read> Read for Contents<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.remaining();
        if left == 0 || buf.is_empty() {
            return Ok(0);
        }

        let len = left.min(buf.len() as u64) as usize;
        let got = self.decoder.input.read(&mut buf[..len])?;
        if got == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                ArchiveError::truncated(),
            ));
        }
        self.decoder
            .parser
            .consume_contents(got as u64)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(got)
    }
}
