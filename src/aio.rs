//! Async drivers for the archive parser and encoder.
//!
//! These use the same [`Parser`] as the blocking [`Decoder`](crate::Decoder),
//! the input is just read through [`tokio::io::AsyncRead`] instead.

use anyhow::{bail, format_err, Context, Error};
use bytes::Bytes;
use futures::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ArchiveSettings;
use crate::copy::Recoder;
use crate::dump::Dump;
use crate::error::{read_error, ArchiveError};
use crate::format::CONTENT_BLOCK_SIZE;
use crate::parser::{Event, Parser, Step};
use crate::sink::{Sink, SinkStack};
use crate::task::{check_abort, AbortHandle};

/// Decodes an archive from an async source.
///
/// Works like the blocking decoder: after an [`Event::File`] the contents can
/// be read with [`Decoder::read_chunk`], unread contents are skipped.
pub struct Decoder<R> {
    input: R,
    parser: Parser,
    abort: Option<AbortHandle>,
    done: bool,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    /// Create a decoder and check the archive header.
    pub async fn new(input: R, settings: &ArchiveSettings) -> Result<Self, Error> {
        let mut this = Self {
            input,
            parser: Parser::new(settings),
            abort: None,
            done: false,
        };

        loop {
            match this.parser.step()? {
                Step::Need(_) => this.fill().await?,
                other => bail!("unexpected parser step {:?} in archive header", other),
            }
            if this.parser.header_checked() {
                break;
            }
        }

        Ok(this)
    }

    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn position(&self) -> u64 {
        self.parser.position()
    }

    pub fn into_inner(self) -> R {
        self.input
    }

    async fn fill(&mut self) -> Result<(), ArchiveError> {
        self.input
            .read_exact(self.parser.input())
            .await
            .map_err(read_error)?;
        Ok(())
    }

    async fn skip_contents(&mut self, left: u64) -> Result<(), Error> {
        let skipped = tokio::io::copy(&mut (&mut self.input).take(left), &mut tokio::io::sink())
            .await
            .map_err(ArchiveError::Io)?;
        if skipped < left {
            return Err(ArchiveError::truncated().into());
        }
        self.parser.consume_contents(skipped)?;
        Ok(())
    }

    /// Advance to the next event, or `None` at the end of the archive.
    pub async fn next_event(&mut self) -> Result<Option<Event>, Error> {
        if self.done {
            return Ok(None);
        }

        let res = self.do_next_event().await;
        if !matches!(res, Ok(Some(_))) {
            self.done = true;
        }
        res
    }

    async fn do_next_event(&mut self) -> Result<Option<Event>, Error> {
        loop {
            check_abort(&self.abort)?;
            match self.parser.step()? {
                Step::Need(_) => self.fill().await?,
                Step::Contents(left) => self.skip_contents(left).await?,
                Step::Event(event) => return Ok(Some(event)),
                Step::Finished => return Ok(None),
            }
        }
    }

    /// Read the next block of the current file's contents.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        let left = self.parser.contents_remaining();
        if left == 0 {
            return Ok(None);
        }
        check_abort(&self.abort)?;

        let len = left.min(CONTENT_BLOCK_SIZE as u64) as usize;
        let mut data = vec![0u8; len];
        self.input
            .read_exact(&mut data)
            .await
            .map_err(read_error)?;
        self.parser.consume_contents(len as u64)?;
        Ok(Some(Bytes::from(data)))
    }

    /// Stream of the remaining events, skipping all file contents.
    pub fn events(self) -> impl Stream<Item = Result<Event, Error>> {
        stream::try_unfold(self, |mut decoder| async move {
            let event = decoder.next_event().await?;
            Ok::<_, Error>(event.map(|event| (event, decoder)))
        })
    }
}

/// Parse an archive from `input` and push it into `sink`.
pub async fn restore<R: AsyncRead + Unpin>(
    sink: &mut dyn Sink,
    input: R,
    settings: &ArchiveSettings,
) -> Result<(), Error> {
    let mut decoder = Decoder::new(input, settings).await?;
    let mut stack = SinkStack::new(sink);

    while let Some(event) = decoder.next_event().await? {
        let mut file = match stack.handle(event)? {
            Some(file) => file,
            None => continue,
        };
        while let Some(chunk) = decoder.read_chunk().await? {
            file.receive(&chunk)?;
        }
        file.close()?;
    }

    Ok(())
}

/// Validate and re-encode the archive from `input` into `output`.
///
/// Returns the number of bytes written.
pub async fn copy_archive<R, W>(input: R, output: &mut W) -> Result<u64, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let settings = ArchiveSettings::default().with_case_hack(false);
    let mut decoder = Decoder::new(input, &settings).await?;
    let mut recoder = Recoder::new();
    let mut written = 0u64;

    loop {
        if recoder.file.is_some() {
            while let Some(chunk) = decoder.read_chunk().await? {
                if let Some(tokens) = recoder.flush() {
                    written += write_chunk(output, &tokens).await?;
                }
                written += write_chunk(output, &chunk).await?;
            }
            recoder.file_finished();
        }

        match decoder.next_event().await? {
            Some(event) => recoder.event(&event),
            None => break,
        }

        if recoder.out.len() >= CONTENT_BLOCK_SIZE {
            if let Some(tokens) = recoder.flush() {
                written += write_chunk(output, &tokens).await?;
            }
        }
    }

    if let Some(tokens) = recoder.flush() {
        written += write_chunk(output, &tokens).await?;
    }
    output.flush().await.context("failed to flush archive output")?;

    Ok(written)
}

async fn write_chunk<W: AsyncWrite + Unpin + ?Sized>(
    output: &mut W,
    data: &[u8],
) -> Result<u64, Error> {
    output
        .write_all(data)
        .await
        .context("failed to write archive data")?;
    Ok(data.len() as u64)
}

/// Write a serialized archive to an async writer.
///
/// File contents of scanned trees are still read with blocking I/O.
pub async fn write_dump<W: AsyncWrite + Unpin + ?Sized>(
    dump: Dump,
    output: &mut W,
) -> Result<u64, Error> {
    let mut written = 0u64;
    for chunk in dump {
        let chunk = chunk?;
        written += write_chunk(output, &chunk).await?;
    }
    output
        .flush()
        .await
        .map_err(|err| format_err!("failed to flush archive output - {}", err))?;
    Ok(written)
}
