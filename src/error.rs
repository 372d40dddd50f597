use std::io;

/// Error kinds raised by the archive codec.
///
/// Public functions return [`anyhow::Error`], use `downcast_ref::<ArchiveError>()`
/// to find out which kind of failure happened. This also works through context
/// attached further up.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    /// The byte stream is not a well-formed archive.
    #[error("bad archive: {0}")]
    Format(String),
    /// Two names map to the same file, either after removing the case hack
    /// while scanning or because the restore destination already exists.
    #[error("{0}")]
    Collision(String),
    #[error("operation aborted")]
    Aborted,
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    pub fn format<S: Into<String>>(cause: S) -> Self {
        ArchiveError::Format(cause.into())
    }

    pub fn truncated() -> Self {
        ArchiveError::Format("unexpected end of archive".to_string())
    }

    pub fn is_format(&self) -> bool {
        matches!(self, ArchiveError::Format(_))
    }

    pub fn is_collision(&self) -> bool {
        matches!(self, ArchiveError::Collision(_))
    }
}

/// Translate a read error of the archive source.
///
/// Running out of input where the archive declared more data is a format
/// error, everything else stays an I/O error.
pub(crate) fn read_error(err: io::Error) -> ArchiveError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ArchiveError::truncated()
    } else {
        ArchiveError::Io(err)
    }
}
