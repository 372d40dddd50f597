//! Incremental archive parser.
//!
//! The [`Parser`] is a pure state machine without any I/O. It tells its driver
//! how many bytes it needs next, the driver reads exactly that many bytes into
//! [`Parser::input`] and calls [`Parser::step`] again. File contents are not
//! copied through the parser: it announces them with [`Step::Contents`] and the
//! driver reports what it consumed with [`Parser::consume_contents`].
//!
//! This keeps the grammar in one place and lets the blocking
//! [`Decoder`](crate::Decoder) and the async [`aio::Decoder`](crate::aio::Decoder)
//! share it.
//!
//! The parser produces a flattened pre-order stream of [`Event`]s. Every
//! [`Event::Directory`] is eventually matched by an [`Event::EndDirectory`].

use crate::case_hack::CaseHackNames;
use crate::config::ArchiveSettings;
use crate::error::ArchiveError;
use crate::format::{self, MAX_STRING_SIZE, NAR_VERSION_MAGIC_1};

/// A structural element of the archive.
///
/// `name` is the directory entry name, after case hack renaming if enabled.
/// It is empty for the root node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A regular file. Its `size` bytes of contents follow as [`Step::Contents`].
    File {
        name: Vec<u8>,
        executable: bool,
        size: u64,
    },
    Symlink {
        name: Vec<u8>,
        target: Vec<u8>,
    },
    /// Start of a directory. The following events up to the matching
    /// [`Event::EndDirectory`] are its entries.
    Directory {
        name: Vec<u8>,
    },
    EndDirectory,
}

impl Event {
    pub fn name(&self) -> Option<&[u8]> {
        match self {
            Event::File { name, .. } | Event::Symlink { name, .. } | Event::Directory { name } => {
                Some(name.as_slice())
            }
            Event::EndDirectory => None,
        }
    }
}

/// What the driver has to do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Fill [`Parser::input`], which has exactly this length, then step again.
    Need(usize),
    /// This many bytes of file contents are next in the input. Read (or skip)
    /// any amount of it and report it with [`Parser::consume_contents`].
    Contents(u64),
    Event(Event),
    /// The archive is complete. Trailing input is not looked at.
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Magic,
    NodeOpen,
    TypeTag,
    NodeType,
    RegularField,
    ExecutableMarker,
    ContentsTag { executable: bool },
    Size { executable: bool },
    FileData { left: u64, size: u64 },
    FilePadding,
    NodeClose,
    SymlinkTag,
    SymlinkTarget,
    DirectoryEntry,
    EntryOpen,
    EntryNameTag,
    EntryName,
    EntryNodeTag,
    EntryClose,
    Finished,
}

/// Raw read currently in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Read {
    Idle,
    Length,
    Body(usize),
    Number,
    Padding,
}

enum Token {
    Str(Vec<u8>),
    Number(u64),
    Padding,
}

struct DirFrame {
    last_name: Option<Vec<u8>>,
    case_hack: Option<CaseHackNames>,
}

pub struct Parser {
    state: State,
    read: Read,
    buffer: Vec<u8>,
    requested: bool,
    dirs: Vec<DirFrame>,
    name: Vec<u8>,
    use_case_hack: bool,
    position: u64,
    failed: bool,
}

fn bad<T, S: Into<String>>(cause: S) -> Result<T, ArchiveError> {
    Err(ArchiveError::format(cause))
}

fn expect_tag(found: &[u8], tag: &[u8], kind: &str) -> Result<(), ArchiveError> {
    if found != tag {
        return bad(format!("expected {} tag", kind));
    }
    Ok(())
}

fn check_padding(data: &[u8]) -> Result<(), ArchiveError> {
    if data.iter().any(|b| *b != 0) {
        return bad("non-zero padding");
    }
    Ok(())
}

impl Parser {
    pub fn new(settings: &ArchiveSettings) -> Self {
        Self {
            state: State::Magic,
            read: Read::Idle,
            buffer: Vec::with_capacity(64),
            requested: false,
            dirs: Vec::new(),
            name: Vec::new(),
            use_case_hack: settings.use_case_hack,
            position: 0,
            failed: false,
        }
    }

    /// Number of archive bytes consumed so far.
    ///
    /// Right after an [`Event::File`] this is the offset of its contents.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Whether the archive header was read and accepted.
    pub fn header_checked(&self) -> bool {
        self.state != State::Magic
    }

    /// Whether the parser is positioned inside of file contents.
    pub fn in_contents(&self) -> bool {
        matches!(self.state, State::FileData { .. })
    }

    /// Buffer to be filled after [`Step::Need`].
    pub fn input(&mut self) -> &mut [u8] {
        &mut self.buffer[..]
    }

    /// Bytes of the current file left unconsumed, zero outside of file contents.
    pub fn contents_remaining(&self) -> u64 {
        match self.state {
            State::FileData { left, .. } => left,
            _ => 0,
        }
    }

    /// Report that `count` bytes of file contents were consumed.
    pub fn consume_contents(&mut self, count: u64) -> Result<(), ArchiveError> {
        match &mut self.state {
            State::FileData { left, .. } if count <= *left => {
                *left -= count;
                self.position += count;
                Ok(())
            }
            _ => {
                self.failed = true;
                bad("file contents overrun")
            }
        }
    }

    /// Advance the state machine.
    ///
    /// After an error the parser stays failed.
    pub fn step(&mut self) -> Result<Step, ArchiveError> {
        if self.failed {
            return bad("archive parser already failed");
        }
        let res = self.do_step();
        if res.is_err() {
            self.failed = true;
        }
        res
    }

    fn request(&mut self, read: Read, len: usize) -> Step {
        self.read = read;
        self.buffer.clear();
        self.buffer.resize(len, 0);
        self.requested = true;
        Step::Need(len)
    }

    fn do_step(&mut self) -> Result<Step, ArchiveError> {
        loop {
            if self.requested {
                self.requested = false;
                self.position += self.buffer.len() as u64;
                if let Some(token) = self.finish_read()? {
                    if let Some(event) = self.advance(token)? {
                        return Ok(Step::Event(event));
                    }
                }
                continue;
            }

            if let Read::Body(len) = self.read {
                let total = len + format::padding_len(len as u64);
                return Ok(self.request(Read::Body(len), total));
            }

            match self.state {
                State::Finished => return Ok(Step::Finished),
                State::FileData { left, .. } if left > 0 => return Ok(Step::Contents(left)),
                State::FileData { size, .. } => {
                    if format::padding_len(size) == 0 {
                        self.state = State::NodeClose;
                        continue;
                    }
                    self.state = State::FilePadding;
                    return Ok(self.request(Read::Padding, format::padding_len(size)));
                }
                State::Size { .. } => return Ok(self.request(Read::Number, 8)),
                _ => return Ok(self.request(Read::Length, 8)),
            }
        }
    }

    /// Interpret a filled input buffer. Returns a token once one is complete.
    fn finish_read(&mut self) -> Result<Option<Token>, ArchiveError> {
        let read = std::mem::replace(&mut self.read, Read::Idle);
        match read {
            Read::Idle => Ok(None),
            Read::Number => Ok(Some(Token::Number(self.take_u64()))),
            Read::Padding => {
                check_padding(&self.buffer)?;
                Ok(Some(Token::Padding))
            }
            Read::Length => {
                let len = self.take_u64();
                if self.state == State::Magic && len != NAR_VERSION_MAGIC_1.len() as u64 {
                    return bad("input doesn't look like a Nix archive");
                }
                if len > MAX_STRING_SIZE {
                    return bad(format!("string too long ({} bytes)", len));
                }
                if len == 0 {
                    return Ok(Some(Token::Str(Vec::new())));
                }
                self.read = Read::Body(len as usize);
                Ok(None)
            }
            Read::Body(len) => {
                check_padding(&self.buffer[len..])?;
                self.buffer.truncate(len);
                Ok(Some(Token::Str(std::mem::take(&mut self.buffer))))
            }
        }
    }

    fn take_u64(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buffer[..8]);
        u64::from_le_bytes(raw)
    }

    fn node_finished(&mut self) {
        self.state = if self.dirs.is_empty() {
            State::Finished
        } else {
            State::EntryClose
        };
    }

    fn take_name(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.name)
    }

    fn advance(&mut self, token: Token) -> Result<Option<Event>, ArchiveError> {
        let data = match token {
            Token::Str(data) => data,
            Token::Number(size) => match self.state {
                State::Size { executable } => {
                    self.state = State::FileData { left: size, size };
                    return Ok(Some(Event::File {
                        name: self.take_name(),
                        executable,
                        size,
                    }));
                }
                _ => return bad("unexpected number"),
            },
            Token::Padding => {
                self.state = State::NodeClose;
                return Ok(None);
            }
        };

        match self.state {
            State::Magic => {
                if data != NAR_VERSION_MAGIC_1 {
                    return bad("input doesn't look like a Nix archive");
                }
                self.state = State::NodeOpen;
            }
            State::NodeOpen => {
                expect_tag(&data, format::OPEN, "open")?;
                self.state = State::TypeTag;
            }
            State::TypeTag => {
                expect_tag(&data, format::TYPE, "type")?;
                self.state = State::NodeType;
            }
            State::NodeType => match &data[..] {
                format::REGULAR => self.state = State::RegularField,
                format::SYMLINK => self.state = State::SymlinkTag,
                format::DIRECTORY => {
                    self.state = State::DirectoryEntry;
                    self.dirs.push(DirFrame {
                        last_name: None,
                        case_hack: self.use_case_hack.then(CaseHackNames::new),
                    });
                    return Ok(Some(Event::Directory {
                        name: self.take_name(),
                    }));
                }
                other => {
                    return bad(format!(
                        "unknown file type {}",
                        String::from_utf8_lossy(other)
                    ))
                }
            },
            State::RegularField => match &data[..] {
                format::EXECUTABLE => self.state = State::ExecutableMarker,
                format::CONTENTS => self.state = State::Size { executable: false },
                _ => return bad("file without contents found"),
            },
            State::ExecutableMarker => {
                if !data.is_empty() {
                    return bad("executable marker has non-empty value");
                }
                self.state = State::ContentsTag { executable: true };
            }
            State::ContentsTag { executable } => {
                if data != format::CONTENTS {
                    return bad("file without contents found");
                }
                self.state = State::Size { executable };
            }
            State::NodeClose => {
                expect_tag(&data, format::CLOSE, "close")?;
                self.node_finished();
            }
            State::SymlinkTag => {
                expect_tag(&data, format::TARGET, "target")?;
                self.state = State::SymlinkTarget;
            }
            State::SymlinkTarget => {
                self.state = State::NodeClose;
                return Ok(Some(Event::Symlink {
                    name: self.take_name(),
                    target: data,
                }));
            }
            State::DirectoryEntry => match &data[..] {
                format::CLOSE => {
                    self.dirs.pop();
                    self.node_finished();
                    return Ok(Some(Event::EndDirectory));
                }
                format::ENTRY => self.state = State::EntryOpen,
                _ => return bad("expected entry tag"),
            },
            State::EntryOpen => {
                expect_tag(&data, format::OPEN, "open")?;
                self.state = State::EntryNameTag;
            }
            State::EntryNameTag => {
                expect_tag(&data, format::NAME, "name")?;
                self.state = State::EntryName;
            }
            State::EntryName => {
                self.name = self.check_name(data)?;
                self.state = State::EntryNodeTag;
            }
            State::EntryNodeTag => {
                expect_tag(&data, format::NODE, "node")?;
                self.state = State::NodeOpen;
            }
            State::EntryClose => {
                expect_tag(&data, format::CLOSE, "close")?;
                self.state = State::DirectoryEntry;
            }
            State::Size { .. }
            | State::FileData { .. }
            | State::FilePadding
            | State::Finished => return bad("unexpected string"),
        }

        Ok(None)
    }

    /// Validate an entry name and apply the case hack.
    fn check_name(&mut self, name: Vec<u8>) -> Result<Vec<u8>, ArchiveError> {
        format::check_entry_name(&name)?;

        let frame = match self.dirs.last_mut() {
            Some(frame) => frame,
            None => return bad("directory entry outside of a directory"),
        };

        if let Some(last) = &frame.last_name {
            if name <= *last {
                return bad("directory is not sorted");
            }
        }
        frame.last_name = Some(name.clone());

        match &mut frame.case_hack {
            Some(names) => Ok(names.rename(name)),
            None => Ok(name),
        }
    }
}
