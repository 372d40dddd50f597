//! *NAR* implementation (`nix-archive-1` file tree archives)
//!
//! A NAR is a canonical, linear serialization of a file system tree consisting
//! of regular files, symbolic links and directories. Given a tree the archive
//! bytes are fully deterministic: there are no timestamps, owners or
//! permissions besides the executable bit, and directory entries are strictly
//! ordered by the bytes of their names.
//!
//! Every archive is a length prefixed magic string followed by the root node:
//!  * `"nix-archive-1"`
//!  * `"(" "type" "regular" ["executable" ""] "contents" <size> <data> ")"`
//!  * `"(" "type" "symlink" "target" <target> ")"`
//!  * `"(" "type" "directory" { "entry" "(" "name" <name> "node" <node> ")" } ")"`
//!
//! Strings are a little endian 64 bit length followed by the data, padded with
//! zeros to a multiple of 8 bytes. File contents use the same framing.
//!
//! The crate is split into a producer side ([`entry`], [`scan`], [`dump`]),
//! a consumer side ([`parser`], [`decoder`], [`aio`]) and consumers of parsed
//! archives ([`sink`], [`index`], [`copy`]). Nothing in here buffers whole
//! files or whole directory trees, with the exception of the in-memory sink and
//! the index which are meant for inspection.

pub mod aio;
pub mod case_hack;
pub mod config;
pub mod copy;
pub mod decoder;
pub mod dump;
pub mod entry;
pub mod error;
pub mod format;
pub mod index;
pub mod parser;
pub mod scan;
pub mod sink;
pub mod task;

pub use config::ArchiveSettings;
pub use copy::{copy_archive, CopyArchive};
pub use decoder::{Contents, Decoder};
pub use dump::{dump, dump_string, Dump};
pub use entry::{Directory, Entry, File, Symlink};
pub use error::ArchiveError;
pub use index::{create_index, IndexEntry, NarAccessor};
pub use parser::{Event, Parser, Step};
pub use scan::{
    dump_path, dump_path_and_get_mtime, prepare_dump, scan_path, MaxMtime, PreparedDump,
};
pub use sink::disk::{restore_path, DiskSink};
pub use sink::memory::{MemorySink, Node};
pub use sink::{parse_dump, FileSink, Sink};
pub use task::AbortHandle;
