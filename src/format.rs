//! Wire format constants and token encoding.

use bytes::{BufMut, BytesMut};

use crate::error::ArchiveError;

// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

/// The archive header, encoded as a regular string.
pub const NAR_VERSION_MAGIC_1: &[u8] = b"nix-archive-1";

/// Marker used to disambiguate file names on case insensitive file systems.
/// Never part of a canonical archive.
pub const CASE_HACK_SUFFIX: &[u8] = b"~nix~case~hack~";

/// Block size used when streaming file contents.
pub const CONTENT_BLOCK_SIZE: usize = 64 * 1024;

/// Upper bound for strings (tags, names and symlink targets). The parser
/// rejects longer strings and the serializer refuses to write them.
pub const MAX_STRING_SIZE: u64 = 64 * 1024;

pub(crate) const OPEN: &[u8] = b"(";
pub(crate) const CLOSE: &[u8] = b")";
pub(crate) const TYPE: &[u8] = b"type";
pub(crate) const REGULAR: &[u8] = b"regular";
pub(crate) const SYMLINK: &[u8] = b"symlink";
pub(crate) const DIRECTORY: &[u8] = b"directory";
pub(crate) const EXECUTABLE: &[u8] = b"executable";
pub(crate) const CONTENTS: &[u8] = b"contents";
pub(crate) const TARGET: &[u8] = b"target";
pub(crate) const ENTRY: &[u8] = b"entry";
pub(crate) const NAME: &[u8] = b"name";
pub(crate) const NODE: &[u8] = b"node";

const ZEROS: [u8; 8] = [0u8; 8];

/// Number of zero bytes following `len` bytes of data.
#[inline]
pub fn padding_len(len: u64) -> usize {
    ((8 - len % 8) % 8) as usize
}

#[inline]
pub fn put_u64(out: &mut BytesMut, value: u64) {
    out.put_u64_le(value);
}

#[inline]
pub fn put_padding(out: &mut BytesMut, len: u64) {
    out.put_slice(&ZEROS[..padding_len(len)]);
}

/// Append a length prefixed, zero padded string.
pub fn put_str(out: &mut BytesMut, data: &[u8]) {
    put_u64(out, data.len() as u64);
    out.put_slice(data);
    put_padding(out, data.len() as u64);
}

/// Append the tokens opening a regular file node, up to and including the
/// content size. The caller appends the contents followed by
/// [`put_file_trailer`].
pub fn put_file_header(out: &mut BytesMut, executable: bool, size: u64) {
    put_str(out, OPEN);
    put_str(out, TYPE);
    put_str(out, REGULAR);
    if executable {
        put_str(out, EXECUTABLE);
        put_str(out, b"");
    }
    put_str(out, CONTENTS);
    put_u64(out, size);
}

pub fn put_file_trailer(out: &mut BytesMut, size: u64) {
    put_padding(out, size);
    put_str(out, CLOSE);
}

pub fn put_symlink(out: &mut BytesMut, target: &[u8]) {
    put_str(out, OPEN);
    put_str(out, TYPE);
    put_str(out, SYMLINK);
    put_str(out, TARGET);
    put_str(out, target);
    put_str(out, CLOSE);
}

pub fn put_directory_header(out: &mut BytesMut) {
    put_str(out, OPEN);
    put_str(out, TYPE);
    put_str(out, DIRECTORY);
}

/// Tokens preceding the node of a directory entry. The entry is completed by
/// the node itself and a closing [`put_entry_trailer`].
pub fn put_entry_header(out: &mut BytesMut, name: &[u8]) {
    put_str(out, ENTRY);
    put_str(out, OPEN);
    put_str(out, NAME);
    put_str(out, name);
    put_str(out, NODE);
}

pub fn put_entry_trailer(out: &mut BytesMut) {
    put_str(out, CLOSE);
}

/// Closes both directories and the nodes of files and symlinks.
pub fn put_close(out: &mut BytesMut) {
    put_str(out, CLOSE);
}

/// Check if `name` may appear as a directory entry name inside an archive.
///
/// Names must be a single non-empty path component and must not contain the
/// case hack marker, which only exists on disk.
pub fn check_entry_name(name: &[u8]) -> Result<(), ArchiveError> {
    if name.is_empty()
        || name == b"."
        || name == b".."
        || name.contains(&b'/')
        || name.contains(&0)
        || contains(name, CASE_HACK_SUFFIX)
    {
        return Err(ArchiveError::format(format!(
            "invalid file name {:?}",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

/// Check a name or symlink target against [`MAX_STRING_SIZE`].
pub fn check_string_size(data: &[u8], what: &str) -> Result<(), ArchiveError> {
    if data.len() as u64 > MAX_STRING_SIZE {
        return Err(ArchiveError::format(format!(
            "{} too long ({} bytes)",
            what,
            data.len()
        )));
    }
    Ok(())
}

/// Byte substring search.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_string_padding() {
        let mut out = BytesMut::new();
        put_str(&mut out, b"hello");
        assert_eq!(
            &out[..],
            b"\x05\0\0\0\0\0\0\0hello\0\0\0".as_slice()
        );

        out.clear();
        put_str(&mut out, b"block000");
        assert_eq!(out.len(), 16);

        out.clear();
        put_str(&mut out, b"");
        assert_eq!(&out[..], &[0u8; 8][..]);
    }

    #[test]
    fn test_padding_len() {
        assert_eq!(padding_len(0), 0);
        assert_eq!(padding_len(5), 3);
        assert_eq!(padding_len(8), 0);
        assert_eq!(padding_len(9), 7);
    }

    #[test]
    fn test_entry_names() {
        for bad in [
            &b""[..],
            b".",
            b"..",
            b"a/b",
            b"a\0b",
            b"foo~nix~case~hack~1",
        ] {
            assert!(check_entry_name(bad).is_err(), "{:?} accepted", bad);
        }

        for good in [&b"a"[..], b"...", b".hidden", b"~nix~case~hac"] {
            assert!(check_entry_name(good).is_ok(), "{:?} rejected", good);
        }
    }
}
