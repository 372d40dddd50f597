//! Case hack handling.
//!
//! Archives may contain names which only differ in case. On case insensitive
//! file systems such entries would collide, so when the case hack is enabled
//! restored names get `~nix~case~hack~<n>` appended, and dumping strips that
//! suffix again. The mapping is recomputed for every directory listing.

use std::collections::BTreeMap;

use crate::format::{find, CASE_HACK_SUFFIX};

/// Remove the case hack suffix (and anything following it) from an on-disk
/// name. Returns `None` if the name carries no suffix.
pub fn strip_suffix(name: &[u8]) -> Option<&[u8]> {
    find(name, CASE_HACK_SUFFIX).map(|pos| &name[..pos])
}

/// Append the case hack suffix with the disambiguation counter `n`.
pub fn append_suffix(name: &mut Vec<u8>, n: u32) {
    name.extend_from_slice(CASE_HACK_SUFFIX);
    name.extend_from_slice(n.to_string().as_bytes());
}

/// Tracks names of one directory while parsing and renames entries colliding
/// with an earlier one when compared ASCII case-insensitively.
#[derive(Default)]
pub struct CaseHackNames {
    names: BTreeMap<Vec<u8>, u32>,
}

impl CaseHackNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the name the entry should be restored as.
    pub fn rename(&mut self, name: Vec<u8>) -> Vec<u8> {
        let key = name.to_ascii_lowercase();
        match self.names.get_mut(&key) {
            Some(counter) => {
                *counter += 1;
                let mut renamed = name;
                append_suffix(&mut renamed, *counter);
                log::debug!(
                    "case collision for {:?}, renamed to {:?}",
                    String::from_utf8_lossy(&key),
                    String::from_utf8_lossy(&renamed),
                );
                renamed
            }
            None => {
                self.names.insert(key, 0);
                name
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_strip_suffix() {
        assert_eq!(strip_suffix(b"README~nix~case~hack~1"), Some(&b"README"[..]));
        assert_eq!(strip_suffix(b"README"), None);
        assert_eq!(strip_suffix(b"~nix~case~hack~"), Some(&b""[..]));
    }

    #[test]
    fn test_rename_collisions() {
        let mut names = CaseHackNames::new();
        assert_eq!(names.rename(b"FOO".to_vec()), b"FOO".to_vec());
        assert_eq!(names.rename(b"bar".to_vec()), b"bar".to_vec());
        assert_eq!(names.rename(b"foo".to_vec()), b"foo~nix~case~hack~1".to_vec());
        assert_eq!(names.rename(b"fOo".to_vec()), b"fOo~nix~case~hack~2".to_vec());
    }
}
