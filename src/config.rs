//! Settings for the scanner, parser and restore code.

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Environment variable overriding [`ArchiveSettings::use_case_hack`].
pub const ENV_USE_CASE_HACK: &str = "NAR_USE_CASE_HACK";

/// Environment variable overriding [`ArchiveSettings::preallocate_contents`].
pub const ENV_PREALLOCATE_CONTENTS: &str = "NAR_PREALLOCATE_CONTENTS";

/// Archive codec settings.
///
/// These are plain values handed in by whoever loads the configuration, they
/// are threaded through the constructors instead of being global state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ArchiveSettings {
    /// Rename colliding file names on case insensitive file systems by
    /// appending `~nix~case~hack~<n>` when restoring, and remove the suffix
    /// again when dumping.
    pub use_case_hack: bool,
    /// Preallocate the full size of regular files while restoring.
    pub preallocate_contents: bool,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            use_case_hack: cfg!(target_os = "macos"),
            preallocate_contents: false,
        }
    }
}

impl ArchiveSettings {
    /// Defaults overlaid with the `NAR_*` environment variables.
    pub fn from_env() -> Result<Self, Error> {
        let mut settings = Self::default();
        if let Some(value) = env_bool(ENV_USE_CASE_HACK)? {
            settings.use_case_hack = value;
        }
        if let Some(value) = env_bool(ENV_PREALLOCATE_CONTENTS)? {
            settings.preallocate_contents = value;
        }
        Ok(settings)
    }

    pub fn with_case_hack(mut self, enable: bool) -> Self {
        self.use_case_hack = enable;
        self
    }

    pub fn with_preallocation(mut self, enable: bool) -> Self {
        self.preallocate_contents = enable;
        self
    }
}

fn env_bool(name: &str) -> Result<Option<bool>, Error> {
    match std::env::var(name) {
        Ok(value) => match parse_bool(&value) {
            Some(value) => Ok(Some(value)),
            None => bail!("invalid boolean value {:?} in environment variable {}", value, name),
        },
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => bail!("unable to read environment variable {} - {}", name, err),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_settings_from_json() -> Result<(), Error> {
        let settings: ArchiveSettings =
            serde_json::from_str(r#"{ "use-case-hack": true, "preallocate-contents": true }"#)?;
        assert!(settings.use_case_hack);
        assert!(settings.preallocate_contents);

        let settings: ArchiveSettings = serde_json::from_str(r#"{ "use-case-hack": true }"#)?;
        assert!(settings.use_case_hack);
        assert!(!settings.preallocate_contents);

        Ok(())
    }
}
