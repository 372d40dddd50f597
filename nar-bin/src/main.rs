use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use tokio::io::{AsyncRead, AsyncWrite};

use pathpatterns::{MatchEntry, MatchList, MatchType, PatternFlag};

use proxmox_router::cli::*;
use proxmox_schema::api;

use nar_codec::{ArchiveSettings, IndexEntry, NarAccessor};

fn open_archive(archive: &str) -> Result<Box<dyn std::io::Read>, Error> {
    if archive == "-" {
        return Ok(Box::new(std::io::stdin().lock()));
    }
    log::debug!("NAR open: {}", archive);
    let file = std::fs::File::open(archive)
        .with_context(|| format!("unable to open archive {:?}", archive))?;
    Ok(Box::new(std::io::BufReader::with_capacity(1024 * 1024, file)))
}

fn create_output(path: &str) -> Result<Box<dyn Write>, Error> {
    if path == "-" {
        return Ok(Box::new(std::io::stdout().lock()));
    }
    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("unable to create {:?}", path))?;
    Ok(Box::new(std::io::BufWriter::with_capacity(1024 * 1024, file)))
}

/// `pathpatterns` match against the path below `source`, rooted at `/`.
fn is_excluded(patterns: &[MatchEntry], source: &Path, path: &Path) -> bool {
    let relative = match path.strip_prefix(source) {
        Ok(relative) => relative,
        Err(_) => return false,
    };
    let mut match_path = PathBuf::from("/");
    match_path.push(relative);

    // only needed for directory-only patterns, the scanner reports real
    // errors on its own
    let mode = nix::sys::stat::lstat(path)
        .map(|stat| stat.st_mode)
        .unwrap_or(0);

    matches!(
        patterns.matches(match_path.as_os_str().as_bytes(), mode),
        Ok(Some(MatchType::Exclude))
    )
}

#[api(
    input: {
        properties: {
            source: {
                description: "File or directory to archive.",
            },
            archive: {
                description: "Archive name, '-' writes to stdout.",
            },
            exclude: {
                description: "List of paths or pattern matching files to exclude.",
                optional: true,
                type: Array,
                items: {
                    description: "Path or pattern matching files to exclude.",
                    type: String,
                },
            },
        },
    },
)]
/// Create a new archive.
fn create_archive(
    source: String,
    archive: String,
    exclude: Option<Vec<String>>,
) -> Result<(), Error> {
    let settings = ArchiveSettings::from_env()?;

    let mut patterns = Vec::new();
    for entry in exclude.unwrap_or_default() {
        patterns.push(
            MatchEntry::parse_pattern(entry, PatternFlag::PATH_NAME, MatchType::Exclude)
                .map_err(|err| format_err!("error in exclude pattern: {}", err))?,
        );
    }

    let source = PathBuf::from(source);
    let prepared = nar_codec::prepare_dump(&source, &settings, |path| {
        if is_excluded(&patterns, &source, path) {
            log::debug!("exclude {:?}", path);
            return false;
        }
        true
    })?;

    let mut writer = create_output(&archive)?;
    let written = prepared.dump().write_to(&mut writer)?;
    writer.flush().context("failed to flush archive")?;

    log::debug!("wrote {} bytes, newest mtime {}", written, prepared.max_mtime());

    Ok(())
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name, '-' reads from stdin.",
            },
            target: {
                description: "Target path, must not exist yet.",
            },
        },
    },
)]
/// Restore an archive.
fn restore_archive(archive: String, target: String) -> Result<(), Error> {
    let settings = ArchiveSettings::from_env()?;
    let reader = open_archive(&archive)?;
    nar_codec::restore_path(&target, reader, &settings)
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name, '-' reads from stdin.",
            },
            json: {
                description: "Print the JSON listing including file offsets.",
                optional: true,
                default: false,
            },
        },
    },
)]
/// List the contents of an archive.
fn list_archive(archive: String, json: bool) -> Result<(), Error> {
    let index = nar_codec::create_index(open_archive(&archive)?)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&index.to_json())?);
        return Ok(());
    }

    index.walk(&mut |path, entry| {
        if log::log_enabled!(log::Level::Debug) {
            match entry {
                IndexEntry::File {
                    executable, size, ..
                } => log::debug!(
                    "{} {:>12} {}",
                    if *executable { "-r-x" } else { "-r--" },
                    size,
                    path
                ),
                IndexEntry::Symlink { target } => log::debug!(
                    "lrwx {:>12} {} -> {}",
                    "",
                    path,
                    String::from_utf8_lossy(target)
                ),
                IndexEntry::Directory(_) => log::debug!("dr-x {:>12} {}", "", path),
            }
        } else {
            log::info!("{}", path);
        }
    });

    Ok(())
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name.",
            },
            path: {
                description: "Path of a regular file inside the archive.",
            },
        },
    },
)]
/// Print a single file of an archive.
fn cat_file(archive: String, path: String) -> Result<(), Error> {
    if archive == "-" {
        bail!("cat needs a seekable archive");
    }
    let file = std::fs::File::open(&archive)
        .with_context(|| format!("unable to open archive {:?}", archive))?;
    let mut accessor = NarAccessor::new(std::io::BufReader::new(file))?;

    let mut reader = accessor.open_file(&path)?;
    let size = reader.limit();
    let mut stdout = std::io::stdout().lock();
    let copied = std::io::copy(&mut reader, &mut stdout)?;
    if copied != size {
        bail!("archive truncated while reading {:?}", path);
    }
    stdout.flush()?;

    Ok(())
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name, '-' reads from stdin.",
            },
            output: {
                description: "Output archive name, '-' writes to stdout.",
            },
        },
    },
)]
/// Validate an archive and write it out again.
async fn copy_archive(archive: String, output: String) -> Result<(), Error> {
    let input: Box<dyn AsyncRead + Unpin + Send> = if archive == "-" {
        Box::new(tokio::io::stdin())
    } else {
        let file = tokio::fs::File::open(&archive)
            .await
            .with_context(|| format!("unable to open archive {:?}", archive))?;
        Box::new(tokio::io::BufReader::new(file))
    };

    let mut writer: Box<dyn AsyncWrite + Unpin + Send> = if output == "-" {
        Box::new(tokio::io::stdout())
    } else {
        let file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .mode(0o644)
            .open(&output)
            .await
            .with_context(|| format!("unable to create {:?}", output))?;
        Box::new(tokio::io::BufWriter::with_capacity(1024 * 1024, file))
    };

    let written = nar_codec::aio::copy_archive(input, &mut writer).await?;
    log::debug!("copied {} bytes", written);

    Ok(())
}

fn main() {
    init_cli_logger("NAR_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert(
            "dump",
            CliCommand::new(&API_METHOD_CREATE_ARCHIVE)
                .arg_param(&["source", "archive"])
                .completion_cb("source", complete_file_name)
                .completion_cb("archive", complete_file_name),
        )
        .insert(
            "restore",
            CliCommand::new(&API_METHOD_RESTORE_ARCHIVE)
                .arg_param(&["archive", "target"])
                .completion_cb("archive", complete_file_name)
                .completion_cb("target", complete_file_name),
        )
        .insert(
            "list",
            CliCommand::new(&API_METHOD_LIST_ARCHIVE)
                .arg_param(&["archive"])
                .completion_cb("archive", complete_file_name),
        )
        .insert(
            "cat",
            CliCommand::new(&API_METHOD_CAT_FILE)
                .arg_param(&["archive", "path"])
                .completion_cb("archive", complete_file_name),
        )
        .insert(
            "copy",
            CliCommand::new(&API_METHOD_COPY_ARCHIVE)
                .arg_param(&["archive", "output"])
                .completion_cb("archive", complete_file_name)
                .completion_cb("output", complete_file_name),
        );

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| proxmox_async::runtime::main(future)),
    );
}
