//! Restoration visitor.
//!
//! A parsed archive is pushed into a [`Sink`] depth first. Directories return
//! a new sink scoped to the directory, files return a [`FileSink`] which gets
//! the contents in order and is closed exactly once.
//!
//! The root node of an archive has an empty name; a sink receiving an empty
//! name creates the node at its own target location.

use std::io::Read;

use anyhow::{bail, format_err, Context, Error};

use crate::config::ArchiveSettings;
use crate::decoder::Decoder;
use crate::parser::Event;

pub mod disk;
pub mod memory;

pub trait Sink {
    /// Create a directory and return a sink for its entries.
    fn create_directory(&mut self, name: &[u8]) -> Result<Box<dyn Sink>, Error>;

    /// Create a regular file of `size` bytes.
    fn create_file(
        &mut self,
        name: &[u8],
        size: u64,
        executable: bool,
    ) -> Result<Box<dyn FileSink>, Error>;

    fn create_symlink(&mut self, name: &[u8], target: &[u8]) -> Result<(), Error>;
}

/// Receives the contents of one regular file.
pub trait FileSink {
    fn receive(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Finish the file. Called once after all contents were received.
    fn close(self: Box<Self>) -> Result<(), Error>;
}

/// Tracks the sinks of the currently open directories while events are
/// pushed through.
pub(crate) struct SinkStack<'a> {
    root: &'a mut dyn Sink,
    dirs: Vec<(Vec<u8>, Box<dyn Sink>)>,
}

impl<'a> SinkStack<'a> {
    pub(crate) fn new(root: &'a mut dyn Sink) -> Self {
        Self {
            root,
            dirs: Vec::new(),
        }
    }

    fn parent(&mut self) -> &mut dyn Sink {
        match self.dirs.last_mut() {
            Some((_, dir)) => &mut **dir,
            None => &mut *self.root,
        }
    }

    /// Archive path of `name` relative to the root, for error messages.
    pub(crate) fn path(&self, name: &[u8]) -> String {
        let mut path = String::from("/");
        for (dir, _) in self.dirs.iter().skip(1) {
            path.push_str(&String::from_utf8_lossy(dir));
            path.push('/');
        }
        path.push_str(&String::from_utf8_lossy(name));
        path
    }

    /// Dispatch one event. For files the returned sink must receive the
    /// contents and be closed by the caller.
    pub(crate) fn handle(&mut self, event: Event) -> Result<Option<Box<dyn FileSink>>, Error> {
        match event {
            Event::Directory { name } => {
                let dir = self
                    .parent()
                    .create_directory(&name)
                    .with_context(|| format!("failed to create directory {:?}", self.path(&name)))?;
                self.dirs.push((name, dir));
                Ok(None)
            }
            Event::EndDirectory => match self.dirs.pop() {
                Some(_) => Ok(None),
                None => bail!("unexpected end of directory"),
            },
            Event::File {
                name,
                executable,
                size,
            } => {
                let file = self
                    .parent()
                    .create_file(&name, size, executable)
                    .with_context(|| format!("failed to create file {:?}", self.path(&name)))?;
                Ok(Some(file))
            }
            Event::Symlink { name, target } => {
                self.parent()
                    .create_symlink(&name, &target)
                    .with_context(|| format!("failed to create symlink {:?}", self.path(&name)))?;
                Ok(None)
            }
        }
    }
}

/// Parse an archive from `input` and push it into `sink`.
///
/// Stops at the first error. Whatever was created up to that point stays.
pub fn parse_dump<R: Read>(
    sink: &mut dyn Sink,
    input: R,
    settings: &ArchiveSettings,
) -> Result<(), Error> {
    restore(sink, Decoder::new(input, settings)?)
}

/// Push the remaining events of `decoder` into `sink`.
pub fn restore<R: Read>(sink: &mut dyn Sink, mut decoder: Decoder<R>) -> Result<(), Error> {
    let mut stack = SinkStack::new(sink);

    while let Some(event) = decoder.next_event()? {
        let mut file = match stack.handle(event)? {
            Some(file) => file,
            None => continue,
        };

        let mut contents = decoder
            .contents()
            .ok_or_else(|| format_err!("found regular file entry without contents in archive"))?;
        while let Some(chunk) = contents.next_chunk()? {
            file.receive(&chunk)?;
        }
        file.close()?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::dump::dump;
    use crate::entry::Entry;

    /// Records all calls in order.
    #[derive(Clone, Default)]
    struct Recorder {
        prefix: String,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Recorder {
        fn child(&self, name: &[u8]) -> String {
            if name.is_empty() {
                return "/".to_string();
            }
            let name = String::from_utf8_lossy(name);
            if self.prefix.ends_with('/') {
                format!("{}{}", self.prefix, name)
            } else {
                format!("{}/{}", self.prefix, name)
            }
        }
    }

    struct RecordedFile {
        path: String,
        data: Vec<u8>,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Sink for Recorder {
        fn create_directory(&mut self, name: &[u8]) -> Result<Box<dyn Sink>, Error> {
            let prefix = self.child(name);
            self.log.borrow_mut().push(format!("dir {}", prefix));
            Ok(Box::new(Recorder {
                prefix,
                log: Rc::clone(&self.log),
            }))
        }

        fn create_file(
            &mut self,
            name: &[u8],
            size: u64,
            executable: bool,
        ) -> Result<Box<dyn FileSink>, Error> {
            let path = self.child(name);
            self.log
                .borrow_mut()
                .push(format!("file {} {} {}", path, size, executable));
            Ok(Box::new(RecordedFile {
                path,
                data: Vec::new(),
                log: Rc::clone(&self.log),
            }))
        }

        fn create_symlink(&mut self, name: &[u8], target: &[u8]) -> Result<(), Error> {
            let path = self.child(name);
            self.log.borrow_mut().push(format!(
                "symlink {} -> {}",
                path,
                String::from_utf8_lossy(target)
            ));
            Ok(())
        }
    }

    impl FileSink for RecordedFile {
        fn receive(&mut self, data: &[u8]) -> Result<(), Error> {
            self.data.extend_from_slice(data);
            Ok(())
        }

        fn close(self: Box<Self>) -> Result<(), Error> {
            self.log.borrow_mut().push(format!(
                "close {} {:?}",
                self.path,
                String::from_utf8_lossy(&self.data)
            ));
            Ok(())
        }
    }

    #[test]
    fn test_visit_order() -> Result<(), Error> {
        let root = Entry::directory_from(vec![
            ("z", Entry::symlink("a")),
            (
                "d",
                Entry::directory_from(vec![("f", Entry::file(true, &b"data"[..]))]),
            ),
            ("a", Entry::directory_from(Vec::<(&str, Entry)>::new())),
        ]);
        let data = dump(root).to_vec()?;

        let mut recorder = Recorder::default();
        parse_dump(
            &mut recorder,
            &data[..],
            &ArchiveSettings::default().with_case_hack(false),
        )?;

        let log = recorder.log.borrow();
        assert_eq!(
            *log,
            vec![
                "dir /",
                "dir /a",
                "dir /d",
                "file /d/f 4 true",
                "close /d/f \"data\"",
                "symlink /z -> a",
            ]
        );
        Ok(())
    }
}
