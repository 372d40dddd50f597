//! In-memory reconstruction of an archive, mainly for verification.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{bail, format_err, Error};

use crate::entry::Entry;
use crate::error::ArchiveError;
use crate::sink::{FileSink, Sink};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    File { executable: bool, contents: Vec<u8> },
    Symlink { target: Vec<u8> },
    Directory(BTreeMap<Vec<u8>, Node>),
}

impl Node {
    /// Look up a direct child of a directory.
    pub fn get(&self, name: &[u8]) -> Option<&Node> {
        match self {
            Node::Directory(entries) => entries.get(name),
            _ => None,
        }
    }

    /// Turn the tree back into something the serializer accepts.
    pub fn to_entry(&self) -> Entry {
        match self {
            Node::File {
                executable,
                contents,
            } => Entry::file(*executable, contents.clone()),
            Node::Symlink { target } => Entry::symlink(target.clone()),
            Node::Directory(entries) => {
                let entries: Vec<_> = entries
                    .iter()
                    .map(|(name, node)| Ok((name.clone(), node.to_entry())))
                    .collect();
                Entry::directory(entries.into_iter())
            }
        }
    }
}

fn node_mut<'a>(node: &'a mut Node, path: &[Vec<u8>]) -> Option<&'a mut Node> {
    let mut node = node;
    for name in path {
        node = match node {
            Node::Directory(entries) => entries.get_mut(name)?,
            _ => return None,
        };
    }
    Some(node)
}

type Tree = Rc<RefCell<Option<Node>>>;

/// Builds a [`Node`] tree.
///
/// Existing names are never replaced. With `case_insensitive` set, names
/// differing only in ASCII case are treated as equal, the way a case
/// insensitive file system would.
pub struct MemorySink {
    tree: Tree,
    /// Directory this sink adds to, `None` for the top level sink.
    dir: Option<Vec<Vec<u8>>>,
    case_insensitive: bool,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            tree: Rc::new(RefCell::new(None)),
            dir: None,
            case_insensitive: false,
        }
    }

    /// Emulate a case insensitive destination.
    pub fn case_insensitive() -> Self {
        Self {
            case_insensitive: true,
            ..Self::new()
        }
    }

    /// The tree restored so far.
    pub fn root(&self) -> Option<Node> {
        self.tree.borrow().clone()
    }

    fn child(&self, dir: Vec<Vec<u8>>) -> Self {
        Self {
            tree: Rc::clone(&self.tree),
            dir: Some(dir),
            case_insensitive: self.case_insensitive,
        }
    }

    /// Insert `node` and return its path from the root.
    fn insert(&mut self, name: &[u8], node: Node) -> Result<Vec<Vec<u8>>, Error> {
        let mut tree = self.tree.borrow_mut();

        let dir = match &self.dir {
            None => {
                if !name.is_empty() {
                    bail!("top level entry must not have a name");
                }
                if tree.is_some() {
                    return Err(ArchiveError::Collision("root node already exists".into()).into());
                }
                *tree = Some(node);
                return Ok(Vec::new());
            }
            Some(dir) => dir,
        };

        let entries = match tree.as_mut().and_then(|root| node_mut(root, dir)) {
            Some(Node::Directory(entries)) => entries,
            _ => bail!("parent directory vanished"),
        };

        let exists = if self.case_insensitive {
            entries.keys().any(|key| key.eq_ignore_ascii_case(name))
        } else {
            entries.contains_key(name)
        };
        if exists {
            return Err(ArchiveError::Collision(format!(
                "{:?} already exists",
                String::from_utf8_lossy(name)
            ))
            .into());
        }
        entries.insert(name.to_vec(), node);

        let mut path = dir.clone();
        path.push(name.to_vec());
        Ok(path)
    }
}

impl Sink for MemorySink {
    fn create_directory(&mut self, name: &[u8]) -> Result<Box<dyn Sink>, Error> {
        let path = self.insert(name, Node::Directory(BTreeMap::new()))?;
        Ok(Box::new(self.child(path)))
    }

    fn create_file(
        &mut self,
        name: &[u8],
        size: u64,
        executable: bool,
    ) -> Result<Box<dyn FileSink>, Error> {
        let path = self.insert(
            name,
            Node::File {
                executable,
                contents: Vec::new(),
            },
        )?;
        Ok(Box::new(MemoryFile {
            tree: Rc::clone(&self.tree),
            path,
            data: Vec::with_capacity(size.min(1024 * 1024) as usize),
        }))
    }

    fn create_symlink(&mut self, name: &[u8], target: &[u8]) -> Result<(), Error> {
        self.insert(
            name,
            Node::Symlink {
                target: target.to_vec(),
            },
        )?;
        Ok(())
    }
}

struct MemoryFile {
    tree: Tree,
    path: Vec<Vec<u8>>,
    data: Vec<u8>,
}

impl FileSink for MemoryFile {
    fn receive(&mut self, data: &[u8]) -> Result<(), Error> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        let this = *self;
        let mut tree = this.tree.borrow_mut();
        match tree.as_mut().and_then(|root| node_mut(root, &this.path)) {
            Some(Node::File { contents, .. }) => {
                *contents = this.data;
                Ok(())
            }
            _ => Err(format_err!("restored file vanished")),
        }
    }
}
