use std::fs;

use anyhow::Error;

use nar_codec::{
    copy_archive, create_index, dump, dump_path, parse_dump, restore_path, ArchiveError,
    ArchiveSettings, Decoder, Entry, Event, IndexEntry, MemorySink, Node, Sink,
};

fn settings() -> ArchiveSettings {
    ArchiveSettings::default().with_case_hack(false)
}

fn put_str(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    out.resize(out.len() + (8 - data.len() % 8) % 8, 0);
}

fn tokens(list: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for token in list {
        put_str(&mut out, token);
    }
    out
}

/// Directory archive with one empty regular file for each of `names`, in the
/// given order.
fn directory_archive(names: &[&[u8]]) -> Vec<u8> {
    let mut out = tokens(&[b"nix-archive-1", b"(", b"type", b"directory"]);
    for name in names {
        out.extend(tokens(&[b"entry", b"(", b"name", *name, b"node"]));
        out.extend(tokens(&[b"(", b"type", b"regular", b"contents"]));
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend(tokens(&[b")", b")"]));
    }
    out.extend(tokens(&[b")"]));
    out
}

fn archive_error(err: &Error) -> &ArchiveError {
    err.downcast_ref::<ArchiveError>()
        .unwrap_or_else(|| panic!("not an archive error: {:#}", err))
}

fn parse(data: &[u8]) -> Result<Node, Error> {
    let mut sink = MemorySink::new();
    parse_dump(&mut sink, data, &settings())?;
    Ok(sink.root().unwrap())
}

fn sample_tree() -> Entry {
    Entry::directory_from(vec![
        ("a.txt", Entry::file(false, &b"hi"[..])),
        (
            "bin",
            Entry::directory_from(vec![("run", Entry::file(true, &b""[..]))]),
        ),
    ])
}

#[test]
#[rustfmt::skip]
fn test_scenario_bytes() -> Result<(), Error> {
    let data = dump(sample_tree()).to_vec()?;

    let mut expected = tokens(&[
        b"nix-archive-1", b"(", b"type", b"directory",
        b"entry", b"(", b"name", b"a.txt", b"node",
        b"(", b"type", b"regular", b"contents",
    ]);
    expected.extend_from_slice(&2u64.to_le_bytes());
    expected.extend_from_slice(b"hi\0\0\0\0\0\0");
    expected.extend(tokens(&[
        b")", b")",
        b"entry", b"(", b"name", b"bin", b"node",
        b"(", b"type", b"directory",
        b"entry", b"(", b"name", b"run", b"node",
        b"(", b"type", b"regular", b"executable", b"", b"contents",
    ]));
    expected.extend_from_slice(&0u64.to_le_bytes());
    expected.extend(tokens(&[b")", b")", b")", b")", b")"]));

    assert_eq!(data, expected);
    Ok(())
}

#[test]
fn test_round_trip() -> Result<(), Error> {
    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let root = Entry::directory_from(vec![
        ("big", Entry::file(false, big.clone())),
        ("empty-dir", Entry::directory_from(Vec::<(&str, Entry)>::new())),
        ("link", Entry::symlink("big")),
        ("x", Entry::file(true, &b"exec\n"[..])),
    ]);
    let data = dump(root).to_vec()?;
    let tree = parse(&data)?;

    assert_eq!(
        tree.get(b"big"),
        Some(&Node::File {
            executable: false,
            contents: big
        })
    );
    assert_eq!(tree.get(b"empty-dir"), Some(&Node::Directory(Default::default())));
    assert_eq!(
        tree.get(b"link"),
        Some(&Node::Symlink {
            target: b"big".to_vec()
        })
    );
    assert_eq!(dump(tree.to_entry()).to_vec()?, data);

    for root in [Entry::file(false, &b"top"[..]), Entry::symlink("/nix/store")] {
        let data = dump(root).to_vec()?;
        assert_eq!(dump(parse(&data)?.to_entry()).to_vec()?, data);
    }
    Ok(())
}

#[test]
fn test_copy_is_identity() -> Result<(), Error> {
    let data = dump(sample_tree()).to_vec()?;
    let mut copied = Vec::new();
    let written = copy_archive(&data[..])?.write_to(&mut copied)?;
    assert_eq!(written, data.len() as u64);
    assert_eq!(copied, data);
    Ok(())
}

#[test]
fn test_unsorted_directory() {
    let data = directory_archive(&[b"b", b"a"]);
    let err = parse(&data).unwrap_err();
    assert!(archive_error(&err).is_format());
    assert!(format!("{:#}", err).contains("directory is not sorted"));

    let data = directory_archive(&[b"a", b"a"]);
    assert!(archive_error(&parse(&data).unwrap_err()).is_format());

    assert!(parse(&directory_archive(&[b"a", b"b"])).is_ok());
}

#[test]
fn test_invalid_names() {
    for name in [
        &b""[..],
        b".",
        b"..",
        b"a/b",
        b"foo~nix~case~hack~1",
    ] {
        let data = directory_archive(&[name]);
        let err = parse(&data).unwrap_err();
        assert!(
            archive_error(&err).is_format(),
            "name {:?} not rejected",
            String::from_utf8_lossy(name)
        );
    }
}

#[test]
fn test_padding() -> Result<(), Error> {
    for (size, padding) in [(5usize, 3usize), (8, 0)] {
        let data = dump(Entry::file(false, vec![1u8; size])).to_vec()?;
        let trailer = tokens(&[b")"]);
        let end = data.len() - trailer.len();
        assert_eq!(&data[end..], &trailer[..]);
        assert_eq!(&data[end - padding - size..end - padding], &vec![1u8; size][..]);
        assert!(data[end - padding..end].iter().all(|b| *b == 0));
        let size_field = &data[end - padding - size - 8..end - padding - size];
        assert_eq!(size_field, &(size as u64).to_le_bytes());
    }
    Ok(())
}

#[test]
fn test_truncated() -> Result<(), Error> {
    let data = dump(sample_tree()).to_vec()?;
    let short = &data[..data.len() - 4];

    assert!(archive_error(&parse(short).unwrap_err()).is_format());

    let res = copy_archive(short).and_then(|copy| copy.write_to(&mut Vec::new()));
    assert!(archive_error(&res.unwrap_err()).is_format());

    let res: Result<Vec<Event>, Error> = Decoder::new(short, &settings())?.collect();
    assert!(res.is_err());
    Ok(())
}

#[test]
fn test_case_insensitive_restore() -> Result<(), Error> {
    // valid archive, "README" < "readme"
    let mut data = tokens(&[b"nix-archive-1", b"(", b"type", b"directory"]);
    let files: [(&[u8], &[u8]); 2] = [(b"README", b"first"), (b"readme", b"second")];
    for (name, contents) in files {
        data.extend(tokens(&[b"entry", b"(", b"name", name, b"node"]));
        data.extend(tokens(&[b"(", b"type", b"regular", b"contents"]));
        data.extend_from_slice(&(contents.len() as u64).to_le_bytes());
        data.extend_from_slice(contents);
        data.resize(data.len() + (8 - contents.len() % 8) % 8, 0);
        data.extend(tokens(&[b")", b")"]));
    }
    data.extend(tokens(&[b")"]));

    let mut sink = MemorySink::case_insensitive();
    let err = parse_dump(&mut sink, &data[..], &settings()).unwrap_err();
    assert!(archive_error(&err).is_collision());
    assert_eq!(
        sink.root().unwrap().get(b"README"),
        Some(&Node::File {
            executable: false,
            contents: b"first".to_vec()
        })
    );

    // with the case hack the second name gets renamed instead
    let mut sink = MemorySink::case_insensitive();
    parse_dump(
        &mut sink,
        &data[..],
        &ArchiveSettings::default().with_case_hack(true),
    )?;
    let tree = sink.root().unwrap();
    assert!(tree.get(b"readme~nix~case~hack~1").is_some());
    Ok(())
}

#[test]
fn test_disk_restore_never_overwrites() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let data = dump(sample_tree()).to_vec()?;

    let target = dir.path().join("out");
    restore_path(&target, &data[..], &settings())?;
    assert_eq!(fs::read(target.join("a.txt"))?, b"hi");

    // scan it again, the archive must be identical
    assert_eq!(dump_path(&target, &settings())?.to_vec()?, data);

    let other = dump(Entry::directory_from(vec![(
        "a.txt",
        Entry::file(false, &b"evil"[..]),
    )]))
    .to_vec()?;
    let target2 = dir.path().join("out2");
    fs::create_dir(&target2)?;
    fs::write(target2.join("a.txt"), b"keep")?;

    let err = restore_path(&target2, &other[..], &settings()).unwrap_err();
    assert!(archive_error(&err).is_collision());
    assert_eq!(fs::read(target2.join("a.txt"))?, b"keep");
    Ok(())
}

#[test]
fn test_index_matches_archive() -> Result<(), Error> {
    let data = dump(sample_tree()).to_vec()?;
    let index = create_index(&data[..])?;

    let mut paths = Vec::new();
    index.walk(&mut |path, entry| paths.push((path.to_string(), entry.type_str())));
    assert_eq!(
        paths,
        vec![
            ("/".to_string(), "directory"),
            ("/a.txt".to_string(), "regular"),
            ("/bin".to_string(), "directory"),
            ("/bin/run".to_string(), "regular"),
        ]
    );

    match index.lookup("/a.txt") {
        Some(IndexEntry::File { size: 2, offset, .. }) => {
            let offset = *offset as usize;
            assert_eq!(&data[offset..offset + 2], b"hi");
        }
        other => panic!("unexpected index entry {:?}", other),
    }
    Ok(())
}

#[test]
fn test_sink_sees_root_with_empty_name() -> Result<(), Error> {
    struct Names(Vec<Vec<u8>>);

    impl Sink for Names {
        fn create_directory(&mut self, name: &[u8]) -> Result<Box<dyn Sink>, Error> {
            self.0.push(name.to_vec());
            Ok(Box::new(Names(Vec::new())))
        }

        fn create_file(
            &mut self,
            _name: &[u8],
            _size: u64,
            _executable: bool,
        ) -> Result<Box<dyn nar_codec::FileSink>, Error> {
            anyhow::bail!("unexpected file")
        }

        fn create_symlink(&mut self, name: &[u8], _target: &[u8]) -> Result<(), Error> {
            self.0.push(name.to_vec());
            Ok(())
        }
    }

    let data = dump(Entry::directory_from(vec![("l", Entry::symlink("x"))])).to_vec()?;
    let mut names = Names(Vec::new());
    parse_dump(&mut names, &data[..], &settings())?;
    assert_eq!(names.0, vec![Vec::<u8>::new()]);
    Ok(())
}

#[tokio::test]
async fn test_async_parity() -> Result<(), Error> {
    let data = dump(sample_tree()).to_vec()?;

    let mut sink = MemorySink::new();
    nar_codec::aio::restore(&mut sink, &data[..], &settings()).await?;
    assert_eq!(Some(parse(&data)?), sink.root());

    let mut copied = Vec::new();
    nar_codec::aio::copy_archive(&data[..], &mut copied).await?;
    assert_eq!(copied, data);

    let res = nar_codec::aio::copy_archive(&data[..data.len() - 4], &mut Vec::new()).await;
    assert!(archive_error(&res.unwrap_err()).is_format());
    Ok(())
}
