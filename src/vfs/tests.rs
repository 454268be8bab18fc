#![cfg(test)]

use super::*;

fn write_file(fs: &VirtualFs, path: &str, bytes: &[u8]) {
    let flags = OpenFlags { create: true, ..OpenFlags::write_truncate() };
    let h = fs.open(path, flags).expect("open for write");
    fs.write(h, 0, bytes).expect("write");
    fs.close(h).expect("close");
}

fn read_file(fs: &VirtualFs, path: &str) -> Vec<u8> {
    let h = fs.open(path, OpenFlags::read_only()).expect("open for read");
    let out = fs.read(h, 0, usize::MAX / 2).expect("read");
    fs.close(h).expect("close");
    out
}

#[test]
fn write_then_read_round_trip() {
    let fs = VirtualFs::new();
    write_file(&fs, "/data.bin", b"hello staging area");
    assert_eq!(read_file(&fs, "/data.bin"), b"hello staging area");
}

#[test]
fn read_at_offset() {
    let fs = VirtualFs::new();
    write_file(&fs, "/data.bin", b"0123456789");
    let h = fs.open("/data.bin", OpenFlags::read_only()).unwrap();
    assert_eq!(fs.read(h, 4, 3).unwrap(), b"456");
    // Reads past the end are truncated, not errors.
    assert_eq!(fs.read(h, 8, 16).unwrap(), b"89");
    assert_eq!(fs.read(h, 32, 4).unwrap(), b"");
    fs.close(h).unwrap();
}

#[test]
fn write_at_offset_zero_fills_gap() {
    let fs = VirtualFs::new();
    let flags = OpenFlags { create: true, write: true, ..OpenFlags::default() };
    let h = fs.open("/gap.bin", flags).unwrap();
    fs.write(h, 4, b"xy").unwrap();
    fs.close(h).unwrap();
    assert_eq!(read_file(&fs, "/gap.bin"), vec![0, 0, 0, 0, b'x', b'y']);
}

#[test]
fn open_without_create_fails_on_missing() {
    let fs = VirtualFs::new();
    assert_eq!(fs.open("/missing", OpenFlags::read_only()), Err(Error::NoSuchFile));
    assert_eq!(fs.open("/missing", OpenFlags::write_truncate()), Err(Error::NoSuchFile));
}

#[test]
fn open_requires_existing_parent() {
    let fs = VirtualFs::new();
    let flags = OpenFlags { create: true, ..OpenFlags::write_truncate() };
    assert_eq!(fs.open("/no/such/dir/f", flags), Err(Error::NoSuchFile));
}

#[test]
fn exclusive_create_refuses_existing() {
    let fs = VirtualFs::new();
    write_file(&fs, "/once", b"x");
    let flags = OpenFlags { create: true, exclusive: true, ..OpenFlags::write_truncate() };
    assert_eq!(fs.open("/once", flags), Err(Error::AlreadyExists));
}

#[test]
fn append_ignores_offset() {
    let fs = VirtualFs::new();
    write_file(&fs, "/log", b"one\n");
    let flags = OpenFlags { create: true, ..OpenFlags::append() };
    let h = fs.open("/log", flags).unwrap();
    fs.write(h, 0, b"two\n").unwrap();
    fs.close(h).unwrap();
    assert_eq!(read_file(&fs, "/log"), b"one\ntwo\n");
}

#[test]
fn close_after_write_sets_latch() {
    let fs = VirtualFs::new();
    let flags = OpenFlags { create: true, ..OpenFlags::write_truncate() };
    let h = fs.open("/upload.tar.gz", flags).unwrap();
    fs.write(h, 0, b"payload").unwrap();
    let closed = fs.close(h).unwrap();
    assert!(closed.wrote);
    assert_eq!(closed.path, "/upload.tar.gz");
}

#[test]
fn close_after_read_leaves_latch_clear() {
    let fs = VirtualFs::new();
    write_file(&fs, "/upload.tar.gz", b"payload");
    let h = fs.open("/upload.tar.gz", OpenFlags::read_only()).unwrap();
    fs.read(h, 0, 7).unwrap();
    let closed = fs.close(h).unwrap();
    assert!(!closed.wrote);
}

#[test]
fn close_with_no_operation_leaves_latch_clear() {
    let fs = VirtualFs::new();
    write_file(&fs, "/f", b"x");
    let h = fs.open("/f", OpenFlags::read_only()).unwrap();
    assert!(!fs.close(h).unwrap().wrote);
    assert_eq!(fs.close(h), Err(Error::BadHandle));
}

#[test]
fn rename_moves_contents_and_removes_source() {
    let fs = VirtualFs::new();
    write_file(&fs, "/a", b"moved bytes");
    fs.rename("/a", "/b").expect("rename");
    assert_eq!(read_file(&fs, "/b"), b"moved bytes");
    assert_eq!(fs.stat("/a"), Err(Error::NoSuchFile));
}

#[test]
fn rename_refuses_existing_file_destination() {
    let fs = VirtualFs::new();
    write_file(&fs, "/a", b"a");
    write_file(&fs, "/b", b"b");
    assert_eq!(fs.rename("/a", "/b"), Err(Error::AlreadyExists));
}

#[test]
fn rename_directory_moves_subtree() {
    let fs = VirtualFs::new();
    fs.make_dirs("/src/inner").unwrap();
    write_file(&fs, "/src/inner/f", b"deep");
    fs.mkdir("/dst").unwrap();
    fs.rename("/src", "/dst").expect("replace empty dir");
    assert_eq!(read_file(&fs, "/dst/inner/f"), b"deep");
    assert_eq!(fs.stat("/src"), Err(Error::NoSuchFile));
}

#[test]
fn rename_refuses_non_empty_directory_destination() {
    let fs = VirtualFs::new();
    fs.mkdir("/src").unwrap();
    fs.make_dirs("/dst/kept").unwrap();
    assert_eq!(fs.rename("/src", "/dst"), Err(Error::NotEmpty));
}

#[test]
fn rmdir_requires_empty() {
    let fs = VirtualFs::new();
    fs.make_dirs("/d/child").unwrap();
    assert_eq!(fs.rmdir("/d"), Err(Error::NotEmpty));
    fs.rmdir("/d/child").unwrap();
    fs.rmdir("/d").expect("empty now");
    assert_eq!(fs.stat("/d"), Err(Error::NoSuchFile));
}

#[test]
fn mkdir_requires_parent() {
    let fs = VirtualFs::new();
    assert_eq!(fs.mkdir("/x/y"), Err(Error::NoSuchFile));
    fs.mkdir("/x").unwrap();
    fs.mkdir("/x/y").unwrap();
    assert_eq!(fs.mkdir("/x"), Err(Error::AlreadyExists));
}

#[test]
fn remove_refuses_directory() {
    let fs = VirtualFs::new();
    fs.mkdir("/d").unwrap();
    assert_eq!(fs.remove("/d"), Err(Error::IsDirectory));
    assert_eq!(fs.rmdir("/d"), Ok(()));
}

#[test]
fn stat_reports_type_bits() {
    let fs = VirtualFs::new();
    fs.mkdir("/d").unwrap();
    write_file(&fs, "/f", b"abc");
    fs.symlink("/f", "/l").unwrap();

    let d = fs.stat("/d").unwrap();
    assert_eq!(d.permissions() & S_IFDIR, S_IFDIR);

    let f = fs.stat("/f").unwrap();
    assert_eq!(f.permissions() & S_IFREG, S_IFREG);
    assert_eq!(f.size, 3);

    let l = fs.lstat("/l").unwrap();
    assert_eq!(l.permissions() & S_IFLNK, S_IFLNK);
}

#[test]
fn symlink_read_through_open() {
    let fs = VirtualFs::new();
    write_file(&fs, "/target", b"via link");
    fs.symlink("/target", "/link").unwrap();
    assert_eq!(fs.readlink("/link").unwrap(), "/target");
    assert_eq!(read_file(&fs, "/link"), b"via link");
    assert_eq!(fs.readlink("/target"), Err(Error::NotSymlink));
}

#[test]
fn listdir_returns_sorted_children_only() {
    let fs = VirtualFs::new();
    fs.make_dirs("/dir/sub").unwrap();
    write_file(&fs, "/dir/b", b"");
    write_file(&fs, "/dir/a", b"");
    write_file(&fs, "/other", b"");

    let names: Vec<String> = fs.listdir("/dir").unwrap().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["a", "b", "sub"]);
    assert_eq!(fs.listdir("/dir/a"), Err(Error::NotDirectory));
}

#[test]
fn removetree_drops_whole_subtree() {
    let fs = VirtualFs::new();
    fs.make_dirs("/extracts/extract_1").unwrap();
    write_file(&fs, "/extracts/extract_1/a.log", b"x");
    write_file(&fs, "/extracts/keep", b"y");
    fs.removetree("/extracts/extract_1").unwrap();
    assert_eq!(fs.stat("/extracts/extract_1"), Err(Error::NoSuchFile));
    assert_eq!(read_file(&fs, "/extracts/keep"), b"y");
    assert_eq!(fs.removetree("/extracts/extract_1"), Err(Error::NoSuchFile));
}

#[test]
fn handle_survives_remove() {
    let fs = VirtualFs::new();
    write_file(&fs, "/ghost", b"still readable");
    let h = fs.open("/ghost", OpenFlags::read_only()).unwrap();
    fs.remove("/ghost").unwrap();
    assert_eq!(fs.read(h, 0, 32).unwrap(), b"still readable");
    fs.close(h).unwrap();
}

#[test]
fn setattr_changes_mode_and_size() {
    let fs = VirtualFs::new();
    write_file(&fs, "/f", b"12345678");
    fs.setattr("/f", SetAttr { mode: Some(0o600), size: Some(4), ..SetAttr::default() })
        .unwrap();
    let attr = fs.stat("/f").unwrap();
    assert_eq!(attr.mode, 0o600);
    assert_eq!(attr.size, 4);
    assert_eq!(read_file(&fs, "/f"), b"1234");
}

#[test]
fn realpath_canonicalises() {
    let fs = VirtualFs::new();
    assert_eq!(fs.realpath("").unwrap(), "/");
    assert_eq!(fs.realpath("a/b/../c").unwrap(), "/a/c");
    assert_eq!(fs.realpath("/a//b/./c/").unwrap(), "/a/b/c");
    assert_eq!(fs.realpath("/.."), Err(Error::InvalidPath));
}
