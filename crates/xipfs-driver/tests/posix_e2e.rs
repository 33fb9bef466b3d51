#![forbid(unsafe_code)]
//! POSIX-shaped end-to-end behavior on a RAM-backed device.

use xipfs_core::Mount;
use xipfs_driver::{Dir, FileKind, OpenFlags, Whence, Xipfs};
use xipfs_nvm::RamNvm;
use xipfs_types::{PAGE_SIZE, PATH_MAX, XIPFS_MAGIC};

fn fs(pages: u32) -> Xipfs<RamNvm> {
    let fs = Xipfs::new(RamNvm::new(pages), Mount::new(0, pages)).expect("bind");
    fs.format().expect("format");
    fs.mount().expect("mount");
    fs
}

fn entries(fs: &Xipfs<RamNvm>, dir: &mut Dir) -> Vec<String> {
    let mut names = Vec::new();
    while let Some(entry) = fs.readdir(dir).expect("readdir") {
        names.push(entry.name);
    }
    names
}

#[test]
fn fresh_mount_is_empty() {
    let fs = fs(10);

    let mut root = fs.opendir("/").expect("opendir");
    assert!(fs.readdir(&mut root).expect("readdir").is_none());
    assert!(fs.readdir(&mut root).expect("readdir").is_none());
    fs.closedir(root).expect("closedir");

    let vfs = fs.statvfs("/").expect("statvfs");
    assert_eq!(vfs.blocks, 10);
    assert_eq!(vfs.bfree, 10);
    assert_eq!(vfs.bavail, 10);
    assert_eq!(vfs.bsize, PAGE_SIZE as u32);
    assert_eq!(vfs.namemax, PATH_MAX as u32);
}

#[test]
fn create_write_read_back() {
    let fs = fs(10);
    fs.new_file("/a", 100, 0).expect("new_file");

    let fd = fs.open("/a", OpenFlags::WRONLY).expect("open for write");
    assert_eq!(fs.write(fd, b"Hello").expect("write"), 5);
    fs.fsync(fd).expect("fsync");
    fs.close(fd).expect("close");

    let fd = fs.open("/a", OpenFlags::RDONLY).expect("open for read");
    let mut back = [0_u8; 5];
    assert_eq!(fs.read(fd, &mut back).expect("read"), 5);
    assert_eq!(&back, b"Hello");
    // EOF afterwards.
    assert_eq!(fs.read(fd, &mut back).expect("read"), 0);
    fs.close(fd).expect("close");

    let stat = fs.stat("/a").expect("stat");
    assert_eq!(stat.kind, FileKind::Regular);
    assert_eq!(stat.size, 5);
    assert_eq!(stat.blocks, 1);
}

#[test]
fn close_without_fsync_still_commits_the_grown_size() {
    let fs = fs(10);
    let fd = fs
        .open("/grown", OpenFlags::CREAT | OpenFlags::WRONLY)
        .expect("open");
    fs.write(fd, b"0123456789").expect("write");
    fs.close(fd).expect("close");

    assert_eq!(fs.stat("/grown").expect("stat").size, 10);
}

#[test]
fn directory_semantics_from_flat_paths() {
    let fs = fs(10);
    fs.mkdir("/d").expect("mkdir");
    fs.new_file("/d/f", 10, 0).expect("new_file");

    assert_eq!(fs.stat("/d").expect("stat").kind, FileKind::Directory);
    assert_eq!(fs.stat("/d/f").expect("stat").kind, FileKind::Regular);

    let mut dir = fs.opendir("/d").expect("opendir");
    assert_eq!(entries(&fs, &mut dir), ["f"]);

    let mut root = fs.opendir("/").expect("opendir root");
    assert_eq!(entries(&fs, &mut root), ["d/"]);

    // Removing the only entry leaves /d as an empty directory, backed
    // by a synthetic sentinel.
    fs.unlink("/d/f").expect("unlink");
    assert_eq!(fs.stat("/d").expect("stat").kind, FileKind::Directory);
    let mut dir = fs.opendir("/d").expect("opendir");
    assert!(entries(&fs, &mut dir).is_empty());

    fs.rmdir("/d").expect("rmdir");
    assert_eq!(
        fs.stat("/d").expect_err("gone").to_errno(),
        libc::ENOENT
    );
}

#[test]
fn readdir_reports_each_subdirectory_once() {
    let fs = fs(12);
    fs.mkdir("/d").expect("mkdir");
    fs.new_file("/d/one", 0, 0).expect("one");
    fs.new_file("/d/two", 0, 0).expect("two");
    fs.mkdir("/d/sub").expect("mkdir");
    fs.new_file("/d/sub/deep", 0, 0).expect("deep");
    fs.new_file("/top", 0, 0).expect("top");

    let mut root = fs.opendir("/").expect("opendir");
    assert_eq!(entries(&fs, &mut root), ["d/", "top"]);

    let mut d = fs.opendir("/d").expect("opendir");
    assert_eq!(entries(&fs, &mut d), ["one", "two", "sub/"]);
}

#[test]
fn open_error_matrix() {
    let fs = fs(10);
    fs.new_file("/file", 0, 0).expect("file");
    fs.mkdir("/dir").expect("dir");

    let err = fs.open("/missing", OpenFlags::RDONLY).expect_err("enoent");
    assert_eq!(err.to_errno(), libc::ENOENT);

    let err = fs
        .open("/file", OpenFlags::CREAT | OpenFlags::EXCL)
        .expect_err("eexist");
    assert_eq!(err.to_errno(), libc::EEXIST);

    let err = fs.open("/dir", OpenFlags::RDONLY).expect_err("eisdir");
    assert_eq!(err.to_errno(), libc::EISDIR);

    let err = fs
        .open("/file/below", OpenFlags::RDONLY)
        .expect_err("enotdir");
    assert_eq!(err.to_errno(), libc::ENOTDIR);

    let err = fs
        .open("/ghost/file", OpenFlags::CREAT)
        .expect_err("enoent");
    assert_eq!(err.to_errno(), libc::ENOENT);

    let long = format!("/{}", "n".repeat(PATH_MAX));
    let err = fs.open(&long, OpenFlags::RDONLY).expect_err("toolong");
    assert_eq!(err.to_errno(), libc::ENAMETOOLONG);
}

#[test]
fn unlink_twice_reports_enoent() {
    let fs = fs(10);
    fs.new_file("/once", 0, 0).expect("file");
    fs.unlink("/once").expect("first unlink");
    let err = fs.unlink("/once").expect_err("second unlink");
    assert_eq!(err.to_errno(), libc::ENOENT);
}

#[test]
fn unlink_and_rmdir_argument_errors() {
    let fs = fs(10);
    fs.new_file("/file", 0, 0).expect("file");
    fs.mkdir("/dir").expect("dir");

    assert_eq!(fs.unlink("/").expect_err("root").to_errno(), libc::EISDIR);
    assert_eq!(fs.unlink("/dir").expect_err("dir").to_errno(), libc::EISDIR);
    assert_eq!(fs.rmdir("/").expect_err("root").to_errno(), libc::EBUSY);
    assert_eq!(
        fs.rmdir("/file").expect_err("file").to_errno(),
        libc::ENOTDIR
    );
    assert_eq!(fs.rmdir("/dir.").expect_err("dot").to_errno(), libc::EINVAL);
    assert_eq!(fs.mkdir("/").expect_err("root").to_errno(), libc::EEXIST);
    assert_eq!(fs.mkdir("/dir").expect_err("dup").to_errno(), libc::EEXIST);

    fs.new_file("/dir/inner", 0, 0).expect("inner");
    assert_eq!(
        fs.rmdir("/dir").expect_err("nonempty").to_errno(),
        libc::ENOTEMPTY
    );
}

#[test]
fn lseek_whence_and_bounds() {
    let fs = fs(10);
    let fd = fs
        .open("/f", OpenFlags::CREAT | OpenFlags::RDWR)
        .expect("open");
    fs.write(fd, b"abcdef").expect("write");

    assert_eq!(fs.lseek(fd, 2, Whence::Set).expect("seek"), 2);
    assert_eq!(fs.lseek(fd, 2, Whence::Cur).expect("seek"), 4);
    assert_eq!(fs.lseek(fd, -1, Whence::End).expect("seek"), 5);

    let max = (PAGE_SIZE - xipfs_core::HEADER_SIZE) as i64;
    assert_eq!(fs.lseek(fd, max, Whence::Set).expect("seek to max"), max);
    let err = fs.lseek(fd, max + 1, Whence::Set).expect_err("beyond");
    assert_eq!(err.to_errno(), libc::EINVAL);
    let err = fs.lseek(fd, -1, Whence::Set).expect_err("negative");
    assert_eq!(err.to_errno(), libc::EINVAL);

    fs.close(fd).expect("close");
}

#[test]
fn seeking_back_commits_a_pending_grow() {
    let fs = fs(10);
    let fd = fs
        .open("/f", OpenFlags::CREAT | OpenFlags::RDWR)
        .expect("open");
    fs.write(fd, b"grow me up").expect("write");
    // Still uncommitted; seeking back forces the size out.
    fs.lseek(fd, 0, Whence::Set).expect("seek back");
    assert_eq!(fs.fstat(fd).expect("fstat").size, 10);

    let mut back = [0_u8; 10];
    assert_eq!(fs.read(fd, &mut back).expect("read"), 10);
    assert_eq!(&back, b"grow me up");
    fs.close(fd).expect("close");
}

#[test]
fn append_opens_at_the_current_size() {
    let fs = fs(10);
    let fd = fs
        .open("/log", OpenFlags::CREAT | OpenFlags::WRONLY)
        .expect("open");
    fs.write(fd, b"one").expect("write");
    fs.close(fd).expect("close");

    let fd = fs
        .open("/log", OpenFlags::WRONLY | OpenFlags::APPEND)
        .expect("append");
    fs.write(fd, b"two").expect("write");
    fs.close(fd).expect("close");

    let fd = fs.open("/log", OpenFlags::RDONLY).expect("read");
    let mut back = [0_u8; 6];
    assert_eq!(fs.read(fd, &mut back).expect("read"), 6);
    assert_eq!(&back, b"onetwo");
    fs.close(fd).expect("close");
}

#[test]
fn writes_stop_at_the_reservation_boundary() {
    let fs = fs(10);
    fs.new_file("/small", 0, 0).expect("new_file");
    let max = PAGE_SIZE - xipfs_core::HEADER_SIZE;

    let fd = fs.open("/small", OpenFlags::WRONLY).expect("open");
    let blob = vec![0x55_u8; max + 100];
    assert_eq!(fs.write(fd, &blob).expect("write"), max);
    // The reservation is exhausted.
    assert_eq!(fs.write(fd, &blob).expect("write"), 0);
    fs.close(fd).expect("close");
}

#[test]
fn handle_table_capacity_is_enforced() {
    let fs = fs(20);
    fs.new_file("/f", 0, 0).expect("new_file");

    let mut fds = Vec::new();
    for _ in 0..xipfs_types::MAX_OPEN_FILES {
        fds.push(fs.open("/f", OpenFlags::RDONLY).expect("open"));
    }
    let err = fs.open("/f", OpenFlags::RDONLY).expect_err("enfile");
    assert_eq!(err.to_errno(), libc::ENFILE);

    fs.close(fds.pop().expect("fd")).expect("close");
    fs.open("/f", OpenFlags::RDONLY).expect("slot reclaimed");
}

#[test]
fn stale_handles_report_ebadf() {
    let fs = fs(10);
    fs.new_file("/f", 0, 0).expect("new_file");
    let fd = fs.open("/f", OpenFlags::RDONLY).expect("open");
    fs.close(fd).expect("close");

    let mut buf = [0_u8; 1];
    assert_eq!(
        fs.read(fd, &mut buf).expect_err("ebadf").to_errno(),
        libc::EBADF
    );
    assert_eq!(fs.close(fd).expect_err("ebadf").to_errno(), libc::EBADF);
}

#[test]
fn virtual_info_file_is_a_read_only_view_of_the_mount() {
    let fs = fs(10);

    let err = fs
        .open("/.xipfs_infos", OpenFlags::WRONLY)
        .expect_err("eacces");
    assert_eq!(err.to_errno(), libc::EACCES);
    let err = fs
        .open("/.xipfs_infos", OpenFlags::CREAT | OpenFlags::EXCL)
        .expect_err("eexist");
    assert_eq!(err.to_errno(), libc::EEXIST);

    let fd = fs.open("/.xipfs_infos", OpenFlags::RDONLY).expect("open");
    let mut info = [0_u8; Mount::INFO_LEN];
    assert_eq!(fs.read(fd, &mut info).expect("read"), Mount::INFO_LEN);
    assert_eq!(u32::from_ne_bytes(info[0..4].try_into().unwrap()), XIPFS_MAGIC);
    assert_eq!(u32::from_ne_bytes(info[12..16].try_into().unwrap()), 10);

    // Exhausted after one pass.
    assert_eq!(fs.read(fd, &mut info).expect("read"), 0);

    assert_eq!(
        fs.write(fd, b"x").expect_err("ebadf").to_errno(),
        libc::EBADF
    );
    assert_eq!(fs.fstat(fd).expect_err("ebadf").to_errno(), libc::EBADF);
    fs.close(fd).expect("close");

    // The virtual file answers under any directory name.
    let fd = fs.open("/d/.xipfs_infos", OpenFlags::RDONLY).expect("open");
    fs.close(fd).expect("close");
}

#[test]
fn rename_files_and_directories() {
    let fs = fs(12);
    fs.new_file("/a", 0, 0).expect("a");

    // Plain rename to a creatable slot.
    fs.rename("/a", "/b").expect("rename");
    assert_eq!(fs.stat("/a").expect_err("gone").to_errno(), libc::ENOENT);
    assert_eq!(fs.stat("/b").expect("stat").kind, FileKind::Regular);

    // Replacing an existing file keeps exactly one record.
    fs.new_file("/c", 0, 0).expect("c");
    let fd = fs.open("/b", OpenFlags::WRONLY).expect("open");
    fs.write(fd, b"payload").expect("write");
    fs.close(fd).expect("close");
    fs.rename("/b", "/c").expect("replace");
    assert_eq!(fs.stat("/b").expect_err("gone").to_errno(), libc::ENOENT);
    let fd = fs.open("/c", OpenFlags::RDONLY).expect("open");
    let mut back = [0_u8; 7];
    assert_eq!(fs.read(fd, &mut back).expect("read"), 7);
    assert_eq!(&back, b"payload");
    fs.close(fd).expect("close");

    // Directory rename moves every child.
    fs.mkdir("/d").expect("mkdir");
    fs.new_file("/d/one", 0, 0).expect("one");
    fs.new_file("/d/two", 0, 0).expect("two");
    fs.rename("/d", "/moved").expect("rename dir");
    assert_eq!(fs.stat("/moved").expect("stat").kind, FileKind::Directory);
    assert_eq!(fs.stat("/moved/one").expect("stat").kind, FileKind::Regular);
    assert_eq!(fs.stat("/d").expect_err("gone").to_errno(), libc::ENOENT);

    // A directory cannot become its own subdirectory.
    let err = fs.rename("/moved", "/moved/sub").expect_err("einval");
    assert_eq!(err.to_errno(), libc::EINVAL);

    // Renaming the only entry out of a directory leaves it empty but
    // present.
    fs.rename("/moved/one", "/one").expect("move out");
    fs.rename("/moved/two", "/two").expect("move out");
    assert_eq!(fs.stat("/moved").expect("stat").kind, FileKind::Directory);
    let mut dir = fs.opendir("/moved").expect("opendir");
    assert!(entries(&fs, &mut dir).is_empty());
}

#[test]
fn rename_into_an_empty_directory_absorbs_its_sentinel() {
    let fs = fs(12);
    fs.mkdir("/dst").expect("mkdir");
    fs.mkdir("/src").expect("mkdir");
    fs.new_file("/src/f", 0, 0).expect("file");

    fs.rename("/src", "/dst").expect("rename");
    assert_eq!(fs.stat("/dst/f").expect("stat").kind, FileKind::Regular);
    let mut dir = fs.opendir("/dst").expect("opendir");
    assert_eq!(entries(&fs, &mut dir), ["f"]);
    assert_eq!(fs.stat("/src").expect_err("gone").to_errno(), libc::ENOENT);
}

#[test]
fn rename_error_matrix() {
    let fs = fs(12);
    fs.new_file("/file", 0, 0).expect("file");
    fs.mkdir("/empty").expect("empty");
    fs.mkdir("/full").expect("full");
    fs.new_file("/full/f", 0, 0).expect("full file");

    assert_eq!(
        fs.rename("/ghost", "/x").expect_err("enoent").to_errno(),
        libc::ENOENT
    );
    assert_eq!(
        fs.rename("/file", "/empty").expect_err("eisdir").to_errno(),
        libc::EISDIR
    );
    assert_eq!(
        fs.rename("/empty", "/file").expect_err("enotdir").to_errno(),
        libc::ENOTDIR
    );
    assert_eq!(
        fs.rename("/empty", "/full").expect_err("enotempty").to_errno(),
        libc::ENOTEMPTY
    );
    assert_eq!(
        fs.rename("/file", "/ghost/x").expect_err("enoent").to_errno(),
        libc::ENOENT
    );

    // Renaming a path onto itself is a no-op.
    fs.rename("/file", "/file").expect("self rename");
    fs.rename("/empty", "/empty").expect("self rename");
}

#[test]
fn new_file_validation() {
    let fs = fs(10);
    fs.mkdir("/dir").expect("dir");
    fs.new_file("/exists", 0, 0).expect("file");

    assert_eq!(
        fs.new_file("/exists", 0, 0).expect_err("eexist").to_errno(),
        libc::EEXIST
    );
    assert_eq!(
        fs.new_file("/dir", 0, 0).expect_err("eisdir").to_errno(),
        libc::EISDIR
    );
    assert_eq!(
        fs.new_file("/", 0, 0).expect_err("eisdir").to_errno(),
        libc::EISDIR
    );
    assert_eq!(
        fs.new_file("/exists/x", 0, 0)
            .expect_err("enotdir")
            .to_errno(),
        libc::ENOTDIR
    );
    assert_eq!(
        fs.new_file("/ghost/x", 0, 0)
            .expect_err("enoent")
            .to_errno(),
        libc::ENOENT
    );
    assert_eq!(
        fs.new_file("/f", 0, 2).expect_err("einval").to_errno(),
        libc::EINVAL
    );
    assert_eq!(
        fs.new_file("/bad name", 0, 0)
            .expect_err("einval")
            .to_errno(),
        libc::EINVAL
    );
}

#[test]
fn durability_round_trip_across_remount() {
    let fs = fs(10);
    fs.new_file("/keep", 100, 0).expect("new_file");
    let fd = fs.open("/keep", OpenFlags::WRONLY).expect("open");
    fs.write(fd, b"survives").expect("write");
    fs.fsync(fd).expect("fsync");
    fs.close(fd).expect("close");

    let nvm = fs.unmount().expect("unmount");

    let fs = Xipfs::new(nvm, Mount::new(0, 10)).expect("rebind");
    fs.mount().expect("mount");
    let fd = fs.open("/keep", OpenFlags::RDONLY).expect("open");
    let mut back = [0_u8; 8];
    assert_eq!(fs.read(fd, &mut back).expect("read"), 8);
    assert_eq!(&back, b"survives");
    fs.close(fd).expect("close");
}
