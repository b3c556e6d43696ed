use std::{io, path::Path, process::Command};

use similar_asserts::assert_eq;
use tempfile::TempDir;

use imgfs::{
    builder::create_filesystem,
    image::Image,
    loopdev::{LoopDevice, LoopDriver},
    parse::parse_trailing_number,
    shrink::shrink,
    size::SizePolicy,
    tools::{Checker, E2fsprogs, Formatter, Resizer},
    Error, BLOCK_SIZE,
};

const GIB: u64 = 1024 * 1024 * 1024;

/// e2fsprogs happily work on regular files, so "attaching" can just hand out the file itself.
struct NoLoop;

impl LoopDriver for NoLoop {
    fn attach(&self, backing: &Path, _read_only: bool) -> io::Result<LoopDevice> {
        Ok(LoopDevice::new(backing, backing))
    }

    fn detach(&self, _device: LoopDevice) -> io::Result<()> {
        Ok(())
    }
}

fn small_policy() -> SizePolicy {
    SizePolicy::with_floor_override(Some("1"))
}

fn formatted(dir: &TempDir, uid: &str) -> Image {
    let image = Image::new(uid, dir.path(), 0);
    let size = create_filesystem(&image, &small_policy(), &E2fsprogs::default()).unwrap();
    assert_eq!(size, GIB);
    image
}

fn fsck_clean(path: &Path) -> bool {
    Command::new("e2fsck")
        .args(["-f", "-n"])
        .arg(path)
        .output()
        .unwrap()
        .status
        .success()
}

#[test_with::executable(mkfs.ext4)]
fn format_sparse_file() {
    let dir = tempfile::tempdir().unwrap();
    let image = formatted(&dir, "fmt");

    let meta = image.fs_path().metadata().unwrap();
    assert_eq!(meta.len(), GIB);
    assert!(fsck_clean(&image.fs_path()));
}

#[test_with::executable(mkfs.ext4)]
fn format_of_empty_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let image = Image::new("tiny", dir.path(), 0);
    std::fs::write(image.fs_path(), b"").unwrap();

    // a zero-length file has no room for a superblock
    let err = E2fsprogs::default().format(&image.fs_path()).unwrap_err();
    assert!(!err.to_string().is_empty());
}

#[test_with::executable(resize2fs)]
fn estimate_parses() {
    let dir = tempfile::tempdir().unwrap();
    let image = formatted(&dir, "est");
    let e2fs = E2fsprogs::default();

    e2fs.check(&image.fs_path()).unwrap();
    let output = e2fs.estimate_minimum(&image.fs_path()).unwrap();
    let blocks = parse_trailing_number(&output).unwrap();
    assert!(blocks > 0);
    assert!(blocks * BLOCK_SIZE < GIB, "{output}");
}

#[test_with::executable(resize2fs)]
fn shrink_formatted_file() {
    let dir = tempfile::tempdir().unwrap();
    let image = formatted(&dir, "shrink");
    let e2fs = E2fsprogs::default();

    let min = shrink(&image, &NoLoop, &e2fs, &e2fs).unwrap();

    assert_eq!(image.fs_path().metadata().unwrap().len(), min.bytes());
    assert!(min.bytes() < GIB);
    assert!(fsck_clean(&image.fs_path()));
}

#[test_with::executable(resize2fs)]
fn shrink_garbage_fails() {
    let dir = tempfile::tempdir().unwrap();
    let image = Image::new("garbage", dir.path(), 0);
    std::fs::write(image.fs_path(), vec![0x55u8; 1 << 20]).unwrap();
    let e2fs = E2fsprogs::default();

    let err = shrink(&image, &NoLoop, &e2fs, &e2fs).unwrap_err();
    assert!(matches!(err, Error::Estimate { .. }), "{err}");
    assert_eq!(err.uid(), "garbage");
    // untouched
    assert_eq!(image.fs_path().metadata().unwrap().len(), 1 << 20);
}
