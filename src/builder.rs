//! Allocating and formatting the image file.

use std::fs::File;

use log::{debug, error, info};

use crate::{
    error::{Error, Result},
    image::Image,
    size::SizePolicy,
    tools::Formatter,
};

/// Creates `<object_path>/IMAGE_FS` as a sparse file sized by `policy` and formats it.
///
/// Returns the allocated size in bytes.  The file is created if missing and truncated if it
/// already exists.
pub fn create_filesystem(
    image: &Image,
    policy: &SizePolicy,
    formatter: &dyn Formatter,
) -> Result<u64> {
    let uid = image.uid();
    let path = image.fs_path();
    debug!("allocating image file {path:?} and formatting it with ext4");

    let file = File::create(&path).map_err(|source| {
        let err = Error::CreateFile {
            uid: uid.to_string(),
            source,
        };
        error!("image import: {err}");
        err
    })?;

    // The extracted tree plus the journal has to fit; resize2fs takes the slack back later.
    let size = policy.plan(image.nominal_size());
    file.set_len(size).map_err(|source| {
        let err = Error::Allocate {
            uid: uid.to_string(),
            source,
        };
        error!("image import: {err}");
        err
    })?;
    drop(file);
    info!("allocated {size} bytes for image {uid}");

    formatter.format(&path).map_err(|source| {
        let err = Error::Format {
            uid: uid.to_string(),
            source,
        };
        error!("image import mkfs.ext4 failed: {err}");
        err
    })?;

    Ok(size)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{tempdir, FakeHost};

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn sparse_file_of_planned_size() {
        let dir = tempdir();
        let image = Image::new("small", dir.path(), 2 * GIB);
        let host = FakeHost::default();

        let size = create_filesystem(&image, &SizePolicy::default(), &host).unwrap();

        assert_eq!(size, 10 * GIB);
        assert_eq!(image.fs_path().metadata().unwrap().len(), 10 * GIB);
        assert_eq!(host.calls(), [format!("format {}", image.fs_path().display())]);
    }

    #[test]
    fn existing_file_is_replaced() {
        let dir = tempdir();
        let image = Image::new("again", dir.path(), 3 * GIB);
        std::fs::write(image.fs_path(), b"stale contents").unwrap();

        create_filesystem(&image, &SizePolicy::default(), &FakeHost::default()).unwrap();
        assert_eq!(image.fs_path().metadata().unwrap().len(), 15 * GIB);
    }

    #[test]
    fn missing_object_dir() {
        let dir = tempdir();
        let image = Image::new("orphan", dir.path().join("gone"), 0);
        let host = FakeHost::default();

        let err = create_filesystem(&image, &SizePolicy::default(), &host).unwrap_err();
        assert!(matches!(err, Error::CreateFile { .. }));
        assert!(err.to_string().contains("orphan"));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn formatter_stderr_is_reported() {
        let dir = tempdir();
        let image = Image::new("bad", dir.path(), 0);
        let host = FakeHost {
            format_stderr: Some("mkfs.ext4: Device size reported to be zero.".into()),
            ..FakeHost::default()
        };

        let err = create_filesystem(&image, &SizePolicy::default(), &host).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
        let msg = err.to_string();
        assert!(msg.contains("bad"), "{msg}");
        assert!(msg.contains("Device size reported to be zero"), "{msg}");
    }
}
