//! The image being provisioned.

use std::{
    io::Result,
    path::{Path, PathBuf},
};

/// Name of the ext4 backing file inside an image's object directory.
pub const IMAGE_FS: &str = "image.ext4";

/// Permissions for directories created inside the populated tree.
pub const DATA_DIR_PERM: u32 = 0o755;

/// A base image: identity, storage location and the size its source advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    uid: String,
    object_path: PathBuf,
    nominal_size: u64,
}

impl Image {
    pub fn new(uid: impl Into<String>, object_path: impl Into<PathBuf>, nominal_size: u64) -> Self {
        Self {
            uid: uid.into(),
            object_path: object_path.into(),
            nominal_size,
        }
    }

    /// Takes the nominal size from the on-disk length of the archive the image is built from.
    pub fn from_source_file(
        uid: impl Into<String>,
        object_path: impl Into<PathBuf>,
        archive: &Path,
    ) -> Result<Self> {
        let len = std::fs::metadata(archive)?.len();
        Ok(Self::new(uid, object_path, len))
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn object_path(&self) -> &Path {
        &self.object_path
    }

    pub fn nominal_size(&self) -> u64 {
        self.nominal_size
    }

    /// `<object_path>/IMAGE_FS`
    pub fn fs_path(&self) -> PathBuf {
        self.object_path.join(IMAGE_FS)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn fs_path_is_inside_object_path() {
        let img = Image::new("abc123", "/var/lib/imgfs/image/abc123", 42);
        assert_eq!(
            img.fs_path(),
            PathBuf::from("/var/lib/imgfs/image/abc123/image.ext4")
        );
        assert_eq!(img.uid(), "abc123");
        assert_eq!(img.nominal_size(), 42);
    }

    #[test]
    fn nominal_size_from_archive() {
        let mut archive = tempfile::NamedTempFile::new().unwrap();
        archive.write_all(&[0u8; 1536]).unwrap();
        let img = Image::from_source_file("x", "/nowhere", archive.path()).unwrap();
        assert_eq!(img.nominal_size(), 1536);

        assert!(Image::from_source_file("x", "/nowhere", Path::new("/does/not/exist")).is_err());
    }
}
