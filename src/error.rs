//! Error type for the provisioning pipeline.
//!
//! Every variant names the image it happened to.  Capabilities (tools, loop driver,
//! extractor, sources) report plain [`std::io::Error`]s; the stage that called them wraps the
//! error with the image UID and what it was trying to do.  An [`io::ErrorKind::NotFound`]
//! source means the resource was already gone, see [`Error::is_not_found`].

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::parse::ParseError;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A failed pipeline stage.
#[derive(Debug, Error)]
pub enum Error {
    /// The backing file couldn't be created.
    #[error("failed to create image file for {uid}: {source}")]
    CreateFile {
        uid: String,
        #[source]
        source: io::Error,
    },

    /// The backing file couldn't be sized.
    #[error("failed to allocate space for image {uid}: {source}")]
    Allocate {
        uid: String,
        #[source]
        source: io::Error,
    },

    /// `mkfs.ext4` failed.  The formatter's stderr, if any, is part of the source.
    #[error("failed to format image {uid}: {source}")]
    Format {
        uid: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to create a mount point for image {uid}: {source}")]
    MountPoint {
        uid: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to mount image {uid} at {mountpoint:?}: {source}")]
    Mount {
        uid: String,
        mountpoint: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to unmount image {uid} from {mountpoint:?}: {source}")]
    Unmount {
        uid: String,
        mountpoint: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to extract content into image {uid}: {source}")]
    Extract {
        uid: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to clean up the source of image {uid}: {source}")]
    SourceCleanup {
        uid: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to set up resolv.conf in image {uid}: {source}")]
    ResolvConf {
        uid: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to attach a loop device for image {uid}: {source}")]
    LoopAttach {
        uid: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to detach loop device {device:?} of image {uid}: {source}")]
    LoopDetach {
        uid: String,
        device: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `resize2fs -P` failed to run or exited non-zero.
    #[error("failed to estimate the minimum size of image {uid}: {source}")]
    Estimate {
        uid: String,
        #[source]
        source: io::Error,
    },

    /// `resize2fs -P` printed something we don't understand.
    #[error("unexpected resize2fs output for image {uid} ({output:?}): {source}")]
    Parse {
        uid: String,
        output: String,
        #[source]
        source: ParseError,
    },

    #[error("failed to resize image {uid} to {blocks} blocks: {source}")]
    Resize {
        uid: String,
        blocks: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to shrink image {uid}: {source}")]
    Truncate {
        uid: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// The UID of the image this error belongs to.
    pub fn uid(&self) -> &str {
        match self {
            Error::CreateFile { uid, .. }
            | Error::Allocate { uid, .. }
            | Error::Format { uid, .. }
            | Error::MountPoint { uid, .. }
            | Error::Mount { uid, .. }
            | Error::Unmount { uid, .. }
            | Error::Extract { uid, .. }
            | Error::SourceCleanup { uid, .. }
            | Error::ResolvConf { uid, .. }
            | Error::LoopAttach { uid, .. }
            | Error::LoopDetach { uid, .. }
            | Error::Estimate { uid, .. }
            | Error::Parse { uid, .. }
            | Error::Resize { uid, .. }
            | Error::Truncate { uid, .. } => uid,
        }
    }

    fn io_source(&self) -> Option<&io::Error> {
        match self {
            Error::CreateFile { source, .. }
            | Error::Allocate { source, .. }
            | Error::Format { source, .. }
            | Error::MountPoint { source, .. }
            | Error::Mount { source, .. }
            | Error::Unmount { source, .. }
            | Error::Extract { source, .. }
            | Error::SourceCleanup { source, .. }
            | Error::ResolvConf { source, .. }
            | Error::LoopAttach { source, .. }
            | Error::LoopDetach { source, .. }
            | Error::Estimate { source, .. }
            | Error::Resize { source, .. }
            | Error::Truncate { source, .. } => Some(source),
            Error::Parse { .. } => None,
        }
    }

    /// Whether the underlying failure says the resource no longer exists.  Release paths
    /// swallow these.
    pub fn is_not_found(&self) -> bool {
        self.io_source()
            .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn messages_carry_uid_and_cause() {
        let err = Error::Format {
            uid: "f00".into(),
            source: io::Error::other("mkfs.ext4: Device size reported to be zero"),
        };
        let msg = err.to_string();
        assert!(msg.contains("f00"), "{msg}");
        assert!(msg.contains("Device size reported to be zero"), "{msg}");
        assert_eq!(err.uid(), "f00");
    }

    #[test]
    fn not_found_detection() {
        let gone = Error::LoopDetach {
            uid: "x".into(),
            device: "/dev/loop7".into(),
            source: io::ErrorKind::NotFound.into(),
        };
        assert!(gone.is_not_found());

        let busy = Error::Unmount {
            uid: "x".into(),
            mountpoint: "/tmp/m".into(),
            source: io::Error::other("target is busy"),
        };
        assert!(!busy.is_not_found());

        let parse = Error::Parse {
            uid: "x".into(),
            output: String::new(),
            source: ParseError::Empty,
        };
        assert!(!parse.is_not_found());
    }
}
