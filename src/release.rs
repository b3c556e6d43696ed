//! Combining an operation's result with the result of releasing what it used.
//!
//! Stages acquire something (a mount, a loop device, a source), run their body, then release
//! it no matter how the body went.  The rules for the combined outcome are:
//!
//!  - the first error wins: a failing body is reported even if the release also fails
//!  - a release error of kind "not found" means the resource is already gone and is dropped
//!  - any other release error is reported when the body succeeded

use log::warn;

use crate::error::{Error, Result};

/// Merges `result` (from the body) with `released` (from the release that followed it).
pub fn finish<T>(result: Result<T>, released: Result<()>) -> Result<T> {
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(value), Err(err)) if err.is_not_found() => {
            warn!("ignoring release of a resource that is already gone: {err}");
            Ok(value)
        }
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(later)) => {
            if !later.is_not_found() {
                warn!("release also failed after an earlier error: {later}");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use super::*;

    fn unmount_err(source: io::Error) -> Error {
        Error::Unmount {
            uid: "img".into(),
            mountpoint: "/mnt".into(),
            source,
        }
    }

    fn busy() -> io::Error {
        io::Error::other("umount: /mnt: target is busy.")
    }

    fn extract_err() -> Error {
        Error::Extract {
            uid: "img".into(),
            source: io::Error::other("tar: short read"),
        }
    }

    #[test]
    fn success_passes_through() {
        assert_eq!(finish(Ok(7), Ok(())).unwrap(), 7);
    }

    #[test]
    fn release_not_found_is_suppressed() {
        assert_eq!(finish(Ok(7), Err(unmount_err(io::ErrorKind::NotFound.into()))).unwrap(), 7);
    }

    #[test]
    fn release_error_surfaces_when_body_succeeded() {
        let err = finish(Ok(()), Err(unmount_err(busy()))).unwrap_err();
        assert!(matches!(err, Error::Unmount { .. }));
    }

    #[test]
    fn first_error_wins() {
        let err = finish::<()>(Err(extract_err()), Err(unmount_err(busy())))
            .unwrap_err();
        assert!(matches!(err, Error::Extract { .. }));

        let err = finish::<()>(Err(extract_err()), Ok(())).unwrap_err();
        assert!(matches!(err, Error::Extract { .. }));
    }
}
