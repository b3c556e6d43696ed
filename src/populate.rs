//! Filling a formatted image with content.
//!
//! The image is loop-mounted on a private temporary directory, the source archive is
//! extracted into it and the name resolution fallback is put in place.  The unmount and the
//! removal of the directory happen on every path out of [`populate`].

use std::{
    fs::{self, DirBuilder},
    io,
    os::unix::fs::{symlink, DirBuilderExt},
    path::Path,
};

use log::{debug, error, warn};
use tempfile::TempDir;

use crate::{
    error::{Error, Result},
    extract::Extractor,
    image::{Image, DATA_DIR_PERM},
    release,
    source::Source,
    tools::Mounter,
};

/// Where the resolver configuration lives, relative to the root of the tree.
pub const RESOLV_CONF: &str = "etc/resolv.conf";

/// The kernel's DHCP client (ip=dhcp) writes the nameservers it learned to /proc/net/pnp in
/// resolv.conf syntax.  Relative, so it resolves inside the guest and not on the host.
pub const RESOLV_CONF_FALLBACK: &str = "../proc/net/pnp";

/// Makes sure `<root>/etc/resolv.conf` has content.
///
/// A non-empty file (or a link to one) is left alone.  Otherwise `etc/` is created if needed
/// and `etc/resolv.conf` becomes a symlink to [`RESOLV_CONF_FALLBACK`], replacing an empty
/// file or a dangling link.
pub fn setup_resolv_conf(root: &Path) -> io::Result<()> {
    let resolv = root.join(RESOLV_CONF);

    match fs::metadata(&resolv) {
        Ok(meta) if meta.len() > 0 => {
            debug!("{resolv:?} already has content");
            return Ok(());
        }
        Ok(_) => debug!("{resolv:?} is empty, replacing it"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    // some minimal images don't ship /etc at all
    if let Some(etc) = resolv.parent() {
        DirBuilder::new()
            .recursive(true)
            .mode(DATA_DIR_PERM)
            .create(etc)?;
    }

    // an empty file or a link that points nowhere
    if fs::symlink_metadata(&resolv).is_ok() {
        fs::remove_file(&resolv)?;
    }

    debug!("linking {resolv:?} to {RESOLV_CONF_FALLBACK}");
    symlink(RESOLV_CONF_FALLBACK, &resolv)
}

fn log_failure(err: Error) -> Error {
    error!("image import: {err}");
    err
}

/// Mounts `image`, extracts `source` into it and sets up resolv.conf.
///
/// The source is cleaned up once extraction has been attempted; a cleanup that finds
/// nothing to remove is fine.  Errors from the body take precedence over errors from the
/// unmount, which in turn is only reported if it isn't "not mounted".
pub fn populate(
    image: &Image,
    mounter: &dyn Mounter,
    extractor: &dyn Extractor,
    source: &mut dyn Source,
) -> Result<()> {
    let uid = image.uid();
    debug!("copying in files to image {uid} from a source");

    let mountpoint = tempfile::Builder::new()
        .prefix("imgfs-mnt-")
        .tempdir()
        .map_err(|source| {
            log_failure(Error::MountPoint {
                uid: uid.to_string(),
                source,
            })
        })?;
    let target = mountpoint.path().to_path_buf();

    mounter
        .mount_loop(&image.fs_path(), &target)
        .map_err(|source| {
            log_failure(Error::Mount {
                uid: uid.to_string(),
                mountpoint: target.clone(),
                source,
            })
        })?;
    let mounted = Mounted {
        mounter,
        uid,
        mountpoint: Some(mountpoint),
    };

    let result = fill(image, &target, extractor, source);

    release::finish(result, mounted.release()).map_err(log_failure)
}

/// A loop mount on a temporary directory.  Unmounts and removes the directory when released
/// or dropped, so an unwinding extractor doesn't leave the image mounted.
struct Mounted<'a> {
    mounter: &'a dyn Mounter,
    uid: &'a str,
    mountpoint: Option<TempDir>,
}

impl Mounted<'_> {
    fn release(mut self) -> Result<()> {
        self.unmount()
    }

    fn unmount(&mut self) -> Result<()> {
        let Some(mountpoint) = self.mountpoint.take() else {
            return Ok(());
        };
        let unmounted = self
            .mounter
            .unmount(mountpoint.path())
            .map_err(|source| Error::Unmount {
                uid: self.uid.to_string(),
                mountpoint: mountpoint.path().to_path_buf(),
                source,
            });
        let still_mounted = unmounted.as_ref().is_err_and(|err| !err.is_not_found());
        remove_mountpoint(mountpoint, still_mounted);
        unmounted
    }
}

impl Drop for Mounted<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.unmount() {
            warn!("unmounting after an aborted import: {err}");
        }
    }
}

fn fill(
    image: &Image,
    target: &Path,
    extractor: &dyn Extractor,
    source: &mut dyn Source,
) -> Result<()> {
    let uid = image.uid();

    let extracted = source
        .reader()
        .and_then(|mut reader| extractor.extract(&mut reader, target))
        .map_err(|source| Error::Extract {
            uid: uid.to_string(),
            source,
        });

    let cleaned = source.cleanup().map_err(|source| Error::SourceCleanup {
        uid: uid.to_string(),
        source,
    });
    release::finish(extracted, cleaned)?;

    setup_resolv_conf(target).map_err(|source| Error::ResolvConf {
        uid: uid.to_string(),
        source,
    })
}

fn remove_mountpoint(mountpoint: TempDir, still_mounted: bool) {
    if still_mounted {
        // removing it recursively would delete the image's content through the mount
        let path = mountpoint.keep();
        warn!("leaving {path:?} behind, it is still mounted");
        return;
    }
    let path = mountpoint.path().to_path_buf();
    if let Err(err) = mountpoint.close() {
        warn!("failed to remove mount point {path:?}: {err}");
    }
}
