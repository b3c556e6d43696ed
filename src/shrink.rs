//! Shrinking a populated image to its minimum size.

use std::fs::OpenOptions;

use log::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    image::Image,
    loopdev::{with_loop_device, LoopDriver},
    parse::parse_trailing_number,
    tools::{Checker, Resizer},
    BLOCK_SIZE,
};

/// The smallest size resize2fs could fit the filesystem into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimumSize {
    pub blocks: u64,
}

impl MinimumSize {
    pub fn block_size(&self) -> u64 {
        BLOCK_SIZE
    }

    /// Length of the backing file after the shrink.
    pub fn bytes(&self) -> u64 {
        self.blocks.saturating_mul(BLOCK_SIZE)
    }
}

fn log_failure(err: Error) -> Error {
    error!("image import shrink: {err}");
    err
}

/// Checks the filesystem, resizes it to its minimum and truncates the backing file to match.
///
/// The image must not be mounted.  The filesystem tools work on a loop device that is
/// detached again before the file is truncated.
pub fn shrink(
    image: &Image,
    driver: &dyn LoopDriver,
    checker: &dyn Checker,
    resizer: &dyn Resizer,
) -> Result<MinimumSize> {
    let uid = image.uid();

    let min = with_loop_device(driver, image, false, |device| {
        let dev = device.path();

        // resize2fs refuses to work on a filesystem that hasn't been checked since it was
        // last mounted.  e2fsck -p exits 1 when it fixed something, which is fine here.
        if let Err(err) = checker.check(dev) {
            warn!("e2fsck on {dev:?} for image {uid} reported problems: {err}");
        }

        let output = resizer.estimate_minimum(dev).map_err(|source| Error::Estimate {
            uid: uid.to_string(),
            source,
        })?;
        let blocks = parse_trailing_number(&output).map_err(|source| Error::Parse {
            uid: uid.to_string(),
            output: output.clone(),
            source,
        })?;
        debug!("minimum size of image {uid} is {blocks} blocks");

        resizer.resize(dev, blocks).map_err(|source| Error::Resize {
            uid: uid.to_string(),
            blocks,
            source,
        })?;
        Ok(MinimumSize { blocks })
    })
    .map_err(log_failure)?;

    // The filesystem is smaller now, but the file still has its original size.
    let truncated = OpenOptions::new()
        .write(true)
        .open(image.fs_path())
        .and_then(|file| file.set_len(min.bytes()));
    truncated.map_err(|source| {
        log_failure(Error::Truncate {
            uid: uid.to_string(),
            source,
        })
    })?;

    info!("image {uid} shrunk to {} bytes", min.bytes());
    Ok(min)
}
