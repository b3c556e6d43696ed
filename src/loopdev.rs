//! Loop devices.
//!
//! The shrink stage needs the image as a block device (e2fsck and resize2fs work on devices,
//! and the kernel must not have it mounted).  [`with_loop_device`] binds the image file to a
//! free `/dev/loopN`, runs a closure, and always unbinds it again afterwards.

#![allow(unsafe_code)]

use std::{
    fs::OpenOptions,
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use rustix::{
    fs::{open, Mode, OFlags},
    io::Errno,
    ioctl::{ioctl, opcode, NoArg, Opcode, Setter},
};

use crate::{
    error::{Error, Result},
    image::Image,
    release, BLOCK_SIZE,
};

/// A file bound to a loop block device.
#[derive(Debug, PartialEq, Eq)]
pub struct LoopDevice {
    path: PathBuf,
    backing: PathBuf,
}

impl LoopDevice {
    pub fn new(path: impl Into<PathBuf>, backing: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backing: backing.into(),
        }
    }

    /// The device node, e.g. `/dev/loop3`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file the device reads and writes.
    pub fn backing(&self) -> &Path {
        &self.backing
    }
}

/// Binds files to loop devices and releases them.
pub trait LoopDriver {
    fn attach(&self, backing: &Path, read_only: bool) -> io::Result<LoopDevice>;
    /// Releases the binding.  A device that is no longer bound reports
    /// [`io::ErrorKind::NotFound`].
    fn detach(&self, device: LoopDevice) -> io::Result<()>;
}

/// Attaches the image's backing file, runs `f` with the device, then detaches it whatever
/// `f` returned.  An error from `f` takes precedence over a detach error.
pub fn with_loop_device<T>(
    driver: &dyn LoopDriver,
    image: &Image,
    read_only: bool,
    f: impl FnOnce(&LoopDevice) -> Result<T>,
) -> Result<T> {
    let device = driver
        .attach(&image.fs_path(), read_only)
        .map_err(|source| Error::LoopAttach {
            uid: image.uid().to_string(),
            source,
        })?;
    debug!("attached {:?} to {:?}", device.backing(), device.path());

    let result = f(&device);

    let path = device.path().to_path_buf();
    let released = driver.detach(device).map_err(|source| Error::LoopDetach {
        uid: image.uid().to_string(),
        device: path.clone(),
        source,
    });
    if released.is_ok() {
        debug!("detached {path:?}");
    }
    release::finish(result, released)
}

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;
const LO_FLAGS_READ_ONLY: u32 = 1;

#[derive(Default)]
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    // HACK: default trait is only implemented up to [u8; 32]
    lo_file_name: ([u8; LO_NAME_SIZE / 2], [u8; LO_NAME_SIZE / 2]),
    lo_crypt_name: ([u8; LO_NAME_SIZE / 2], [u8; LO_NAME_SIZE / 2]),
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

#[derive(Default)]
#[repr(C)]
struct LoopConfig {
    fd: u32,
    block_size: u32,
    info: LoopInfo64,
    reserved: [u64; 8],
}

struct LoopCtlGetFree;

// LOOP_CTL_GET_FREE returns the device number as the ioctl's return value, which none of
// the rustix argument patterns cover.
unsafe impl rustix::ioctl::Ioctl for LoopCtlGetFree {
    type Output = std::ffi::c_int;

    const IS_MUTATING: bool = false;

    fn opcode(&self) -> Opcode {
        LOOP_CTL_GET_FREE
    }

    fn as_ptr(&mut self) -> *mut std::ffi::c_void {
        std::ptr::null_mut()
    }

    unsafe fn output_from_ptr(
        out: rustix::ioctl::IoctlOutput,
        _ptr: *mut std::ffi::c_void,
    ) -> rustix::io::Result<std::ffi::c_int> {
        Ok(out)
    }
}

const LOOP_CTL_GET_FREE: Opcode = opcode::none(0x4C, 0x82);
// These two predate the _IO() encoding: the kernel defines them as bare numbers, which is
// what opcode::none() produces for them.
const LOOP_CLR_FD: Opcode = opcode::none(0x4C, 0x01);
const LOOP_CONFIGURE: Opcode = opcode::none(0x4C, 0x0A);

// Another process can grab the device between GET_FREE and CONFIGURE.
const ATTACH_ATTEMPTS: usize = 3;

/// The kernel loop driver, through `/dev/loop-control`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelLoop;

impl KernelLoop {
    fn try_attach(&self, backing: &std::fs::File, read_only: bool) -> io::Result<PathBuf> {
        let control = open(
            "/dev/loop-control",
            OFlags::RDWR | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        let index = unsafe { ioctl(&control, LoopCtlGetFree)? };
        let path = PathBuf::from(format!("/dev/loop{index}"));
        let device = open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;

        let config = LoopConfig {
            fd: backing.as_raw_fd() as u32,
            block_size: BLOCK_SIZE as u32,
            info: LoopInfo64 {
                lo_flags: if read_only { LO_FLAGS_READ_ONLY } else { 0 },
                ..LoopInfo64::default()
            },
            ..LoopConfig::default()
        };
        unsafe {
            ioctl(&device, Setter::<{ LOOP_CONFIGURE }, LoopConfig>::new(config))?;
        }
        Ok(path)
    }
}

impl LoopDriver for KernelLoop {
    fn attach(&self, backing: &Path, read_only: bool) -> io::Result<LoopDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(backing)?;

        let mut attempt = 1;
        loop {
            match self.try_attach(&file, read_only) {
                Ok(path) => return Ok(LoopDevice::new(path, backing)),
                Err(err) if err.raw_os_error() == Some(Errno::BUSY.raw_os_error())
                    && attempt < ATTACH_ATTEMPTS =>
                {
                    warn!("loop device taken while attaching {backing:?}, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn detach(&self, device: LoopDevice) -> io::Result<()> {
        // ENOENT from the open maps to NotFound on its own
        let fd = open(device.path(), OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;
        match unsafe { ioctl(&fd, NoArg::<{ LOOP_CLR_FD }>::new()) } {
            Ok(()) => Ok(()),
            Err(Errno::NXIO) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{:?} is not bound", device.path()),
            )),
            Err(err) => Err(err.into()),
        }
    }
}
