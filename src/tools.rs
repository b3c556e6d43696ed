//! External filesystem tooling.
//!
//! The pipeline never formats, checks, resizes or mounts anything itself.  Each of those
//! jobs is a small trait so the stages can be driven by fakes in tests; the real
//! implementations run e2fsprogs and util-linux.
//!
//! All methods return [`std::io::Result`].  A failed tool run is an
//! [`io::ErrorKind::Other`] wrapping a [`ToolError`] which keeps the tool's stderr.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Output, Stdio},
};

use log::debug;
use thiserror::Error;

use crate::{BLOCK_SIZE, INODE_SIZE};

/// A tool that couldn't be started or didn't exit cleanly.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to run {program:?}: {source}")]
    Spawn {
        program: OsString,
        #[source]
        source: io::Error,
    },
    #[error("{program:?} failed ({status}){}", stderr_suffix(.stderr))]
    Failed {
        program: OsString,
        status: ExitStatus,
        stderr: String,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    match stderr.trim() {
        "" => String::new(),
        text => format!(" (stderr: {text})"),
    }
}

impl ToolError {
    /// The tool's diagnostic output, if it produced any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ToolError::Failed { stderr, .. } if !stderr.trim().is_empty() => Some(stderr.trim()),
            _ => None,
        }
    }
}

impl From<ToolError> for io::Error {
    fn from(err: ToolError) -> Self {
        io::Error::other(err)
    }
}

/// Runs `cmd` to completion, capturing stdout and stderr.  A non-zero exit is an error.
pub fn run(cmd: &mut Command) -> Result<Output, ToolError> {
    let program = cmd.get_program().to_os_string();
    debug!("running {cmd:?}");
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(ToolError::Failed {
            program,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output)
}

/// Creates an ext4 filesystem inside a file.
pub trait Formatter {
    fn format(&self, image: &Path) -> io::Result<()>;
}

/// Checks and repairs an ext4 filesystem.
pub trait Checker {
    /// Runs an automatic repair pass.  A non-zero exit often only means "repairs were made".
    fn check(&self, device: &Path) -> io::Result<()>;
}

/// Queries and changes the size of an ext4 filesystem.
pub trait Resizer {
    /// Returns the raw text of the "estimated minimum size" report.
    fn estimate_minimum(&self, device: &Path) -> io::Result<String>;
    /// Shrinks (or grows) the filesystem to exactly `blocks` blocks.
    fn resize(&self, device: &Path, blocks: u64) -> io::Result<()>;
}

/// Mounts image files.
pub trait Mounter {
    /// Loop-mounts the file `image` read-write on `target`.
    fn mount_loop(&self, image: &Path, target: &Path) -> io::Result<()>;
    /// Unmounts `target`.  Reports [`io::ErrorKind::NotFound`] when nothing is mounted there.
    fn unmount(&self, target: &Path) -> io::Result<()>;
}

/// The e2fsprogs binaries.
#[derive(Debug, Clone)]
pub struct E2fsprogs {
    pub mkfs: PathBuf,
    pub e2fsck: PathBuf,
    pub resize2fs: PathBuf,
}

impl Default for E2fsprogs {
    fn default() -> Self {
        Self {
            mkfs: "mkfs.ext4".into(),
            e2fsck: "e2fsck".into(),
            resize2fs: "resize2fs".into(),
        }
    }
}

impl Formatter for E2fsprogs {
    fn format(&self, image: &Path) -> io::Result<()> {
        // Lazy init would leave the kernel zeroing inode tables and the journal in the
        // background after the first mount, right when we're populating.
        run(Command::new(&self.mkfs)
            .arg("-b")
            .arg(BLOCK_SIZE.to_string())
            .arg("-I")
            .arg(INODE_SIZE.to_string())
            .arg("-F")
            .args(["-E", "lazy_itable_init=0,lazy_journal_init=0"])
            .arg(image))?;
        Ok(())
    }
}

impl Checker for E2fsprogs {
    fn check(&self, device: &Path) -> io::Result<()> {
        run(Command::new(&self.e2fsck).args(["-p", "-f"]).arg(device))?;
        Ok(())
    }
}

impl Resizer for E2fsprogs {
    fn estimate_minimum(&self, device: &Path) -> io::Result<String> {
        let output = run(Command::new(&self.resize2fs).arg("-P").arg(device))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn resize(&self, device: &Path, blocks: u64) -> io::Result<()> {
        run(Command::new(&self.resize2fs)
            .arg(device)
            .arg(blocks.to_string()))?;
        Ok(())
    }
}

/// `mount(8)` and `umount(8)`.
#[derive(Debug, Clone)]
pub struct SystemMount {
    pub mount: PathBuf,
    pub umount: PathBuf,
}

impl Default for SystemMount {
    fn default() -> Self {
        Self {
            mount: "mount".into(),
            umount: "umount".into(),
        }
    }
}

impl Mounter for SystemMount {
    fn mount_loop(&self, image: &Path, target: &Path) -> io::Result<()> {
        run(Command::new(&self.mount)
            .args(["-o", "loop"])
            .arg(image)
            .arg(target))?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        match run(Command::new(&self.umount).arg(target)) {
            Ok(_) => Ok(()),
            Err(err) if is_not_mounted(&err) => Err(io::Error::new(io::ErrorKind::NotFound, err)),
            Err(err) => Err(err.into()),
        }
    }
}

fn is_not_mounted(err: &ToolError) -> bool {
    err.stderr().is_some_and(|stderr| {
        stderr.contains("not mounted") || stderr.contains("No such file or directory")
    })
}

/// Verifies that every program the default tools need can be found.
pub fn check_host_tools(e2fs: &E2fsprogs, mount: &SystemMount) -> io::Result<()> {
    let missing: Vec<String> = [
        &e2fs.mkfs,
        &e2fs.e2fsck,
        &e2fs.resize2fs,
        &mount.mount,
        &mount.umount,
    ]
    .into_iter()
    .filter(|program| which::which(program).is_err())
    .map(|program| format!("  {}", program.display()))
    .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("missing required tools:\n{}", missing.join("\n")),
        ))
    }
}
