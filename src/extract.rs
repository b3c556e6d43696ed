//! Unpacking archive content into a directory.

use std::{
    ffi::OsString,
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
};

use log::debug;

use crate::tools::ToolError;

/// Unpacks an archive stream into `target`, preserving permissions, ownership and structure.
pub trait Extractor {
    fn extract(&self, archive: &mut dyn Read, target: &Path) -> io::Result<()>;
}

/// In-process tar unpacking.
#[derive(Debug, Clone)]
pub struct TarExtractor {
    preserve_ownerships: bool,
}

impl Default for TarExtractor {
    fn default() -> Self {
        Self {
            preserve_ownerships: true,
        }
    }
}

impl TarExtractor {
    /// Restoring uid/gid needs `CAP_CHOWN`; unprivileged callers can turn it off.
    pub fn preserve_ownerships(mut self, preserve: bool) -> Self {
        self.preserve_ownerships = preserve;
        self
    }
}

impl Extractor for TarExtractor {
    fn extract(&self, archive: &mut dyn Read, target: &Path) -> io::Result<()> {
        debug!("unpacking tar stream into {target:?}");
        let mut archive = tar::Archive::new(archive);
        archive.set_preserve_permissions(true);
        archive.set_preserve_ownerships(self.preserve_ownerships);
        archive.set_preserve_mtime(true);
        archive.set_unpack_xattrs(true);
        archive.set_overwrite(true);
        archive
            .unpack(target)
            .map_err(|err| io::Error::new(err.kind(), format!("tar extract failed: {err}")))
    }
}

/// Pipes the stream through `tar -x -C <target>`.
#[derive(Debug, Clone)]
pub struct TarCommand {
    pub program: PathBuf,
    pub extra_args: Vec<OsString>,
}

impl Default for TarCommand {
    fn default() -> Self {
        Self {
            program: "tar".into(),
            extra_args: vec![],
        }
    }
}

impl Extractor for TarCommand {
    fn extract(&self, archive: &mut dyn Read, target: &Path) -> io::Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-x").arg("-C").arg(target).args(&self.extra_args);
        debug!("running {cmd:?}");

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: self.program.clone().into_os_string(),
                source,
            })?;

        // tar can fill the stderr pipe with warnings before it has read all of its input,
        // so stderr is drained concurrently with feeding stdin
        let drain = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = vec![];
                stderr.read_to_end(&mut buf).map(|_| buf)
            })
        });

        // dropping stdin after the copy closes the pipe, so tar sees EOF
        let copied = child
            .stdin
            .take()
            .map(|mut stdin| io::copy(archive, &mut stdin));
        let status = child.wait()?;
        let stderr = match drain {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::other("tar stderr reader panicked"))??,
            None => vec![],
        };

        // if tar bailed out early the copy hits EPIPE; tar's stderr is the better report
        if !status.success() {
            return Err(ToolError::Failed {
                program: self.program.clone().into_os_string(),
                status,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            }
            .into());
        }
        copied.transpose()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::tar_with_files;

    #[test]
    fn native_unpack_preserves_modes() {
        let tar = tar_with_files(&[("bin/sh", 0o755, b"#!fake shell\n"), ("etc/hostname", 0o644, b"vm\n")]);
        let dir = tempfile::tempdir().unwrap();

        TarExtractor::default()
            .preserve_ownerships(false)
            .extract(&mut tar.as_slice(), dir.path())
            .unwrap();

        let sh = dir.path().join("bin/sh");
        assert_eq!(std::fs::read(&sh).unwrap(), b"#!fake shell\n");
        assert_eq!(sh.metadata().unwrap().permissions().mode() & 0o777, 0o755);
        assert_eq!(std::fs::read_to_string(dir.path().join("etc/hostname")).unwrap(), "vm\n");
    }

    #[test]
    fn native_unpack_of_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = vec![0x55u8; 1024];
        let err = TarExtractor::default()
            .extract(&mut garbage.as_slice(), dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("tar extract failed"), "{err}");
    }

    #[test_with::executable(tar)]
    fn command_unpack() {
        let tar = tar_with_files(&[("bin/sh", 0o755, b"sh")]);
        let dir = tempfile::tempdir().unwrap();
        TarCommand::default()
            .extract(&mut tar.as_slice(), dir.path())
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("bin/sh")).unwrap(), b"sh");
    }

    #[test_with::executable(tar)]
    fn command_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = vec![0x55u8; 4096];
        let err = TarCommand::default()
            .extract(&mut garbage.as_slice(), dir.path())
            .unwrap_err();
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<ToolError>());
        assert!(inner.and_then(ToolError::stderr).is_some(), "{err}");
    }

    fn noisy_tar(dir: &Path, exit: u32) -> TarCommand {
        // 256 KiB of warnings before reading any input, several pipe buffers' worth
        let program = dir.join("tar");
        let script = format!(
            "#!/bin/sh\nhead -c 262144 /dev/zero | tr '\\0' w >&2\ncat >/dev/null\nexit {exit}\n"
        );
        std::fs::write(&program, script).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        TarCommand {
            program,
            extra_args: vec![],
        }
    }

    #[test]
    fn command_with_chatty_stderr_completes() {
        let bin = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let archive = vec![0u8; 4 << 20];

        noisy_tar(bin.path(), 0)
            .extract(&mut archive.as_slice(), target.path())
            .unwrap();
    }

    #[test]
    fn command_failure_keeps_all_of_stderr() {
        let bin = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let archive = vec![0u8; 4 << 20];

        let err = noisy_tar(bin.path(), 2)
            .extract(&mut archive.as_slice(), target.path())
            .unwrap_err();
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<ToolError>());
        let stderr = inner.and_then(ToolError::stderr).unwrap();
        assert_eq!(stderr.len(), 262144);
    }
}
