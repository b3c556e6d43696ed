use std::{
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use imgfs::{
    extract::{Extractor, TarCommand, TarExtractor},
    image::Image,
    loopdev::KernelLoop,
    parse::parse_trailing_number,
    provision::Provisioner,
    size::SizePolicy,
    source::{FileSource, ReaderSource, Source},
    tools::{check_host_tools, E2fsprogs, SystemMount},
};

/// imgfsctl
#[derive(Debug, Parser)]
#[clap(name = "imgfsctl", version)]
pub struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Args)]
struct ImageArgs {
    /// the image UID, used in messages
    #[clap(long)]
    uid: String,
    /// the directory the image file lives in
    #[clap(long)]
    object_path: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Builds an ext4 base image from a tar archive (possibly gzip or zstd compressed)
    Create {
        #[clap(flatten)]
        image: ImageArgs,
        /// nominal content size in bytes, defaults to the size of the archive file
        #[clap(long)]
        size: Option<u64>,
        /// extract with the system's tar instead of in process
        #[clap(long)]
        tar_command: bool,
        /// don't restore file ownership from the archive (the default when not root)
        #[clap(long)]
        no_same_owner: bool,
        /// delete the archive after it has been extracted
        #[clap(long)]
        remove_source: bool,
        /// the archive, or '-' for stdin
        archive: PathBuf,
    },
    /// Shrinks an existing, unmounted image to its minimum size
    Shrink {
        #[clap(flatten)]
        image: ImageArgs,
    },
    /// Prints the initial allocation for a nominal size in bytes
    PlanSize { bytes: u64 },
    /// Reads `resize2fs -P` output from stdin and prints the block count
    MinSize,
}

fn provisioner<'a>(
    e2fs: &'a E2fsprogs,
    mount: &'a SystemMount,
    extractor: &'a dyn Extractor,
) -> Provisioner<'a> {
    Provisioner {
        policy: SizePolicy::from_env(),
        formatter: e2fs,
        mounter: mount,
        extractor,
        loop_driver: &KernelLoop,
        checker: e2fs,
        resizer: e2fs,
    }
}

fn open_source(archive: &Path, remove: bool) -> Box<dyn Source> {
    if archive == Path::new("-") {
        Box::new(ReaderSource::new(std::io::stdin().lock()))
    } else {
        Box::new(FileSource::new(archive).remove_on_cleanup(remove))
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.cmd {
        Command::Create {
            image,
            size,
            tar_command,
            no_same_owner,
            remove_source,
            archive,
        } => {
            let stdin = archive == Path::new("-");
            let image = match size {
                Some(size) => Image::new(image.uid, image.object_path, size),
                None if stdin => bail!("--size is required when reading the archive from stdin"),
                None => Image::from_source_file(image.uid, image.object_path, &archive)
                    .with_context(|| format!("reading size of {archive:?}"))?,
            };

            let e2fs = E2fsprogs::default();
            let mount = SystemMount::default();
            check_host_tools(&e2fs, &mount)?;

            let same_owner = !no_same_owner && rustix::process::getuid().is_root();
            let extractor: Box<dyn Extractor> = if tar_command {
                let mut tar = TarCommand::default();
                if !same_owner {
                    tar.extra_args.push("--no-same-owner".into());
                }
                Box::new(tar)
            } else {
                Box::new(TarExtractor::default().preserve_ownerships(same_owner))
            };

            let mut source = open_source(&archive, remove_source);
            let min = provisioner(&e2fs, &mount, extractor.as_ref())
                .provision(&image, source.as_mut())
                .with_context(|| format!("provisioning image {}", image.uid()))?;
            println!("{} {}", image.fs_path().display(), min.bytes());
        }
        Command::Shrink { image } => {
            let image = Image::new(image.uid, image.object_path, 0);
            let e2fs = E2fsprogs::default();
            let mount = SystemMount::default();
            check_host_tools(&e2fs, &mount)?;

            let min = provisioner(&e2fs, &mount, &TarExtractor::default())
                .shrink(&image)
                .with_context(|| format!("shrinking image {}", image.uid()))?;
            println!("{} {}", image.fs_path().display(), min.bytes());
        }
        Command::PlanSize { bytes } => {
            println!("{}", SizePolicy::from_env().plan(bytes));
        }
        Command::MinSize => {
            let mut output = String::new();
            std::io::stdin()
                .read_to_string(&mut output)
                .context("reading resize2fs output")?;
            let blocks = parse_trailing_number(&output)?;
            println!("{blocks}");
        }
    }
    Ok(())
}
