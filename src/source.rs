//! Where image content comes from.
//!
//! A [`Source`] hands out a byte stream with an archive in it and knows how to clean up
//! after itself once the content has been extracted.  The pipeline borrows the stream only
//! for the extraction and calls [`Source::cleanup`] afterwards on every path; a cleanup that
//! finds nothing left to remove reports [`io::ErrorKind::NotFound`] and is ignored.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
};

use log::debug;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Archive content plus its cleanup.
pub trait Source {
    /// Opens the archive stream.  The stream borrows the source.
    fn reader(&mut self) -> io::Result<Box<dyn Read + '_>>;

    /// Releases whatever backs the source.
    fn cleanup(&mut self) -> io::Result<()>;
}

/// Wraps `reader` in a decoder when it starts with a gzip or zstd header.
pub fn decompress<'a>(reader: impl Read + 'a) -> io::Result<Box<dyn Read + 'a>> {
    let mut reader = BufReader::new(reader);
    let (is_gzip, is_zstd) = {
        let head = reader.fill_buf()?;
        (head.starts_with(GZIP_MAGIC), head.starts_with(ZSTD_MAGIC))
    };

    Ok(if is_gzip {
        debug!("source is gzip compressed");
        Box::new(flate2::read::MultiGzDecoder::new(reader))
    } else if is_zstd {
        debug!("source is zstd compressed");
        Box::new(zstd::stream::read::Decoder::with_buffer(reader)?)
    } else {
        Box::new(reader)
    })
}

/// A (possibly compressed) tar archive on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    remove_on_cleanup: bool,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            remove_on_cleanup: false,
        }
    }

    /// Deletes the archive during cleanup, for downloads and other scratch copies.
    pub fn remove_on_cleanup(mut self, remove: bool) -> Self {
        self.remove_on_cleanup = remove;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Source for FileSource {
    fn reader(&mut self) -> io::Result<Box<dyn Read + '_>> {
        decompress(File::open(&self.path)?)
    }

    fn cleanup(&mut self) -> io::Result<()> {
        if self.remove_on_cleanup {
            debug!("removing source archive {:?}", self.path);
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Any stream, e.g. stdin.  Cleanup does nothing.
pub struct ReaderSource<R> {
    reader: R,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read> Source for ReaderSource<R> {
    fn reader(&mut self) -> io::Result<Box<dyn Read + '_>> {
        decompress(&mut self.reader)
    }

    fn cleanup(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;

    fn read_all(source: &mut dyn Source) -> Vec<u8> {
        let mut buf = vec![];
        source.reader().unwrap().read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn plain_passthrough() {
        let mut source = ReaderSource::new(&b"plain tar bytes"[..]);
        assert_eq!(read_all(&mut source), b"plain tar bytes");
        source.cleanup().unwrap();
    }

    #[test]
    fn gzip_is_decoded() {
        let mut enc = flate2::write::GzEncoder::new(vec![], flate2::Compression::default());
        enc.write_all(b"hello from gzip").unwrap();
        let compressed = enc.finish().unwrap();

        let mut source = ReaderSource::new(compressed.as_slice());
        assert_eq!(read_all(&mut source), b"hello from gzip");
    }

    #[test]
    fn zstd_is_decoded() {
        let compressed = zstd::encode_all(&b"hello from zstd"[..], 3).unwrap();
        let mut source = ReaderSource::new(compressed.as_slice());
        assert_eq!(read_all(&mut source), b"hello from zstd");
    }

    #[test]
    fn empty_stream() {
        let mut source = ReaderSource::new(io::empty());
        assert!(read_all(&mut source).is_empty());
    }

    #[test]
    fn file_source_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer.tar");
        std::fs::write(&path, b"data").unwrap();

        let mut kept = FileSource::new(&path);
        assert_eq!(read_all(&mut kept), b"data");
        kept.cleanup().unwrap();
        assert!(path.exists());

        let mut removed = FileSource::new(&path).remove_on_cleanup(true);
        removed.cleanup().unwrap();
        assert!(!path.exists());

        // already gone
        assert_eq!(
            removed.cleanup().unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }
}
