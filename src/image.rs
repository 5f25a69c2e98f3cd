//! Firmware image sources.
//!
//! Images are raw binaries laid out to match flash, consumed front to back
//! exactly once.

use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

/// A finite, non-restartable sequence of image bytes
pub trait DataSource {
    /// Total image length in bytes
    fn total_length(&self) -> u32;

    /// Fill `buf` with the next bytes of the image, returning the count.
    ///
    /// Returns 0 at the end of the image and on every call thereafter.
    fn next_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Image backed by a file on disk
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    len: u32,
    // Dropped (and closed) as soon as the image is exhausted
    reader: Option<BufReader<File>>,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        let len = file.metadata()?.len();
        let len = u32::try_from(len)
            .map_err(|_| io::Error::new(ErrorKind::InvalidData, "image exceeds 4 GiB"))?;

        Ok(Self {
            path,
            len,
            reader: Some(BufReader::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_exhausted(&self) -> bool {
        self.reader.is_none()
    }
}

impl DataSource for FileSource {
    fn total_length(&self) -> u32 {
        self.len
    }

    fn next_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => return Ok(0),
        };

        // Fill the whole buffer unless the file ends first
        let mut n = 0;
        while n < buf.len() {
            match reader.read(&mut buf[n..]) {
                Ok(0) => break,
                Ok(count) => n += count,
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => return Err(e),
            }
        }

        if n == 0 {
            debug!("Image {} exhausted", self.path.display());
            self.reader = None;
        }

        Ok(n)
    }
}

/// Image held in memory
#[derive(Debug, Clone)]
pub struct SliceSource<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> DataSource for SliceSource<'a> {
    fn total_length(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }

    fn next_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.offset..];
        let n = remaining.len().min(buf.len());

        buf[..n].copy_from_slice(&remaining[..n]);
        self.offset += n;

        Ok(n)
    }
}
