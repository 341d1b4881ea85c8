//! In-memory capture of guest stdout.

use crate::error::{Error, Result};
use std::ffi::CStr;
use std::fs::File;
use std::io::{self, IoSlice, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

/// Accumulates everything the guest writes to stdout in an anonymous
/// in-memory file.
///
/// The file is only created on the first write, so functions that never
/// print cost nothing.
#[derive(Debug, Default)]
pub struct StdoutCapture {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    file: Option<File>,
    size: usize,
}

impl Inner {
    fn file(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let memfd = memfd::MemfdOptions::new()
                    .create("stdoutfd")
                    .map_err(|e| Error::CaptureFailed(memfd_errno(&e)))?;
                log::debug!("capturing stdout in memfd");
                memfd.into_file()
            }
        };
        Ok(self.file.insert(file))
    }
}

impl StdoutCapture {
    /// Creates an empty capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the contents of `iovecs`, as the guest's `writev` on stdout
    /// would, and returns the number of bytes written.
    pub fn capture(&self, iovecs: &[IoSlice<'_>]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.file()?;

        let total: usize = iovecs.iter().map(|v| v.len()).sum();
        let mut written = 0;
        while written < total {
            let n = file.write_vectored(&remaining(iovecs, written)).map_err(capture_failed)?;
            if n == 0 {
                return Err(capture_failed(io::ErrorKind::WriteZero.into()));
            }
            written += n;
        }

        inner.size += written;
        log::debug!("captured {written} bytes of formatted stdout");
        Ok(written)
    }

    /// Appends `line` followed by a newline, as the guest's `puts` would.
    pub fn capture_line(&self, line: &CStr) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.file()?;

        let bytes = line.to_bytes();
        file.write_all(bytes).map_err(capture_failed)?;
        file.write_all(b"\n").map_err(capture_failed)?;

        let written = bytes.len() + 1;
        inner.size += written;
        log::debug!("captured {written} bytes of unformatted stdout");
        Ok(written)
    }

    /// Number of bytes captured since the last clear.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().size
    }

    /// Whether nothing has been captured since the last clear.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns everything captured so far.
    pub fn read_all(&self) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.size == 0 {
            return Ok(String::new());
        }

        let size = inner.size;
        let file = inner.file()?;
        file.seek(SeekFrom::Start(0)).map_err(capture_failed)?;
        let mut buf = Vec::with_capacity(size);
        file.read_to_end(&mut buf).map_err(capture_failed)?;

        log::debug!("read stdout length {size}");
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Drops the captured output and closes the backing file.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.file = None;
        inner.size = 0;
    }
}

fn capture_failed(e: io::Error) -> Error {
    log::error!("failed capturing stdout: {e}");
    Error::CaptureFailed(e.raw_os_error().unwrap_or(0))
}

#[allow(unreachable_patterns)]
fn memfd_errno(e: &memfd::Error) -> i32 {
    match e {
        memfd::Error::Create(e) | memfd::Error::AddSeals(e) | memfd::Error::GetSeals(e) => {
            e.raw_os_error().unwrap_or(0)
        }
        _ => 0,
    }
}

// The iovecs still to be written after `skip` bytes went out.
fn remaining<'a>(iovecs: &[IoSlice<'a>], mut skip: usize) -> Vec<IoSlice<'a>> {
    let mut out = Vec::with_capacity(iovecs.len());
    for v in iovecs {
        // Reborrow with the original lifetime rather than `v`'s.
        let bytes: &'a [u8] = unsafe { std::slice::from_raw_parts(v.as_ptr(), v.len()) };
        if skip >= bytes.len() {
            skip -= bytes.len();
            continue;
        }
        out.push(IoSlice::new(&bytes[skip..]));
        skip = 0;
    }
    out
}
