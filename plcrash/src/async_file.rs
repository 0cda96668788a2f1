//! Async-signal-safe buffered output.
//!
//! This is only intended for writing a crash report from within a signal
//! handler: the buffer is a fixed size array that lives wherever the
//! [`AsyncFile`] does (ie. the signal stack), and every byte is eventually
//! written with a plain `write(2)` loop that neither allocates nor locks.

use std::{io, os::fd::RawFd};

/// The default capacity of the [`AsyncFile`] buffer
pub const BUFFER_SIZE: usize = 256;

/// The raw operations an [`AsyncFile`] performs on its backing descriptor
pub trait Descriptor {
    /// Issues a single write, returning the number of bytes that were written,
    /// which may be less than requested.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
    /// Closes the descriptor
    fn close(&mut self) -> io::Result<()>;
}

/// A raw file descriptor.
///
/// The descriptor is not closed on drop, only via [`AsyncFile::close`].
#[derive(Debug)]
pub struct Fd(RawFd);

impl Fd {
    #[inline]
    pub fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Descriptor for Fd {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        // SAFETY: syscall, the buffer is valid for its length
        let written = unsafe { libc::write(self.0, data.as_ptr().cast(), data.len()) };

        if written < 0 {
            // Reads errno, an OS error is stored inline so this doesn't allocate
            Err(io::Error::last_os_error())
        } else {
            Ok(written as usize)
        }
    }

    fn close(&mut self) -> io::Result<()> {
        // SAFETY: syscall
        if unsafe { libc::close(self.0) } != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Writes all of `data`, looping until every byte is written or an error
/// occurs.
///
/// Writes interrupted by a signal are retried, any other error, including a
/// write that makes no progress, fails immediately.
pub fn write_all<D: Descriptor>(fd: &mut D, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match fd.write(data) {
            Ok(0) => {
                debug_print!("crash log write made no progress");
                return Err(io::ErrorKind::WriteZero.into());
            }
            Ok(written) => data = &data[written..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug_print!("error occurred writing to crash log");
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Buffered output to a [`Descriptor`], safe to use within a signal handler.
///
/// Invariants: at most `N` bytes are ever buffered, bytes are only appended to
/// the end of the buffer, and the buffer is always written out in full, so
/// the bytes reaching the descriptor are exactly the bytes passed to
/// [`Self::write`], in the same order.
pub struct AsyncFile<D: Descriptor = Fd, const N: usize = BUFFER_SIZE> {
    fd: D,
    buflen: usize,
    buffer: [u8; N],
}

impl<D: Descriptor, const N: usize> AsyncFile<D, N> {
    /// Creates an empty buffer on top of an open, writable descriptor
    #[inline]
    pub fn new(fd: D) -> Self {
        Self {
            fd,
            buflen: 0,
            buffer: [0; N],
        }
    }

    /// Writes all of `data`.
    ///
    /// If `data` doesn't fit in the remaining buffer space, the buffer is
    /// flushed first. If it doesn't fit in an empty buffer it is written
    /// directly to the descriptor, so the buffer never needs to be larger than
    /// the largest single write.
    ///
    /// On failure the state of the file is unspecified and no further writes
    /// should be attempted.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.buflen + data.len() > N {
            self.flush()?;
        }

        if data.len() > N - self.buflen {
            return write_all(&mut self.fd, data);
        }

        self.buffer[self.buflen..self.buflen + data.len()].copy_from_slice(data);
        self.buflen += data.len();
        Ok(())
    }

    /// Writes out every buffered byte
    pub fn flush(&mut self) -> io::Result<()> {
        if self.buflen == 0 {
            return Ok(());
        }

        write_all(&mut self.fd, &self.buffer[..self.buflen])?;
        self.buflen = 0;
        Ok(())
    }

    /// The number of bytes that are currently buffered
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buflen
    }

    #[inline]
    pub fn get_ref(&self) -> &D {
        &self.fd
    }

    /// Closes the descriptor.
    ///
    /// Buffered bytes are **not** flushed, call [`Self::flush`] first. A
    /// failure to close is reported, but not retried.
    pub fn close(mut self) -> io::Result<()> {
        self.fd.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;

    /// A descriptor that records every write, and fails writes with the
    /// queued errors first
    #[derive(Default)]
    struct Scripted {
        written: Vec<u8>,
        writes: usize,
        failures: VecDeque<i32>,
        max_chunk: Option<usize>,
    }

    impl Descriptor for Scripted {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.writes += 1;

            if let Some(errno) = self.failures.pop_front() {
                return Err(io::Error::from_raw_os_error(errno));
            }

            let len = self.max_chunk.map_or(data.len(), |max| data.len().min(max));
            self.written.extend_from_slice(&data[..len]);
            Ok(len)
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn preserves_order_across_flushes() {
        let mut file = AsyncFile::<_, 16>::new(Scripted::default());
        let mut expected = Vec::new();

        for (i, len) in [5, 7, 9, 20, 3, 16, 1, 33, 0, 15].into_iter().enumerate() {
            let chunk = pattern(len, (i as u8).wrapping_mul(31));
            file.write(&chunk).unwrap();
            expected.extend_from_slice(&chunk);
        }

        file.flush().unwrap();
        assert_eq!(file.buffered(), 0);
        assert_eq!(file.get_ref().written, expected);
    }

    #[test]
    fn exact_fill_does_not_flush() {
        let mut file = AsyncFile::<_, 16>::new(Scripted::default());

        file.write(&pattern(10, 0)).unwrap();
        file.write(&pattern(6, 10)).unwrap();
        assert_eq!(file.buffered(), 16);
        assert_eq!(file.get_ref().writes, 0);

        file.write(&[0xff]).unwrap();
        assert_eq!(file.get_ref().writes, 1);
        assert_eq!(file.get_ref().written, pattern(16, 0));
        assert_eq!(file.buffered(), 1);
    }

    #[test]
    fn oversized_write_goes_direct() {
        let mut file = AsyncFile::<_, 8>::new(Scripted::default());

        file.write(b"abc").unwrap();
        file.write(&pattern(20, 0)).unwrap();

        // One write for the buffered bytes, one for the oversized write
        assert_eq!(file.get_ref().writes, 2);
        assert_eq!(file.buffered(), 0);

        let mut expected = b"abc".to_vec();
        expected.extend(pattern(20, 0));
        assert_eq!(file.get_ref().written, expected);
    }

    #[test]
    fn flush_is_idempotent() {
        let mut file = AsyncFile::<_, 16>::new(Scripted::default());

        file.flush().unwrap();
        assert_eq!(file.get_ref().writes, 0);

        file.write(b"hello").unwrap();
        file.flush().unwrap();
        file.flush().unwrap();

        assert_eq!(file.get_ref().writes, 1);
        assert_eq!(file.get_ref().written, b"hello");
    }

    #[test]
    fn retries_interrupted_writes() {
        let mut file = AsyncFile::<_, 4>::new(Scripted {
            failures: [libc::EINTR, libc::EINTR].into_iter().collect(),
            ..Default::default()
        });

        file.write(b"interrupted").unwrap();

        assert_eq!(file.get_ref().writes, 3);
        assert_eq!(file.get_ref().written, b"interrupted");
    }

    #[test]
    fn fails_immediately_on_other_errors() {
        let mut file = AsyncFile::<_, 16>::new(Scripted {
            failures: [libc::EIO].into_iter().collect(),
            ..Default::default()
        });

        file.write(b"doomed").unwrap();
        let err = file.flush().unwrap_err();

        assert_eq!(err.raw_os_error(), Some(libc::EIO));
        assert_eq!(file.get_ref().writes, 1);
        assert!(file.get_ref().written.is_empty());
    }

    #[test]
    fn handles_short_writes() {
        let mut file = AsyncFile::<_, 16>::new(Scripted {
            max_chunk: Some(3),
            ..Default::default()
        });

        let data = pattern(40, 7);
        file.write(&data).unwrap();

        assert_eq!(file.get_ref().written, data);
        assert_eq!(file.get_ref().writes, 14);
    }

    #[test]
    fn writes_to_real_file() {
        use std::os::fd::IntoRawFd;

        let temp = tempfile::NamedTempFile::new().unwrap();
        let fd = temp.reopen().unwrap().into_raw_fd();

        let mut file = AsyncFile::<Fd, 32>::new(Fd::new(fd));
        let mut expected = Vec::new();
        for i in 0..20u8 {
            let chunk = pattern(i as usize * 3, i);
            file.write(&chunk).unwrap();
            expected.extend(chunk);
        }
        file.flush().unwrap();
        file.close().unwrap();

        assert_eq!(std::fs::read(temp.path()).unwrap(), expected);
    }

    #[test]
    fn reports_bad_descriptor() {
        let mut file = AsyncFile::<Fd, 4>::new(Fd::new(-1));
        let err = file.write(b"nowhere to go").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
