//! Reads the images mapped into the process from `/proc/self/maps`, through
//! fixed buffers so that it can be done from within a signal handler.

use crate::report::{Encoder, FieldValue, Message, Sink, fields};
use std::{io, ops::Range};

/// Lines longer than this are skipped, which only happens for paths that
/// wouldn't fit in [`PATH_LEN`] anyway
const LINE_LEN: usize = 1024;
/// The longest path of an image that is written
const PATH_LEN: usize = 768;

pub(super) const MAPS_PATH: &std::ffi::CStr = c"/proc/self/maps";

/// A single line of `/proc/<pid>/maps`
#[derive(Debug, PartialEq, Eq)]
pub(super) struct Mapping<'l> {
    pub(super) start: u64,
    pub(super) end: u64,
    pub(super) offset: u64,
    /// Empty for anonymous mappings
    pub(super) path: &'l [u8],
}

fn parse_hex(field: &[u8]) -> Option<u64> {
    if field.is_empty() || field.len() > 16 {
        return None;
    }

    field.iter().try_fold(0u64, |acc, c| {
        let digit = (*c as char).to_digit(16)?;
        Some((acc << 4) | u64::from(digit))
    })
}

/// Parses `start-end perms offset dev inode path`
pub(super) fn parse_line(line: &[u8]) -> Option<Mapping<'_>> {
    let mut fields = line
        .split(|c| *c == b' ')
        .filter(|field| !field.is_empty());

    let range = fields.next()?;
    let dash = range.iter().position(|c| *c == b'-')?;
    let start = parse_hex(&range[..dash])?;
    let end = parse_hex(&range[dash + 1..])?;

    let _perms = fields.next()?;
    let offset = parse_hex(fields.next()?)?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;

    // The path is the rest of the line, and may contain spaces
    let path = fields
        .next()
        .map(|first| {
            let at = first.as_ptr() as usize - line.as_ptr() as usize;
            &line[at..]
        })
        .unwrap_or_default();

    (start < end).then_some(Mapping {
        start,
        end,
        offset,
        path,
    })
}

/// Splits the contents of a file descriptor into lines
pub(super) struct LineReader {
    fd: i32,
    buf: [u8; LINE_LEN],
    start: usize,
    end: usize,
    eof: bool,
    /// Set while skipping the remainder of a line that didn't fit
    discarding: bool,
}

impl LineReader {
    pub(super) fn new(fd: i32) -> Self {
        Self {
            fd,
            buf: [0; LINE_LEN],
            start: 0,
            end: 0,
            eof: false,
            discarding: false,
        }
    }

    #[inline]
    pub(super) fn line(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    /// The location of the next line in the buffer, without its newline
    pub(super) fn next_line(&mut self) -> Option<Range<usize>> {
        loop {
            if let Some(pos) = self.buf[self.start..self.end]
                .iter()
                .position(|c| *c == b'\n')
            {
                let line = self.start..self.start + pos;
                self.start += pos + 1;

                if self.discarding {
                    self.discarding = false;
                    continue;
                }

                return Some(line);
            }

            if self.eof {
                let line = self.start..self.end;
                self.start = self.end;
                return (!line.is_empty() && !self.discarding).then_some(line);
            }

            if self.discarding {
                self.start = 0;
                self.end = 0;
            } else if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            } else if self.end == LINE_LEN {
                self.discarding = true;
                self.end = 0;
            }

            self.fill();
        }
    }

    fn fill(&mut self) {
        loop {
            // SAFETY: syscall, reads into the unused tail of the buffer
            let read = unsafe {
                libc::read(
                    self.fd,
                    self.buf[self.end..].as_mut_ptr().cast(),
                    LINE_LEN - self.end,
                )
            };

            if read > 0 {
                self.end += read as usize;
            } else if read < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            } else {
                self.eof = true;
            }

            return;
        }
    }
}

/// An image being accumulated from consecutive mappings of the same file
struct Image {
    base: u64,
    end: u64,
    path: [u8; PATH_LEN],
    path_len: usize,
}

impl Image {
    fn path(&self) -> &[u8] {
        &self.path[..self.path_len]
    }
}

impl Message for Image {
    fn encode<S: Sink>(&self, encoder: &mut Encoder<'_, S>) -> io::Result<()> {
        use fields::binary_image as f;

        encoder.field(f::BASE, FieldValue::Uint64(self.base))?;
        encoder.field(f::SIZE, FieldValue::Uint64(self.end - self.base))?;
        // Only paths that are valid utf-8 are kept
        encoder.field(
            f::PATH,
            FieldValue::Str(std::str::from_utf8(self.path()).unwrap_or_default()),
        )
    }
}

/// Writes a binary image for every file mapped into the process, as read from
/// the maps file open at `fd`.
///
/// Consecutive mappings of the same file (its segments) are merged into a
/// single image, starting at the mapping of offset 0. Anonymous and pseudo
/// mappings such as `[stack]` are skipped.
pub(super) fn write_images<S: Sink>(encoder: &mut Encoder<'_, S>, fd: i32) -> io::Result<()> {
    let mut reader = LineReader::new(fd);
    let mut image: Option<Image> = None;

    while let Some(range) = reader.next_line() {
        let Some(mapping) = parse_line(reader.line(range)) else {
            continue;
        };

        if !mapping.path.starts_with(b"/")
            || mapping.path.len() > PATH_LEN
            || std::str::from_utf8(mapping.path).is_err()
        {
            continue;
        }

        if let Some(current) = &mut image {
            // A file mapped again from its start is a separate image
            if current.path() == mapping.path
                && mapping.offset != 0
                && mapping.start >= current.end
            {
                current.end = mapping.end;
                continue;
            }

            encoder.message(fields::crash_report::BINARY_IMAGE, &*current)?;
        }

        let mut next = Image {
            base: mapping.start,
            end: mapping.end,
            path: [0; PATH_LEN],
            path_len: mapping.path.len(),
        };
        next.path[..mapping.path.len()].copy_from_slice(mapping.path);
        image = Some(next);
    }

    match &image {
        Some(last) => encoder.message(fields::crash_report::BINARY_IMAGE, last),
        None => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::report::CrashReport;
    use std::{io::Write, os::unix::io::AsRawFd};

    #[test]
    fn parses_lines() {
        assert_eq!(
            parse_line(b"55d0c5a00000-55d0c5a02000 r--p 00001000 fd:01 1234   /usr/bin/cat"),
            Some(Mapping {
                start: 0x55d0_c5a0_0000,
                end: 0x55d0_c5a0_2000,
                offset: 0x1000,
                path: b"/usr/bin/cat",
            })
        );

        let anon = parse_line(b"7ffd1a2b3000-7ffd1a2d4000 rw-p 00000000 00:00 0").unwrap();
        assert!(anon.path.is_empty());

        let spaced = parse_line(b"1000-2000 r-xp 00000000 08:01 42 /tmp/with space.so").unwrap();
        assert_eq!(spaced.path, b"/tmp/with space.so");

        assert_eq!(parse_line(b"garbage"), None);
        assert_eq!(parse_line(b"2000-1000 r-xp 00000000 08:01 42 /lib"), None);
    }

    fn maps_file(contents: &str) -> std::fs::File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        std::io::Seek::rewind(&mut file).unwrap();
        file
    }

    #[test]
    fn splits_lines() {
        let long = "x".repeat(LINE_LEN * 2);
        let file = maps_file(&format!("first\n{long}\nsecond\nlast"));

        let mut reader = LineReader::new(file.as_raw_fd());
        let mut lines = Vec::new();
        while let Some(range) = reader.next_line() {
            lines.push(String::from_utf8(reader.line(range).to_vec()).unwrap());
        }

        // The overlong line is dropped entirely
        assert_eq!(lines, ["first", "second", "last"]);
    }

    fn images(contents: &str) -> CrashReport {
        let file = maps_file(contents);

        let mut payload = Vec::new();
        write_images(&mut Encoder::new(&mut payload), file.as_raw_fd()).unwrap();
        CrashReport::decode_payload(&payload).unwrap()
    }

    #[test]
    fn merges_segments() {
        let report = images(
            "\
5000-6000 r--p 00000000 08:01 10 /usr/bin/app
6000-8000 r-xp 00001000 08:01 10 /usr/bin/app
8000-9000 rw-p 00003000 08:01 10 /usr/bin/app
9000-a000 rw-p 00000000 00:00 0 [heap]
7f0000000000-7f0000001000 r--p 00000000 08:01 20 /usr/lib/libc.so.6
7f0000001000-7f0000004000 r-xp 00001000 08:01 20 /usr/lib/libc.so.6
7f0000004000-7f0000005000 r--p 00000000 08:01 20 /usr/lib/libc.so.6
7ffd00000000-7ffd00021000 rw-p 00000000 00:00 0 [stack]
",
        );

        let images: Vec<_> = report
            .images
            .iter()
            .map(|i| (i.base, i.size, i.path.as_str()))
            .collect();
        assert_eq!(
            images,
            [
                (0x5000, 0x4000, "/usr/bin/app"),
                (0x7f00_0000_0000, 0x4000, "/usr/lib/libc.so.6"),
                // Mapped again from its start
                (0x7f00_0000_4000, 0x1000, "/usr/lib/libc.so.6"),
            ]
        );
    }

    #[test]
    fn reads_own_maps() {
        // SAFETY: syscall
        let fd = unsafe { libc::open(MAPS_PATH.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        assert!(fd >= 0);

        let mut payload = Vec::new();
        write_images(&mut Encoder::new(&mut payload), fd).unwrap();
        // SAFETY: syscall
        unsafe { libc::close(fd) };

        let report = CrashReport::decode_payload(&payload).unwrap();
        let exe = std::env::current_exe().unwrap();

        // The code of this test lies within the image of the test binary
        let image = report
            .image_for_address(reads_own_maps as usize as u64)
            .expect("no image contains this function");
        assert_eq!(std::path::Path::new(&image.path), exe);
    }
}
