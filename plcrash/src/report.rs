//! The crash report file format.
//!
//! A report starts with an 8 byte header, the 7 byte [`MAGIC`] followed by a
//! single [`VERSION`] byte, and is followed by a payload in the
//! [protobuf wire format](https://protobuf.dev/programming-guides/encoding/),
//! running to the end of the file. The field numbers of each message are
//! defined in [`fields`].
//!
//! The [`Encoder`] writes the payload without allocating so it can be used
//! from a signal handler, [`CrashReport::decode`] reads it back with `prost`.

mod decode;
mod encode;

pub use decode::{
    ApplicationInfo, BinaryImage, CrashReport, DecodeError, ProcessInfo, Register, SignalInfo,
    StackFrame, SystemInfo, ThreadInfo, parse_header,
};
pub use encode::{Encoder, FieldValue, Message, Sink, SizeCounter, WireType};

/// Identifies a file as a crash report
pub const MAGIC: &[u8; 7] = b"plcrash";
/// The version of the format written by this crate, reports with any other
/// version are rejected
pub const VERSION: u8 = 1;
/// The length of the header preceding the payload
pub const HEADER_LEN: usize = MAGIC.len() + 1;

/// The header, as it is written to the start of a report
pub const fn header() -> [u8; HEADER_LEN] {
    let mut header = [VERSION; HEADER_LEN];
    let mut i = 0;
    while i < MAGIC.len() {
        header[i] = MAGIC[i];
        i += 1;
    }
    header
}

/// Field numbers of each message in the payload
pub mod fields {
    /// The top level message
    pub mod crash_report {
        pub const SYSTEM_INFO: u32 = 1;
        pub const APPLICATION_INFO: u32 = 2;
        pub const PROCESS_INFO: u32 = 3;
        pub const SIGNAL: u32 = 4;
        /// Repeated
        pub const THREAD: u32 = 5;
        /// Repeated, in the order they are mapped
        pub const BINARY_IMAGE: u32 = 6;
    }

    pub mod system_info {
        pub const OS_NAME: u32 = 1;
        pub const OS_VERSION: u32 = 2;
        pub const ARCHITECTURE: u32 = 3;
        /// Seconds since the unix epoch
        pub const TIMESTAMP: u32 = 4;
    }

    pub mod application_info {
        pub const IDENTIFIER: u32 = 1;
        pub const VERSION: u32 = 2;
    }

    pub mod process_info {
        pub const PID: u32 = 1;
        pub const PARENT_PID: u32 = 2;
        pub const PATH: u32 = 3;
    }

    pub mod signal {
        pub const SIGNO: u32 = 1;
        pub const NAME: u32 = 2;
        pub const CODE: u32 = 3;
        pub const CODE_NAME: u32 = 4;
        pub const ADDRESS: u32 = 5;
    }

    pub mod thread {
        pub const TID: u32 = 1;
        pub const CRASHED: u32 = 2;
        /// Repeated, innermost frame first
        pub const FRAME: u32 = 3;
        /// Repeated
        pub const REGISTER: u32 = 4;
        /// Only present if the stack walk ended with an error
        pub const WALK_ERROR: u32 = 5;
        /// Set if there were more frames than were written
        pub const TRUNCATED: u32 = 6;
    }

    pub mod frame {
        pub const PC: u32 = 1;
    }

    pub mod register {
        pub const NAME: u32 = 1;
        pub const VALUE: u32 = 2;
    }

    /// A file mapped into the process
    pub mod binary_image {
        /// The lowest address the file is mapped at
        pub const BASE: u32 = 1;
        pub const SIZE: u32 = 2;
        pub const PATH: u32 = 3;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(&header(), b"plcrash\x01");
        assert_eq!(parse_header(&header()).unwrap(), &[] as &[u8]);
    }
}
