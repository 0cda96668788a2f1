//! The read side of the format.
//!
//! The tags of every field match [`super::fields`], which the writer uses.

use super::{HEADER_LEN, MAGIC, VERSION};
use prost::Message as _;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("the data is too short to contain a crash report header")]
    MissingHeader,
    #[error("the data does not start with the crash report magic")]
    InvalidMagic,
    #[error("crash report version {0} is not supported")]
    UnsupportedVersion(u8),
    #[error("the crash report payload is malformed")]
    Payload(#[from] prost::DecodeError),
}

/// Validates the header of a crash report, returning the payload that follows
/// it
pub fn parse_header(data: &[u8]) -> Result<&[u8], DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::MissingHeader);
    }

    let (header, payload) = data.split_at(HEADER_LEN);
    if &header[..MAGIC.len()] != MAGIC {
        return Err(DecodeError::InvalidMagic);
    }

    match header[MAGIC.len()] {
        VERSION => Ok(payload),
        version => Err(DecodeError::UnsupportedVersion(version)),
    }
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct SystemInfo {
    #[prost(string, tag = "1")]
    pub os_name: String,
    #[prost(string, tag = "2")]
    pub os_version: String,
    #[prost(string, tag = "3")]
    pub architecture: String,
    /// Seconds since the unix epoch
    #[prost(uint64, tag = "4")]
    pub timestamp: u64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ApplicationInfo {
    #[prost(string, tag = "1")]
    pub identifier: String,
    #[prost(string, tag = "2")]
    pub version: String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ProcessInfo {
    #[prost(uint32, tag = "1")]
    pub pid: u32,
    #[prost(uint32, tag = "2")]
    pub parent_pid: u32,
    #[prost(string, tag = "3")]
    pub path: String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct SignalInfo {
    #[prost(int32, tag = "1")]
    pub signo: i32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(int64, tag = "3")]
    pub code: i64,
    #[prost(string, tag = "4")]
    pub code_name: String,
    /// The faulting address, if the signal has one
    #[prost(uint64, tag = "5")]
    pub address: u64,
}

#[derive(Copy, Clone, PartialEq, Eq, ::prost::Message)]
pub struct StackFrame {
    #[prost(uint64, tag = "1")]
    pub pc: u64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Register {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub value: u64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ThreadInfo {
    #[prost(uint64, tag = "1")]
    pub tid: u64,
    #[prost(bool, tag = "2")]
    pub crashed: bool,
    /// Innermost first
    #[prost(message, repeated, tag = "3")]
    pub frames: Vec<StackFrame>,
    /// The registers of the innermost frame
    #[prost(message, repeated, tag = "4")]
    pub registers: Vec<Register>,
    /// Why the stack walk ended early, if it did
    #[prost(string, optional, tag = "5")]
    pub walk_error: Option<String>,
    /// The stack had more frames than were written
    #[prost(bool, tag = "6")]
    pub truncated: bool,
}

impl ThreadInfo {
    /// Looks up a register of the innermost frame by name
    pub fn register(&self, name: &str) -> Option<u64> {
        self.registers
            .iter()
            .find(|reg| reg.name == name)
            .map(|reg| reg.value)
    }

    /// The instruction pointer of each frame, innermost first
    pub fn pcs(&self) -> impl Iterator<Item = u64> + '_ {
        self.frames.iter().map(|frame| frame.pc)
    }
}

/// A file that was mapped into the crashed process
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct BinaryImage {
    #[prost(uint64, tag = "1")]
    pub base: u64,
    #[prost(uint64, tag = "2")]
    pub size: u64,
    #[prost(string, tag = "3")]
    pub path: String,
}

impl BinaryImage {
    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

/// A decoded crash report
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CrashReport {
    #[prost(message, optional, tag = "1")]
    pub system_info: Option<SystemInfo>,
    #[prost(message, optional, tag = "2")]
    pub application_info: Option<ApplicationInfo>,
    #[prost(message, optional, tag = "3")]
    pub process_info: Option<ProcessInfo>,
    #[prost(message, optional, tag = "4")]
    pub signal: Option<SignalInfo>,
    #[prost(message, repeated, tag = "5")]
    pub threads: Vec<ThreadInfo>,
    #[prost(message, repeated, tag = "6")]
    pub images: Vec<BinaryImage>,
}

impl CrashReport {
    /// Decodes a complete crash report, including its header.
    ///
    /// Unknown fields are skipped, so reports written by newer versions of
    /// this crate that only add fields can still be read.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_payload(parse_header(data)?)
    }

    /// Decodes the payload that follows the header
    pub fn decode_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(<Self as prost::Message>::decode(payload)?)
    }

    /// The thread that received the signal
    pub fn crashed_thread(&self) -> Option<&ThreadInfo> {
        self.threads.iter().find(|thread| thread.crashed)
    }

    /// The image the address lies within, eg. to turn a frame's instruction
    /// pointer into an offset that can be symbolicated offline
    pub fn image_for_address(&self, address: u64) -> Option<&BinaryImage> {
        self.images.iter().find(|image| image.contains(address))
    }
}
