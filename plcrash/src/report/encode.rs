use crate::async_file::{AsyncFile, Descriptor};
use std::io;

/// The destination of an encoded report
pub trait Sink {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
}

impl<D: Descriptor, const N: usize> Sink for AsyncFile<D, N> {
    #[inline]
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        AsyncFile::write(self, data)
    }
}

/// Allocates, so never use it as a sink from within a signal handler
impl Sink for Vec<u8> {
    #[inline]
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// A sink that only counts the bytes written to it, used to calculate the
/// length prefix of nested messages
#[derive(Copy, Clone, Debug, Default)]
pub struct SizeCounter(pub usize);

impl Sink for SizeCounter {
    #[inline]
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.0 += data.len();
        Ok(())
    }
}

/// The encodings of a field on the wire, only the ones we write are
/// represented
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    LengthDelimited = 2,
}

/// The value of a single field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Uint64(u64),
    Int64(i64),
    Bool(bool),
    Str(&'a str),
    Bytes(&'a [u8]),
}

impl FieldValue<'_> {
    #[inline]
    pub fn wire_type(&self) -> WireType {
        match self {
            Self::Uint64(_) | Self::Int64(_) | Self::Bool(_) => WireType::Varint,
            Self::Str(_) | Self::Bytes(_) => WireType::LengthDelimited,
        }
    }
}

/// A message that can be written by an [`Encoder`].
///
/// Nested messages are length prefixed, so [`Self::encode`] is called twice
/// for each of them, once to measure and once to write, and must emit the
/// same fields both times.
pub trait Message {
    fn encode<S: Sink>(&self, encoder: &mut Encoder<'_, S>) -> io::Result<()>;
}

/// Writes fields in the protobuf wire format to a [`Sink`].
///
/// Nothing is allocated or buffered, every field is written straight to the
/// sink, so the sink should do the buffering.
pub struct Encoder<'s, S: Sink> {
    sink: &'s mut S,
}

impl<'s, S: Sink> Encoder<'s, S> {
    #[inline]
    pub fn new(sink: &'s mut S) -> Self {
        Self { sink }
    }

    /// Writes a single field
    pub fn field(&mut self, number: u32, value: FieldValue<'_>) -> io::Result<()> {
        self.tag(number, value.wire_type())?;

        match value {
            FieldValue::Uint64(v) => self.varint(v),
            // Negative values are always 10 bytes, as they are in protobuf
            FieldValue::Int64(v) => self.varint(v as u64),
            FieldValue::Bool(v) => self.varint(v as u64),
            FieldValue::Str(s) => self.bytes(s.as_bytes()),
            FieldValue::Bytes(b) => self.bytes(b),
        }
    }

    /// Writes a nested message
    pub fn message<M: Message + ?Sized>(&mut self, number: u32, message: &M) -> io::Result<()> {
        let mut size = SizeCounter::default();
        message.encode(&mut Encoder::new(&mut size))?;

        self.tag(number, WireType::LengthDelimited)?;
        self.varint(size.0 as u64)?;
        message.encode(self)
    }

    #[inline]
    fn tag(&mut self, number: u32, wire_type: WireType) -> io::Result<()> {
        debug_assert!(number >= 1 && number < (1 << 29));
        self.varint(((number as u64) << 3) | wire_type as u64)
    }

    #[inline]
    fn bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.varint(data.len() as u64)?;
        self.sink.write(data)
    }

    fn varint(&mut self, mut value: u64) -> io::Result<()> {
        let mut buf = [0u8; 10];
        let mut len = 0;

        loop {
            if value < 0x80 {
                buf[len] = value as u8;
                len += 1;
                break;
            }

            buf[len] = ((value & 0x7f) | 0x80) as u8;
            len += 1;
            value >>= 7;
        }

        self.sink.write(&buf[..len])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode(f: impl FnOnce(&mut Encoder<'_, Vec<u8>>) -> io::Result<()>) -> Vec<u8> {
        let mut out = Vec::new();
        f(&mut Encoder::new(&mut out)).unwrap();
        out
    }

    #[test]
    fn varints() {
        assert_eq!(encode(|e| e.field(1, FieldValue::Uint64(0))), [0x08, 0x00]);
        assert_eq!(encode(|e| e.field(1, FieldValue::Uint64(150))), [0x08, 0x96, 0x01]);
        assert_eq!(encode(|e| e.field(2, FieldValue::Bool(true))), [0x10, 0x01]);

        let max = encode(|e| e.field(1, FieldValue::Uint64(u64::MAX)));
        assert_eq!(max.len(), 11);
        assert_eq!(max[10], 0x01);

        // -1 as int64 is 10 bytes of varint
        let neg = encode(|e| e.field(3, FieldValue::Int64(-1)));
        assert_eq!(neg.len(), 11);
        assert_eq!(neg[0], 0x18);
        assert!(neg[1..10].iter().all(|b| *b == 0xff));
        assert_eq!(neg[10], 0x01);
    }

    #[test]
    fn strings() {
        assert_eq!(
            encode(|e| e.field(2, FieldValue::Str("testing"))),
            b"\x12\x07testing"
        );
        assert_eq!(encode(|e| e.field(1, FieldValue::Bytes(&[]))), [0x0a, 0x00]);
        // field numbers above 15 need a multi byte tag
        assert_eq!(encode(|e| e.field(16, FieldValue::Bytes(&[0xaa]))), [0x82, 0x01, 0x01, 0xaa]);
    }

    struct Inner(u64);

    impl Message for Inner {
        fn encode<S: Sink>(&self, encoder: &mut Encoder<'_, S>) -> io::Result<()> {
            encoder.field(1, FieldValue::Uint64(self.0))
        }
    }

    struct Outer(Vec<Inner>);

    impl Message for Outer {
        fn encode<S: Sink>(&self, encoder: &mut Encoder<'_, S>) -> io::Result<()> {
            for inner in &self.0 {
                encoder.message(3, inner)?;
            }
            Ok(())
        }
    }

    #[test]
    fn nested_messages() {
        let outer = Outer(vec![Inner(150), Inner(1)]);
        let out = encode(|e| e.message(1, &outer));

        assert_eq!(
            out,
            [
                0x0a, 0x09, // outer, 9 bytes
                0x1a, 0x03, 0x08, 0x96, 0x01, // inner(150)
                0x1a, 0x02, 0x08, 0x01, // inner(1)
            ]
        );

        let mut size = SizeCounter::default();
        Encoder::new(&mut size).message(1, &outer).unwrap();
        assert_eq!(size.0, out.len());
    }
}
