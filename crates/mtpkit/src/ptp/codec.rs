//! Little-endian wire codec: bounds-checked reader, growable writer, and the
//! PTP string encoding (length-prefixed UTF-16LE with a counted terminator).
//!
//! Everything a device sends is hostile input: reads are bounds-checked,
//! array counts are capped, and string lengths are validated, so malformed
//! datasets surface as errors rather than panics or huge allocations.

/// Upper bound on any element count read from the wire. PTP arrays carry a
/// u32 count; real devices never exceed tens of thousands of elements, so
/// anything larger is a corrupt or malicious dataset.
pub const MAX_ARRAY_COUNT: u32 = 100_000;

/// A decode failure. Converted to [`crate::Error::Malformed`] at the
/// protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended before the field did.
    UnexpectedEnd { wanted: usize, available: usize },
    /// An array count exceeded [`MAX_ARRAY_COUNT`].
    CountTooLarge(u32),
    /// A PTP string was malformed (0xFF length, or truncated payload).
    BadString(&'static str),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEnd { wanted, available } => {
                write!(f, "unexpected end of data: wanted {wanted} bytes, {available} left")
            }
            Self::CountTooLarge(count) => {
                write!(f, "array count {count} exceeds limit of {MAX_ARRAY_COUNT}")
            }
            Self::BadString(why) => write!(f, "bad PTP string: {why}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Bounds-checked little-endian reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! read_le {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty, CodecError> {
            const N: usize = size_of::<$ty>();
            let bytes = self.bytes(N)?;
            Ok(<$ty>::from_le_bytes(bytes.try_into().expect("slice length checked")))
        }
    };
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns a view of the next `n` bytes and advances past them.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEnd { wanted: n, available: self.remaining() });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.bytes(n).map(|_| ())
    }

    read_le!(u8, u8);
    read_le!(u16, u16);
    read_le!(u32, u32);
    read_le!(u64, u64);
    read_le!(i8, i8);
    read_le!(i16, i16);
    read_le!(i32, i32);
    read_le!(i64, i64);

    /// Reads a u32 element count, rejecting counts past [`MAX_ARRAY_COUNT`].
    pub fn count(&mut self) -> Result<u32, CodecError> {
        let count = self.u32()?;
        if count > MAX_ARRAY_COUNT {
            return Err(CodecError::CountTooLarge(count));
        }
        Ok(count)
    }

    /// Reads a PTP string: `len:u8` (code units, terminator included), then
    /// `len` UTF-16LE code units. The empty string is the single byte 0x00;
    /// a length of 0xFF is rejected outright.
    pub fn ptp_string(&mut self) -> Result<String, CodecError> {
        let len = self.u8()?;
        if len == 0 {
            return Ok(String::new());
        }
        if len == 0xFF {
            return Err(CodecError::BadString("length 0xFF"));
        }
        let raw = self
            .bytes(len as usize * 2)
            .map_err(|_| CodecError::BadString("truncated payload"))?;
        let mut units = Vec::with_capacity(len as usize);
        for pair in raw.chunks_exact(2) {
            units.push(u16::from_le_bytes([pair[0], pair[1]]));
        }
        // The declared length counts the NUL terminator; some devices skip
        // it, so stop at the first NUL rather than demanding one.
        if let Some(nul) = units.iter().position(|&u| u == 0) {
            units.truncate(nul);
        }
        Ok(String::from_utf16_lossy(&units))
    }
}

/// Growable little-endian writer.
#[derive(Default)]
pub struct Writer {
    out: Vec<u8>,
}

macro_rules! write_le {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, value: $ty) {
            self.out.extend_from_slice(&value.to_le_bytes());
        }
    };
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
    }

    write_le!(u8, u8);
    write_le!(u16, u16);
    write_le!(u32, u32);
    write_le!(u64, u64);
    write_le!(i8, i8);
    write_le!(i16, i16);
    write_le!(i32, i32);
    write_le!(i64, i64);

    /// Writes a PTP string. Strings longer than 253 code units are truncated
    /// so the length byte (units + terminator) stays below the reserved 0xFF.
    pub fn ptp_string(&mut self, s: &str) {
        if s.is_empty() {
            self.u8(0);
            return;
        }
        let mut units: Vec<u16> = s.encode_utf16().collect();
        if units.len() > 253 {
            units.truncate(253);
        }
        self.u8(units.len() as u8 + 1);
        for unit in &units {
            self.u16(*unit);
        }
        self.u16(0); // terminator, counted in the length byte
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.out
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_u64_little_endian() {
        let mut r = Reader::new(&[0x01, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(r.u64().unwrap(), 1);
    }

    #[test]
    fn test_reader_scalars() {
        let mut r = Reader::new(&[0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xFF]);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.u32().unwrap(), 0x12345678);
        assert_eq!(r.i8().unwrap(), -1);
        assert!(r.is_empty());
    }

    #[test]
    fn test_reader_out_of_bounds() {
        let mut r = Reader::new(&[0x01, 0x02]);
        assert!(matches!(
            r.u32(),
            Err(CodecError::UnexpectedEnd { wanted: 4, available: 2 })
        ));
        // A failed read consumes nothing.
        assert_eq!(r.u16().unwrap(), 0x0201);
    }

    #[test]
    fn test_count_guard() {
        let mut w = Writer::new();
        w.u32(MAX_ARRAY_COUNT);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(r.count().unwrap(), MAX_ARRAY_COUNT);

        let mut w = Writer::new();
        w.u32(MAX_ARRAY_COUNT + 1);
        let mut r = Reader::new(w.as_slice());
        assert!(matches!(r.count(), Err(CodecError::CountTooLarge(_))));
    }

    #[test]
    fn test_ptp_string_round_trip() {
        for s in ["", "a", "DCIM", "photo.jpg", "fünf €", "日本語ファイル名"] {
            let mut w = Writer::new();
            w.ptp_string(s);
            let mut r = Reader::new(w.as_slice());
            assert_eq!(r.ptp_string().unwrap(), s, "round-trip of {s:?}");
        }
    }

    #[test]
    fn test_ptp_string_empty_is_single_zero_byte() {
        let mut w = Writer::new();
        w.ptp_string("");
        assert_eq!(w.as_slice(), &[0x00]);
    }

    #[test]
    fn test_ptp_string_layout() {
        let mut w = Writer::new();
        w.ptp_string("ab");
        // length 3 (2 units + terminator), 'a', 'b', NUL
        assert_eq!(w.as_slice(), &[3, b'a', 0, b'b', 0, 0, 0]);
    }

    #[test]
    fn test_ptp_string_length_ff_rejected() {
        let mut r = Reader::new(&[0xFF, 0x41, 0x00]);
        assert!(matches!(r.ptp_string(), Err(CodecError::BadString(_))));
    }

    #[test]
    fn test_ptp_string_truncated_payload_rejected() {
        // Claims 4 code units but carries only 2 bytes.
        let mut r = Reader::new(&[4, b'a', 0]);
        assert!(matches!(r.ptp_string(), Err(CodecError::BadString(_))));
    }

    #[test]
    fn test_ptp_string_missing_terminator_tolerated() {
        // Length 2, two non-NUL units, no terminator. Seen in the wild.
        let mut r = Reader::new(&[2, b'h', 0, b'i', 0]);
        assert_eq!(r.ptp_string().unwrap(), "hi");
    }

    #[test]
    fn test_ptp_string_encode_truncates_long_input() {
        let long: String = "x".repeat(300);
        let mut w = Writer::new();
        w.ptp_string(&long);
        // The truncated encoding must still decode, i.e. stay below 0xFF.
        let mut r = Reader::new(w.as_slice());
        let back = r.ptp_string().unwrap();
        assert_eq!(back.len(), 253);
    }
}
