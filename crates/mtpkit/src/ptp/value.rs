//! Typed PTP dataset values.

use super::codec::{CodecError, Reader, Writer};

/// PTP data type codes, as used in prop descriptions and prop-list datasets.
pub mod data_type {
    pub const INT8: u16 = 0x0001;
    pub const UINT8: u16 = 0x0002;
    pub const INT16: u16 = 0x0003;
    pub const UINT16: u16 = 0x0004;
    pub const INT32: u16 = 0x0005;
    pub const UINT32: u16 = 0x0006;
    pub const INT64: u16 = 0x0007;
    pub const UINT64: u16 = 0x0008;
    pub const INT128: u16 = 0x0009;
    pub const UINT128: u16 = 0x000A;
    /// Array types set the 0x4000 bit over their element type.
    pub const ARRAY_FLAG: u16 = 0x4000;
    pub const STRING: u16 = 0xFFFF;
}

/// One typed value read from (or written to) a dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum PtpValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    /// 128-bit and other opaque fixed-width values.
    Bytes(Vec<u8>),
    String(String),
    Array(Vec<PtpValue>),
}

impl PtpValue {
    /// Reads a value of wire type `type_code` from `r`. Arrays are a u32
    /// element count followed by that many elements of the base type; the
    /// count is capped by the reader's array guard.
    pub fn read(type_code: u16, r: &mut Reader<'_>) -> Result<Self, CodecError> {
        if type_code != data_type::STRING && type_code & data_type::ARRAY_FLAG != 0 {
            let element_type = type_code & !data_type::ARRAY_FLAG;
            let count = r.count()?;
            let mut elements = Vec::with_capacity(count as usize);
            for _ in 0..count {
                elements.push(Self::read(element_type, r)?);
            }
            return Ok(Self::Array(elements));
        }
        Ok(match type_code {
            data_type::INT8 => Self::I8(r.i8()?),
            data_type::UINT8 => Self::U8(r.u8()?),
            data_type::INT16 => Self::I16(r.i16()?),
            data_type::UINT16 => Self::U16(r.u16()?),
            data_type::INT32 => Self::I32(r.i32()?),
            data_type::UINT32 => Self::U32(r.u32()?),
            data_type::INT64 => Self::I64(r.i64()?),
            data_type::UINT64 => Self::U64(r.u64()?),
            data_type::INT128 | data_type::UINT128 => Self::Bytes(r.bytes(16)?.to_vec()),
            data_type::STRING => Self::String(r.ptp_string()?),
            other => return Err(CodecError::BadString(unknown_type_name(other))),
        })
    }

    /// Writes a scalar or string value. Used by SetObjectPropValue.
    pub fn write(&self, w: &mut Writer) {
        match self {
            Self::I8(v) => w.i8(*v),
            Self::U8(v) => w.u8(*v),
            Self::I16(v) => w.i16(*v),
            Self::U16(v) => w.u16(*v),
            Self::I32(v) => w.i32(*v),
            Self::U32(v) => w.u32(*v),
            Self::I64(v) => w.i64(*v),
            Self::U64(v) => w.u64(*v),
            Self::Bytes(v) => w.bytes(v),
            Self::String(v) => w.ptp_string(v),
            Self::Array(elements) => {
                w.u32(elements.len() as u32);
                for e in elements {
                    e.write(w);
                }
            }
        }
    }

    /// Widening view as u64, for size-like properties.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U8(v) => Some(u64::from(*v)),
            Self::U16(v) => Some(u64::from(*v)),
            Self::U32(v) => Some(u64::from(*v)),
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_u16(&self) -> Option<u16> {
        self.as_u64().and_then(|v| u16::try_from(v).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

fn unknown_type_name(_code: u16) -> &'static str {
    "unknown data type"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_back(type_code: u16, value: &PtpValue) -> PtpValue {
        let mut w = Writer::new();
        value.write(&mut w);
        let mut r = Reader::new(w.as_slice());
        PtpValue::read(type_code, &mut r).unwrap()
    }

    #[test]
    fn test_scalar_round_trips() {
        assert_eq!(read_back(data_type::UINT8, &PtpValue::U8(0xAB)), PtpValue::U8(0xAB));
        assert_eq!(read_back(data_type::INT16, &PtpValue::I16(-2)), PtpValue::I16(-2));
        assert_eq!(
            read_back(data_type::UINT64, &PtpValue::U64(5_000_000_000)),
            PtpValue::U64(5_000_000_000)
        );
        assert_eq!(
            read_back(data_type::STRING, &PtpValue::String("IMG_0001.JPG".to_string())),
            PtpValue::String("IMG_0001.JPG".to_string())
        );
    }

    #[test]
    fn test_array_layout() {
        let arr = PtpValue::Array(vec![PtpValue::U16(0x1001), PtpValue::U16(0x1007)]);
        let mut w = Writer::new();
        arr.write(&mut w);
        // count then elements, all little-endian
        assert_eq!(w.as_slice(), &[2, 0, 0, 0, 0x01, 0x10, 0x07, 0x10]);
        assert_eq!(read_back(data_type::ARRAY_FLAG | data_type::UINT16, &arr), arr);
    }

    #[test]
    fn test_array_count_guard() {
        let mut w = Writer::new();
        w.u32(1_000_000);
        let mut r = Reader::new(w.as_slice());
        assert!(matches!(
            PtpValue::read(data_type::ARRAY_FLAG | data_type::UINT32, &mut r),
            Err(CodecError::CountTooLarge(_))
        ));
    }

    #[test]
    fn test_as_u64_widening() {
        assert_eq!(PtpValue::U16(7).as_u64(), Some(7));
        assert_eq!(PtpValue::U64(u64::MAX).as_u64(), Some(u64::MAX));
        assert_eq!(PtpValue::String("7".to_string()).as_u64(), None);
        assert_eq!(PtpValue::I32(7).as_u64(), None);
    }

    #[test]
    fn test_u128_as_bytes() {
        let mut w = Writer::new();
        w.bytes(&[1u8; 16]);
        let mut r = Reader::new(w.as_slice());
        assert_eq!(
            PtpValue::read(data_type::UINT128, &mut r).unwrap(),
            PtpValue::Bytes(vec![1u8; 16])
        );
    }
}
