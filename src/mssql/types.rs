//! TDS type encoding and decoding.
//!
//! This module provides wire-format encoding for RPC parameters and
//! decoding for row cells, covering the fixed-length integer/float/bit
//! types and their nullable variants, plus NVARCHAR and VARBINARY.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

// ============================================================================
// Wire Type Tokens
// ============================================================================

/// TDS data type tokens.
pub(crate) mod type_id {
    pub const INT1: u8 = 0x30;
    pub const BIT: u8 = 0x32;
    pub const INT2: u8 = 0x34;
    pub const INT4: u8 = 0x38;
    pub const FLT4: u8 = 0x3B;
    pub const FLT8: u8 = 0x3E;
    pub const INT8: u8 = 0x7F;
    pub const INTN: u8 = 0x26;
    pub const BITN: u8 = 0x68;
    pub const FLTN: u8 = 0x6D;
    pub const BIGVARBINARY: u8 = 0xA5;
    pub const NVARCHAR: u8 = 0xE7;
}

/// Sentinel length for NULL in variable-length cells.
const CHARBIN_NULL: u16 = 0xFFFF;

/// Maximum parameter payload in bytes (4000 UTF-16 code units).
///
/// Longer values would require PLP encoding, which this client does not
/// implement.
const MAX_VAR_BYTES: usize = 8000;

/// Collation sent with NVARCHAR parameters (Latin1_General_CI_AS).
const PARAM_COLLATION: [u8; 5] = [0x09, 0x04, 0xD0, 0x00, 0x34];

// ============================================================================
// Column Wire Types
// ============================================================================

/// The wire type of a result-set column, as read from COLMETADATA.
///
/// Nullable variants carry the declared maximum size; the actual width of
/// each cell is read from the row data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    TinyInt,
    Bit,
    SmallInt,
    Int,
    BigInt,
    Real,
    Float,
    IntN(u8),
    BitN,
    FltN(u8),
    NVarChar(u16),
    BigVarBinary(u16),
}

impl DataType {
    /// Decode a TYPE_INFO block from column metadata.
    ///
    /// Advances past any type-specific fields (size bytes, collation).
    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self> {
        ensure(buf, 1)?;
        let ty = buf.get_u8();

        match ty {
            type_id::INT1 => Ok(DataType::TinyInt),
            type_id::BIT => Ok(DataType::Bit),
            type_id::INT2 => Ok(DataType::SmallInt),
            type_id::INT4 => Ok(DataType::Int),
            type_id::INT8 => Ok(DataType::BigInt),
            type_id::FLT4 => Ok(DataType::Real),
            type_id::FLT8 => Ok(DataType::Float),
            type_id::INTN => {
                ensure(buf, 1)?;
                Ok(DataType::IntN(buf.get_u8()))
            }
            type_id::BITN => {
                ensure(buf, 1)?;
                buf.advance(1); // max size, always 1
                Ok(DataType::BitN)
            }
            type_id::FLTN => {
                ensure(buf, 1)?;
                Ok(DataType::FltN(buf.get_u8()))
            }
            type_id::NVARCHAR => {
                ensure(buf, 7)?;
                let max_len = buf.get_u16_le();
                buf.advance(5); // collation
                Ok(DataType::NVarChar(max_len))
            }
            type_id::BIGVARBINARY => {
                ensure(buf, 2)?;
                Ok(DataType::BigVarBinary(buf.get_u16_le()))
            }
            _ => Err(Error::Type(format!("unsupported column type 0x{ty:02X}"))),
        }
    }

    /// SQL name of this type, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            DataType::TinyInt | DataType::IntN(1) => "tinyint",
            DataType::SmallInt | DataType::IntN(2) => "smallint",
            DataType::Int | DataType::IntN(4) => "int",
            DataType::BigInt | DataType::IntN(_) => "bigint",
            DataType::Bit | DataType::BitN => "bit",
            DataType::Real | DataType::FltN(4) => "real",
            DataType::Float | DataType::FltN(_) => "float",
            DataType::NVarChar(_) => "nvarchar",
            DataType::BigVarBinary(_) => "varbinary",
        }
    }
}

// ============================================================================
// Values
// ============================================================================

/// A SQL Server value.
#[derive(Debug, Clone, PartialEq)]
pub enum MssqlValue {
    Null,
    Bit(bool),
    TinyInt(u8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Real(f32),
    Float(f64),
    NVarChar(String),
    Binary(Vec<u8>),
}

impl MssqlValue {
    /// Check if this value is NULL.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, MssqlValue::Null)
    }

    /// The type name used when declaring this value as an `sp_executesql`
    /// parameter.
    pub(crate) fn declare_type(&self) -> &'static str {
        match self {
            MssqlValue::Null | MssqlValue::NVarChar(_) => "nvarchar(4000)",
            MssqlValue::Bit(_) => "bit",
            MssqlValue::TinyInt(_) => "tinyint",
            MssqlValue::SmallInt(_) => "smallint",
            MssqlValue::Int(_) => "int",
            MssqlValue::BigInt(_) => "bigint",
            MssqlValue::Real(_) => "real",
            MssqlValue::Float(_) => "float",
            MssqlValue::Binary(_) => "varbinary(8000)",
        }
    }

    /// Encode this value as an RPC parameter (TYPE_INFO followed by data).
    ///
    /// Integers and floats go out as their nullable wire variants, the way
    /// the server itself describes parameters.
    pub(crate) fn encode_param(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            MssqlValue::Null => {
                buf.put_u8(type_id::NVARCHAR);
                buf.put_u16_le(MAX_VAR_BYTES as u16);
                buf.put_slice(&PARAM_COLLATION);
                buf.put_u16_le(CHARBIN_NULL);
            }
            MssqlValue::Bit(v) => {
                buf.put_u8(type_id::BITN);
                buf.put_u8(1);
                buf.put_u8(1);
                buf.put_u8(u8::from(*v));
            }
            MssqlValue::TinyInt(v) => {
                buf.put_u8(type_id::INTN);
                buf.put_u8(1);
                buf.put_u8(1);
                buf.put_u8(*v);
            }
            MssqlValue::SmallInt(v) => {
                buf.put_u8(type_id::INTN);
                buf.put_u8(2);
                buf.put_u8(2);
                buf.put_i16_le(*v);
            }
            MssqlValue::Int(v) => {
                buf.put_u8(type_id::INTN);
                buf.put_u8(4);
                buf.put_u8(4);
                buf.put_i32_le(*v);
            }
            MssqlValue::BigInt(v) => {
                buf.put_u8(type_id::INTN);
                buf.put_u8(8);
                buf.put_u8(8);
                buf.put_i64_le(*v);
            }
            MssqlValue::Real(v) => {
                buf.put_u8(type_id::FLTN);
                buf.put_u8(4);
                buf.put_u8(4);
                buf.put_f32_le(*v);
            }
            MssqlValue::Float(v) => {
                buf.put_u8(type_id::FLTN);
                buf.put_u8(8);
                buf.put_u8(8);
                buf.put_f64_le(*v);
            }
            MssqlValue::NVarChar(s) => {
                let encoded = utf16le_bytes(s);
                if encoded.len() > MAX_VAR_BYTES {
                    return Err(Error::Type(format!(
                        "string parameter of {} UTF-16 code units exceeds the 4000 limit",
                        encoded.len() / 2
                    )));
                }
                buf.put_u8(type_id::NVARCHAR);
                buf.put_u16_le(MAX_VAR_BYTES as u16);
                buf.put_slice(&PARAM_COLLATION);
                buf.put_u16_le(encoded.len() as u16);
                buf.put_slice(&encoded);
            }
            MssqlValue::Binary(b) => {
                if b.len() > MAX_VAR_BYTES {
                    return Err(Error::Type(format!(
                        "binary parameter of {} bytes exceeds the 8000 limit",
                        b.len()
                    )));
                }
                buf.put_u8(type_id::BIGVARBINARY);
                buf.put_u16_le(MAX_VAR_BYTES as u16);
                buf.put_u16_le(b.len() as u16);
                buf.put_slice(b);
            }
        }
        Ok(())
    }

    /// Decode a single row cell for a column of the given type.
    pub(crate) fn decode_cell(ty: &DataType, buf: &mut Bytes) -> Result<MssqlValue> {
        match ty {
            DataType::TinyInt => {
                ensure(buf, 1)?;
                Ok(MssqlValue::TinyInt(buf.get_u8()))
            }
            DataType::Bit => {
                ensure(buf, 1)?;
                Ok(MssqlValue::Bit(buf.get_u8() != 0))
            }
            DataType::SmallInt => {
                ensure(buf, 2)?;
                Ok(MssqlValue::SmallInt(buf.get_i16_le()))
            }
            DataType::Int => {
                ensure(buf, 4)?;
                Ok(MssqlValue::Int(buf.get_i32_le()))
            }
            DataType::BigInt => {
                ensure(buf, 8)?;
                Ok(MssqlValue::BigInt(buf.get_i64_le()))
            }
            DataType::Real => {
                ensure(buf, 4)?;
                Ok(MssqlValue::Real(buf.get_f32_le()))
            }
            DataType::Float => {
                ensure(buf, 8)?;
                Ok(MssqlValue::Float(buf.get_f64_le()))
            }
            DataType::IntN(_) => {
                ensure(buf, 1)?;
                let len = buf.get_u8() as usize;
                ensure(buf, len)?;
                match len {
                    0 => Ok(MssqlValue::Null),
                    1 => Ok(MssqlValue::TinyInt(buf.get_u8())),
                    2 => Ok(MssqlValue::SmallInt(buf.get_i16_le())),
                    4 => Ok(MssqlValue::Int(buf.get_i32_le())),
                    8 => Ok(MssqlValue::BigInt(buf.get_i64_le())),
                    n => Err(Error::Type(format!("invalid INTN cell width: {n}"))),
                }
            }
            DataType::BitN => {
                ensure(buf, 1)?;
                match buf.get_u8() {
                    0 => Ok(MssqlValue::Null),
                    _ => {
                        ensure(buf, 1)?;
                        Ok(MssqlValue::Bit(buf.get_u8() != 0))
                    }
                }
            }
            DataType::FltN(_) => {
                ensure(buf, 1)?;
                let len = buf.get_u8() as usize;
                ensure(buf, len)?;
                match len {
                    0 => Ok(MssqlValue::Null),
                    4 => Ok(MssqlValue::Real(buf.get_f32_le())),
                    8 => Ok(MssqlValue::Float(buf.get_f64_le())),
                    n => Err(Error::Type(format!("invalid FLTN cell width: {n}"))),
                }
            }
            DataType::NVarChar(_) => {
                ensure(buf, 2)?;
                let len = buf.get_u16_le();
                if len == CHARBIN_NULL {
                    return Ok(MssqlValue::Null);
                }
                let len = len as usize;
                ensure(buf, len)?;
                let data = buf.split_to(len);
                Ok(MssqlValue::NVarChar(utf16le_string(&data)?))
            }
            DataType::BigVarBinary(_) => {
                ensure(buf, 2)?;
                let len = buf.get_u16_le();
                if len == CHARBIN_NULL {
                    return Ok(MssqlValue::Null);
                }
                let len = len as usize;
                ensure(buf, len)?;
                Ok(MssqlValue::Binary(buf.split_to(len).to_vec()))
            }
        }
    }
}

impl From<&str> for MssqlValue {
    fn from(s: &str) -> Self {
        MssqlValue::NVarChar(s.to_string())
    }
}

impl From<String> for MssqlValue {
    fn from(s: String) -> Self {
        MssqlValue::NVarChar(s)
    }
}

impl From<i32> for MssqlValue {
    fn from(v: i32) -> Self {
        MssqlValue::Int(v)
    }
}

impl From<i64> for MssqlValue {
    fn from(v: i64) -> Self {
        MssqlValue::BigInt(v)
    }
}

impl From<bool> for MssqlValue {
    fn from(v: bool) -> Self {
        MssqlValue::Bit(v)
    }
}

// ============================================================================
// UTF-16 Helpers
// ============================================================================

/// Encode a string as UTF-16LE bytes.
pub(crate) fn utf16le_bytes(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Decode UTF-16LE bytes into a string.
pub(crate) fn utf16le_string(data: &[u8]) -> Result<String> {
    if data.len() % 2 != 0 {
        return Err(Error::Protocol(
            "odd byte count in UTF-16 string".to_string(),
        ));
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| Error::Protocol(format!("invalid UTF-16: {e}")))
}

/// Verify the buffer holds at least `n` more bytes.
pub(crate) fn ensure(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::Protocol(format!(
            "truncated stream: needed {n} bytes, {} available",
            buf.remaining()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_param_encoding() {
        let mut buf = BytesMut::new();
        MssqlValue::Int(42).encode_param(&mut buf).unwrap();

        // INTN, max size 4, actual size 4, little-endian value
        assert_eq!(&buf[..], &[0x26, 4, 4, 42, 0, 0, 0]);
    }

    #[test]
    fn test_null_param_is_nvarchar_null() {
        let mut buf = BytesMut::new();
        MssqlValue::Null.encode_param(&mut buf).unwrap();

        assert_eq!(buf[0], 0xE7);
        // Trailing length sentinel marks NULL
        assert_eq!(&buf[buf.len() - 2..], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_nvarchar_param_round_trip() {
        let mut buf = BytesMut::new();
        MssqlValue::NVarChar("R1".to_string())
            .encode_param(&mut buf)
            .unwrap();

        // Skip TYPE_INFO (type + maxlen + collation), read the char data
        let mut data = Bytes::copy_from_slice(&buf[8..]);
        let len = data.get_u16_le() as usize;
        assert_eq!(len, 4);
        let s = utf16le_string(&data.split_to(len)).unwrap();
        assert_eq!(s, "R1");
    }

    #[test]
    fn test_oversized_string_param_rejected() {
        let mut buf = BytesMut::new();
        let big = "x".repeat(4001);
        let err = MssqlValue::NVarChar(big).encode_param(&mut buf);
        assert!(matches!(err, Err(Error::Type(_))));
    }

    #[test]
    fn test_intn_cell_decoding() {
        let mut buf = Bytes::copy_from_slice(&[4, 42, 0, 0, 0]);
        let value = MssqlValue::decode_cell(&DataType::IntN(4), &mut buf).unwrap();
        assert_eq!(value, MssqlValue::Int(42));
    }

    #[test]
    fn test_intn_null_cell() {
        let mut buf = Bytes::copy_from_slice(&[0]);
        let value = MssqlValue::decode_cell(&DataType::IntN(4), &mut buf).unwrap();
        assert!(value.is_null());
    }

    #[test]
    fn test_nvarchar_cell_decoding() {
        let mut data = vec![6, 0]; // 6 bytes
        data.extend_from_slice(&utf16le_bytes("abc"));
        let mut buf = Bytes::copy_from_slice(&data);

        let value = MssqlValue::decode_cell(&DataType::NVarChar(8000), &mut buf).unwrap();
        assert_eq!(value, MssqlValue::NVarChar("abc".to_string()));
    }

    #[test]
    fn test_nvarchar_null_cell() {
        let mut buf = Bytes::copy_from_slice(&[0xFF, 0xFF]);
        let value = MssqlValue::decode_cell(&DataType::NVarChar(8000), &mut buf).unwrap();
        assert!(value.is_null());
    }

    #[test]
    fn test_fixed_int_cell_decoding() {
        let mut buf = Bytes::copy_from_slice(&1i32.to_le_bytes());
        let value = MssqlValue::decode_cell(&DataType::Int, &mut buf).unwrap();
        assert_eq!(value, MssqlValue::Int(1));
    }

    #[test]
    fn test_truncated_cell_is_protocol_error() {
        let mut buf = Bytes::copy_from_slice(&[4, 42, 0]); // claims 4, has 2
        let err = MssqlValue::decode_cell(&DataType::IntN(4), &mut buf);
        assert!(matches!(err, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_declare_types() {
        assert_eq!(MssqlValue::Int(1).declare_type(), "int");
        assert_eq!(MssqlValue::BigInt(1).declare_type(), "bigint");
        assert_eq!(MssqlValue::Null.declare_type(), "nvarchar(4000)");
        assert_eq!(
            MssqlValue::NVarChar(String::new()).declare_type(),
            "nvarchar(4000)"
        );
    }
}
