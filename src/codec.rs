//! # Field Codec Module
//!
//! Every field in a container record is encoded by a `(type, width, scale)`
//! triple.  The type is a stable numeric code carried in the file preamble,
//! the width is the encoded byte count, and the scale packs reals into
//! integers: a real is multiplied by the scale and rounded on write, and the
//! stored integer is divided by the scale on read.  Scale zero means the
//! stored value is returned as-is.
//!
//! The codec itself is stateless; it maps a single `Value` to bytes and back
//! given the field triple and the container byte order.  Interpretation of a
//! whole record belongs to the `schema` module.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Enumerates codec errors.  The `Display` trait will print equivalent long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("value {0} overflows a {1}-byte integer field")]
    IntegerOverflow(f64,u8),
    #[error("string `{0}` is longer than the field width {1}")]
    StringOverflow(String,u8),
    #[error("string `{0}` does not fill the fixed width {1}")]
    StringUnderflow(String,u8),
    #[error("string `{0}` is not pure ASCII")]
    NotAscii(String),
    #[error("opaque payload of {0} bytes does not match the field width {1}")]
    OpaqueWidth(usize,u8),
    #[error("value {0} cannot be encoded as this field type")]
    ValueType(Value),
    #[error("raw slice of {0} bytes is shorter than the field width {1}")]
    ShortSlice(usize,u8)
}

/// Byte ordering of every multi-byte value in a container, chosen by the
/// 2-byte marker in the preamble.
#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub enum ByteOrder {
    Little,
    Big
}

impl ByteOrder {
    /// The 2-byte marker written at offset 124 of the preamble.
    pub fn marker(&self) -> [u8;2] {
        match self {
            Self::Little => *b"SK",
            Self::Big => *b"KS"
        }
    }
    pub fn from_marker(marker: &[u8;2]) -> Option<Self> {
        match marker {
            b"SK" => Some(Self::Little),
            b"KS" => Some(Self::Big),
            _ => None
        }
    }
}

/// Stable numeric codes for the primitive field kinds.
/// Codes 0-8 are the legacy set, 9-12 were added for wide and floating
/// fields, 128 flags a field needing special treatment by the consumer.
#[derive(FromPrimitive,Clone,Copy,PartialEq,Eq,Debug)]
pub enum DataType {
    /// single ASCII character
    Char = 0,
    Int8 = 1,
    Uint8 = 2,
    Int16 = 3,
    Uint16 = 4,
    Int32 = 5,
    Uint32 = 6,
    /// fixed-length ASCII array, not null terminated, must fill the width
    CharArray = 7,
    /// ASCII string, null terminated, padded with `\0` up to the width
    Str = 8,
    Int64 = 9,
    Uint64 = 10,
    Float32 = 11,
    Float64 = 12,
    /// opaque bytes, round-tripped verbatim
    Opaque = 128
}

impl DataType {
    pub fn from_code(code: u8) -> Option<Self> {
        FromPrimitive::from_u8(code)
    }
    pub fn code(&self) -> u8 {
        *self as u8
    }
    /// Byte width fixed by the type, or None for the sized kinds
    /// (`CharArray`, `Str`, `Opaque`) whose width is chosen per field.
    pub fn natural_width(&self) -> Option<u8> {
        match self {
            Self::Char | Self::Int8 | Self::Uint8 => Some(1),
            Self::Int16 | Self::Uint16 => Some(2),
            Self::Int32 | Self::Uint32 | Self::Float32 => Some(4),
            Self::Int64 | Self::Uint64 | Self::Float64 => Some(8),
            Self::CharArray | Self::Str | Self::Opaque => None
        }
    }
    /// Scaling applies only to the integral kinds.
    pub fn is_integral(&self) -> bool {
        matches!(self,Self::Int8 | Self::Uint8 | Self::Int16 | Self::Uint16 |
            Self::Int32 | Self::Uint32 | Self::Int64 | Self::Uint64)
    }
    pub fn is_signed(&self) -> bool {
        matches!(self,Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }
}

/// A single decoded field value.  This is the seam between callers holding
/// domain data and the byte-level codec.
#[derive(Clone,PartialEq,Debug)]
pub enum Value {
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>)
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Uint(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Uint(v) => i64::try_from(*v).ok(),
            _ => None
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self,f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f,"{}",v),
            Self::Uint(v) => write!(f,"{}",v),
            Self::Float(v) => write!(f,"{}",v),
            Self::Str(s) => write!(f,"{}",s),
            Self::Bytes(b) => write!(f,"{} bytes",b.len())
        }
    }
}

/// Interpret bytes as a null-terminated ASCII string, taking everything
/// when no terminator is present.
pub fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b==0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[0..end]).to_string()
}

fn check_ascii(s: &str) -> Result<(),Error> {
    if !s.is_ascii() {
        return Err(Error::NotAscii(s.to_string()));
    }
    Ok(())
}

/// Range-check an integer against the field's signedness and width, then
/// lay it out in the requested byte order.
fn int_to_bytes(val: i128,signed: bool,width: u8,order: ByteOrder) -> Result<Vec<u8>,Error> {
    let bits = 8 * width as u32;
    let (lo,hi) = match signed {
        true => (-(1i128 << (bits-1)),(1i128 << (bits-1)) - 1),
        false => (0,(1i128 << bits) - 1)
    };
    if val < lo || val > hi {
        return Err(Error::IntegerOverflow(val as f64,width));
    }
    let le = (val as u128).to_le_bytes();
    let mut ans = le[0..width as usize].to_vec();
    if order==ByteOrder::Big {
        ans.reverse();
    }
    Ok(ans)
}

fn int_from_bytes(raw: &[u8],signed: bool,order: ByteOrder) -> Value {
    let mut le = raw.to_vec();
    if order==ByteOrder::Big {
        le.reverse();
    }
    let mut buf = [0u8;16];
    buf[0..le.len()].copy_from_slice(&le);
    let mut val = u128::from_le_bytes(buf) as i128;
    if signed {
        let bits = 8 * raw.len() as u32;
        let sign = 1i128 << (bits-1);
        if val & sign != 0 {
            val -= 1i128 << bits;
        }
        Value::Int(val as i64)
    } else if raw.len()==8 {
        Value::Uint(val as u64)
    } else {
        // narrow unsigned values are still exact in i64
        Value::Int(val as i64)
    }
}

fn str_to_bytes(s: &str,width: u8,null_terminate: bool) -> Result<Vec<u8>,Error> {
    check_ascii(s)?;
    if s.len() > width as usize {
        return Err(Error::StringOverflow(s.to_string(),width));
    }
    let mut ans = s.as_bytes().to_vec();
    if null_terminate {
        ans.resize(width as usize,0);
    }
    if ans.len() != width as usize {
        return Err(Error::StringUnderflow(s.to_string(),width));
    }
    Ok(ans)
}

/// Encode one value into exactly `width` bytes.  For integral types with a
/// nonzero scale the value is taken as a real, multiplied by the scale and
/// rounded; overflow of the stored width fails rather than wrapping.
pub fn encode(value: &Value,dtype: DataType,width: u8,scale: u32,order: ByteOrder) -> Result<Vec<u8>,Error> {
    if dtype.is_integral() {
        let stored: i128 = match scale {
            0 => match value {
                Value::Int(v) => *v as i128,
                Value::Uint(v) => *v as i128,
                _ => return Err(Error::ValueType(value.clone()))
            },
            s => {
                let real = value.as_f64().ok_or(Error::ValueType(value.clone()))?;
                let scaled = (real * s as f64).round();
                if !scaled.is_finite() || scaled.abs() >= (1u128 << 100) as f64 {
                    return Err(Error::IntegerOverflow(scaled,width));
                }
                scaled as i128
            }
        };
        return int_to_bytes(stored,dtype.is_signed(),width,order);
    }
    match dtype {
        DataType::Char => match value {
            Value::Str(s) => str_to_bytes(s,1,false),
            _ => Err(Error::ValueType(value.clone()))
        },
        DataType::CharArray => match value {
            Value::Str(s) => str_to_bytes(s,width,false),
            _ => Err(Error::ValueType(value.clone()))
        },
        DataType::Str => match value {
            Value::Str(s) => str_to_bytes(s,width,true),
            _ => Err(Error::ValueType(value.clone()))
        },
        DataType::Float32 => {
            let real = value.as_f64().ok_or(Error::ValueType(value.clone()))? as f32;
            Ok(match order {
                ByteOrder::Little => real.to_le_bytes().to_vec(),
                ByteOrder::Big => real.to_be_bytes().to_vec()
            })
        },
        DataType::Float64 => {
            let real = value.as_f64().ok_or(Error::ValueType(value.clone()))?;
            Ok(match order {
                ByteOrder::Little => real.to_le_bytes().to_vec(),
                ByteOrder::Big => real.to_be_bytes().to_vec()
            })
        },
        DataType::Opaque => match value {
            Value::Bytes(b) if b.len()==width as usize => Ok(b.clone()),
            Value::Bytes(b) => Err(Error::OpaqueWidth(b.len(),width)),
            _ => Err(Error::ValueType(value.clone()))
        },
        _ => unreachable!("integral kinds handled above")
    }
}

/// Decode one field's bytes without applying any scale.  The scale rule is
/// applied by `schema::Record::get`, so that unscaled access stays possible.
pub fn decode(raw: &[u8],dtype: DataType,width: u8,order: ByteOrder) -> Result<Value,Error> {
    if raw.len() < width as usize {
        return Err(Error::ShortSlice(raw.len(),width));
    }
    let raw = &raw[0..width as usize];
    if dtype.is_integral() {
        return Ok(int_from_bytes(raw,dtype.is_signed(),order));
    }
    match dtype {
        DataType::Char | DataType::CharArray => Ok(Value::Str(String::from_utf8_lossy(raw).to_string())),
        DataType::Str => Ok(Value::Str(cstr(raw))),
        DataType::Float32 => {
            let buf: [u8;4] = raw.try_into().expect("width checked above");
            Ok(Value::Float(match order {
                ByteOrder::Little => f32::from_le_bytes(buf) as f64,
                ByteOrder::Big => f32::from_be_bytes(buf) as f64
            }))
        },
        DataType::Float64 => {
            let buf: [u8;8] = raw.try_into().expect("width checked above");
            Ok(Value::Float(match order {
                ByteOrder::Little => f64::from_le_bytes(buf),
                ByteOrder::Big => f64::from_be_bytes(buf)
            }))
        },
        DataType::Opaque => Ok(Value::Bytes(raw.to_vec())),
        _ => unreachable!("integral kinds handled above")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip() {
        for order in [ByteOrder::Little,ByteOrder::Big] {
            let bytes = encode(&Value::Int(-1234),DataType::Int16,2,0,order).unwrap();
            assert_eq!(bytes.len(),2);
            assert_eq!(decode(&bytes,DataType::Int16,2,order).unwrap(),Value::Int(-1234));
        }
    }

    #[test]
    fn scaled_round_trip() {
        let bytes = encode(&Value::Float(30.0),DataType::Int32,4,1000000,ByteOrder::Little).unwrap();
        assert_eq!(decode(&bytes,DataType::Int32,4,ByteOrder::Little).unwrap(),Value::Int(30000000));
        let bytes = encode(&Value::Float(-13.2),DataType::Int32,4,100000,ByteOrder::Little).unwrap();
        assert_eq!(decode(&bytes,DataType::Int32,4,ByteOrder::Little).unwrap(),Value::Int(-1320000));
    }

    #[test]
    fn unsigned_wide_round_trip() {
        let bytes = encode(&Value::Uint(u64::MAX),DataType::Uint64,8,0,ByteOrder::Big).unwrap();
        assert_eq!(decode(&bytes,DataType::Uint64,8,ByteOrder::Big).unwrap(),Value::Uint(u64::MAX));
    }

    #[test]
    fn float_round_trip() {
        let bytes = encode(&Value::Float(12.5),DataType::Float64,8,0,ByteOrder::Little).unwrap();
        assert_eq!(decode(&bytes,DataType::Float64,8,ByteOrder::Little).unwrap(),Value::Float(12.5));
        let bytes = encode(&Value::Float(0.25),DataType::Float32,4,0,ByteOrder::Big).unwrap();
        assert_eq!(decode(&bytes,DataType::Float32,4,ByteOrder::Big).unwrap(),Value::Float(0.25));
    }

    #[test]
    fn scaled_overflow_fails() {
        // 300 * 1000 does not fit a 2-byte signed field
        assert!(encode(&Value::Float(300.0),DataType::Int16,2,1000,ByteOrder::Little).is_err());
        assert!(encode(&Value::Int(70000),DataType::Uint16,2,0,ByteOrder::Little).is_err());
    }

    #[test]
    fn strings() {
        let bytes = encode(&Value::Str("A0".to_string()),DataType::CharArray,2,0,ByteOrder::Little).unwrap();
        assert_eq!(bytes,b"A0".to_vec());
        // fixed arrays must fill the width
        assert!(encode(&Value::Str("A".to_string()),DataType::CharArray,2,0,ByteOrder::Little).is_err());
        let bytes = encode(&Value::Str("abc".to_string()),DataType::Str,6,0,ByteOrder::Little).unwrap();
        assert_eq!(bytes,b"abc\x00\x00\x00".to_vec());
        assert_eq!(decode(&bytes,DataType::Str,6,ByteOrder::Little).unwrap(),Value::Str("abc".to_string()));
        assert!(encode(&Value::Str("toolong".to_string()),DataType::Str,4,0,ByteOrder::Little).is_err());
    }

    #[test]
    fn opaque_verbatim() {
        let payload = Value::Bytes(vec![1,2,255]);
        let bytes = encode(&payload,DataType::Opaque,3,0,ByteOrder::Little).unwrap();
        assert_eq!(decode(&bytes,DataType::Opaque,3,ByteOrder::Little).unwrap(),payload);
    }

    #[test]
    fn type_codes_stable() {
        assert_eq!(DataType::from_code(5),Some(DataType::Int32));
        assert_eq!(DataType::from_code(128),Some(DataType::Opaque));
        assert_eq!(DataType::from_code(13),None);
        assert_eq!(DataType::Float64.code(),12);
    }
}
