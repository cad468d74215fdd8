//! # Schema Module
//!
//! A schema is an ordered list of named fields; every record in a container
//! is the fixed-size concatenation of its encoded fields.  The schema is
//! written into the container preamble, so a reader can interpret any
//! container without outside knowledge.
//!
//! Records are not self-describing.  `Record` is a view over raw bytes that
//! decodes fields on demand against the schema it was read with, rather than
//! eagerly building a name-to-value map.

use std::collections::HashMap;
use std::fmt;
use log::warn;
use crate::codec;
use crate::codec::{DataType,ByteOrder,Value};
use crate::DYNERR;

/// Longest allowed field name, fixed by the preamble layout.
pub const NAME_BYTES: usize = 10;

/// Enumerates schema errors.  The `Display` trait will print equivalent long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("field name `{0}` is longer than the 10-byte limit")]
    NameTooLong(String),
    #[error("field name `{0}` is not pure ASCII")]
    NameNotAscii(String),
    #[error("duplicate field name `{0}`")]
    DuplicateField(String),
    #[error("field `{name}` declares width {width} but type code {code} requires {natural}")]
    WidthMismatch { name: String, width: u8, code: u8, natural: u8 },
    #[error("field `{0}` is not in the schema")]
    UnknownField(String),
    #[error("missing expected field `{0}`")]
    MissingField(String),
    #[error("refusing to add field `{0}` after a record packer was assembled")]
    Frozen(String)
}

/// One schema entry: name, byte width, type code, and integer scale.
#[derive(Clone,PartialEq,Debug)]
pub struct FieldDescriptor {
    pub name: String,
    pub width: u8,
    pub dtype: DataType,
    pub scale: u32
}

impl FieldDescriptor {
    /// Build a descriptor, validating the name and the width against the
    /// type's natural width.
    pub fn new(name: &str,dtype: DataType,width: u8,scale: u32) -> Result<Self,Error> {
        if name.len() > NAME_BYTES {
            return Err(Error::NameTooLong(name.to_string()));
        }
        if !name.is_ascii() {
            return Err(Error::NameNotAscii(name.to_string()));
        }
        if let Some(natural) = dtype.natural_width() {
            if width != natural {
                return Err(Error::WidthMismatch {
                    name: name.to_string(),
                    width,
                    code: dtype.code(),
                    natural
                });
            }
        }
        Ok(Self {
            name: name.to_string(),
            width,
            dtype,
            scale
        })
    }
}

/// Ordered field list with fixed record size.  Field order is significant;
/// two schemas with the same fields in different orders describe different
/// records.
#[derive(Clone,Debug)]
pub struct Schema {
    fields: Vec<FieldDescriptor>,
    /// byte offset of each field within a record
    offsets: Vec<usize>,
    by_name: HashMap<String,usize>,
    record_size: usize
}

impl Schema {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            offsets: Vec::new(),
            by_name: HashMap::new(),
            record_size: 0
        }
    }
    pub fn from_fields(fields: Vec<FieldDescriptor>) -> Result<Self,Error> {
        let mut ans = Self::new();
        for field in fields {
            ans.push(field)?;
        }
        Ok(ans)
    }
    pub fn push(&mut self,field: FieldDescriptor) -> Result<(),Error> {
        if self.by_name.contains_key(&field.name) {
            return Err(Error::DuplicateField(field.name));
        }
        self.by_name.insert(field.name.clone(),self.fields.len());
        self.offsets.push(self.record_size);
        self.record_size += field.width as usize;
        self.fields.push(field);
        Ok(())
    }
    pub fn len(&self) -> usize {
        self.fields.len()
    }
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
    pub fn record_size(&self) -> usize {
        self.record_size
    }
    pub fn field(&self,idx: usize) -> &FieldDescriptor {
        &self.fields[idx]
    }
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }
    /// Index of a named field, usable with `Record::get_at` on hot paths.
    pub fn position(&self,name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
    pub fn require(&self,name: &str) -> Result<usize,Error> {
        self.position(name).ok_or(Error::UnknownField(name.to_string()))
    }
    /// Byte range of a field within a record.
    pub fn field_range(&self,idx: usize) -> std::ops::Range<usize> {
        let start = self.offsets[idx];
        start..start + self.fields[idx].width as usize
    }
}

/// Packs name-to-value mappings into record bytes for one schema.
/// Constructing one of these is what freezes a container writer's schema.
#[derive(Debug)]
pub struct RecordPacker<'a> {
    schema: &'a Schema,
    order: ByteOrder
}

impl <'a> RecordPacker<'a> {
    pub fn new(schema: &'a Schema,order: ByteOrder) -> Self {
        Self { schema, order }
    }
    pub fn record_size(&self) -> usize {
        self.schema.record_size()
    }
    /// Encode one record.  Every schema field must be supplied; surplus
    /// names are ignored with a warning.
    pub fn pack(&self,values: &[(&str,Value)]) -> Result<Vec<u8>,DYNERR> {
        let mut supplied: HashMap<&str,&Value> = HashMap::new();
        for (name,value) in values {
            supplied.insert(name,value);
        }
        let mut ans: Vec<u8> = Vec::with_capacity(self.schema.record_size());
        for field in self.schema.fields() {
            let value = match supplied.remove(field.name.as_str()) {
                Some(v) => v,
                None => return Err(Box::new(Error::MissingField(field.name.clone())))
            };
            let mut bytes = codec::encode(value,field.dtype,field.width,field.scale,self.order)?;
            ans.append(&mut bytes);
        }
        if !supplied.is_empty() {
            let mut names: Vec<&str> = supplied.keys().copied().collect();
            names.sort();
            warn!("ignored fields not in the schema: {}",names.join(", "));
        }
        Ok(ans)
    }
}

/// One record's bytes plus the byte offset they came from, viewed through a
/// schema.  Decoding happens per field on demand.
#[derive(Debug)]
pub struct Record<'a> {
    schema: &'a Schema,
    order: ByteOrder,
    offset: u64,
    buf: Vec<u8>
}

impl <'a> Record<'a> {
    pub fn new(schema: &'a Schema,order: ByteOrder,offset: u64,buf: Vec<u8>) -> Self {
        Self { schema, order, offset, buf }
    }
    /// Byte offset of this record within the file it was read from, a
    /// stable back-reference into the container.
    pub fn offset(&self) -> u64 {
        self.offset
    }
    /// Decode a field by index and apply the scale rule: a scaled integral
    /// field comes back as the real value `stored / scale`.
    pub fn get_at(&self,idx: usize) -> Result<Value,DYNERR> {
        let field = self.schema.field(idx);
        let raw = codec::decode(&self.buf[self.schema.field_range(idx)],field.dtype,field.width,self.order)?;
        if field.scale != 0 && field.dtype.is_integral() {
            let stored = match raw {
                Value::Int(v) => v as f64,
                Value::Uint(v) => v as f64,
                _ => unreachable!("integral decode yields integers")
            };
            return Ok(Value::Float(stored / field.scale as f64));
        }
        Ok(raw)
    }
    pub fn get(&self,name: &str) -> Result<Value,DYNERR> {
        let idx = self.schema.require(name)?;
        self.get_at(idx)
    }
    /// Decode a field skipping the scale step.
    pub fn raw_decoded(&self,name: &str) -> Result<Value,DYNERR> {
        let idx = self.schema.require(name)?;
        let field = self.schema.field(idx);
        let raw = codec::decode(&self.buf[self.schema.field_range(idx)],field.dtype,field.width,self.order)?;
        Ok(raw)
    }
    /// The field's bytes exactly as stored.
    pub fn raw(&self,name: &str) -> Result<&[u8],DYNERR> {
        let idx = self.schema.require(name)?;
        Ok(&self.buf[self.schema.field_range(idx)])
    }
    pub fn schema(&self) -> &Schema {
        self.schema
    }
}

impl fmt::Display for Record<'_> {
    fn fmt(&self,f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f,"record at {}:",self.offset)?;
        for (i,field) in self.schema.fields().iter().enumerate() {
            match self.get_at(i) {
                Ok(value) => write!(f," {}={}",field.name,value)?,
                Err(_) => write!(f," {}=?",field.name)?
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schema() -> Schema {
        Schema::from_fields(vec![
            FieldDescriptor::new("RA",DataType::Int32,4,1000000).unwrap(),
            FieldDescriptor::new("Dec",DataType::Int32,4,100000).unwrap(),
            FieldDescriptor::new("B",DataType::Int16,2,1000).unwrap(),
            FieldDescriptor::new("spec_type",DataType::CharArray,2,0).unwrap(),
            FieldDescriptor::new("HD",DataType::Int32,4,0).unwrap()
        ]).unwrap()
    }

    fn test_values() -> Vec<(&'static str,Value)> {
        vec![
            ("RA",Value::Float(30.0)),
            ("Dec",Value::Float(-13.2)),
            ("B",Value::Float(12.5)),
            ("spec_type",Value::Str("A0".to_string())),
            ("HD",Value::Int(12345))
        ]
    }

    #[test]
    fn record_size_is_sum_of_widths() {
        assert_eq!(test_schema().record_size(),16);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut schema = test_schema();
        let dup = FieldDescriptor::new("RA",DataType::Int16,2,0).unwrap();
        assert!(matches!(schema.push(dup),Err(Error::DuplicateField(_))));
    }

    #[test]
    fn overlong_name_rejected() {
        assert!(FieldDescriptor::new("a_very_long_name",DataType::Int8,1,0).is_err());
    }

    #[test]
    fn width_must_match_type() {
        assert!(FieldDescriptor::new("mag",DataType::Int16,4,100).is_err());
        assert!(FieldDescriptor::new("label",DataType::Str,16,0).is_ok());
    }

    #[test]
    fn pack_and_decode_round_trip() {
        let schema = test_schema();
        let packer = RecordPacker::new(&schema,ByteOrder::Little);
        let buf = packer.pack(&test_values()).unwrap();
        assert_eq!(buf.len(),schema.record_size());
        let rec = Record::new(&schema,ByteOrder::Little,0,buf);
        match rec.get("RA").unwrap() {
            Value::Float(v) => assert!((v-30.0).abs() < 1e-6),
            other => panic!("unexpected value {:?}",other)
        }
        match rec.get("Dec").unwrap() {
            Value::Float(v) => assert!((v+13.2).abs() < 1e-5),
            other => panic!("unexpected value {:?}",other)
        }
        match rec.get("B").unwrap() {
            Value::Float(v) => assert!((v-12.5).abs() < 1e-3),
            other => panic!("unexpected value {:?}",other)
        }
        assert_eq!(rec.get("spec_type").unwrap(),Value::Str("A0".to_string()));
        // unscaled integers round-trip exactly and stay integers
        assert_eq!(rec.get("HD").unwrap(),Value::Int(12345));
    }

    #[test]
    fn unscaled_access() {
        let schema = test_schema();
        let packer = RecordPacker::new(&schema,ByteOrder::Little);
        let buf = packer.pack(&test_values()).unwrap();
        let rec = Record::new(&schema,ByteOrder::Little,0,buf);
        assert_eq!(rec.raw_decoded("RA").unwrap(),Value::Int(30000000));
        assert_eq!(rec.raw("B").unwrap(),&12500i16.to_le_bytes());
    }

    #[test]
    fn missing_field_fails() {
        let schema = test_schema();
        let packer = RecordPacker::new(&schema,ByteOrder::Little);
        let mut values = test_values();
        values.remove(1);
        assert!(packer.pack(&values).is_err());
    }

    #[test]
    fn extra_field_ignored() {
        let schema = test_schema();
        let packer = RecordPacker::new(&schema,ByteOrder::Little);
        let mut values = test_values();
        values.push(("bogus",Value::Int(1)));
        assert!(packer.pack(&values).is_ok());
    }
}
