//! # Container Reader
//!
//! `Reader` opens a container file, parses the preamble and index table, and
//! exposes trixels by table index with random access to records.  The table
//! index is not necessarily the trixel id: unsorted containers list trixels
//! in registration order.
//!
//! `StarReader` additionally parses the star-catalog expansion fields, and
//! `TrixelDirReader` reads a scratch directory of raw chunk files against a
//! caller-supplied schema, which is how a partially built catalog is
//! inspected before assembly.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{Read,Seek,SeekFrom};
use std::path::{Path,PathBuf};
use glob::glob;
use log::{info,debug};

use crate::codec;
use crate::codec::{ByteOrder,DataType};
use crate::schema::{FieldDescriptor,Record,Schema};
use crate::container::{self,Error,TrixelDescriptor,DESCRIPTION_BYTES,FORMAT_VERSION};
use crate::DYNERR;

fn read_exact_at(fd: &mut File,offset: u64,buf: &mut [u8]) -> Result<(),DYNERR> {
    fd.seek(SeekFrom::Start(offset))?;
    let mut got = 0;
    while got < buf.len() {
        match fd.read(&mut buf[got..])? {
            0 => return Err(Box::new(Error::ShortRead { offset, wanted: buf.len(), got })),
            n => got += n
        }
    }
    Ok(())
}

/// Random-access reader over one container file.
#[derive(Debug)]
pub struct Reader {
    path: PathBuf,
    fd: RefCell<File>,
    order: ByteOrder,
    description: String,
    schema: Schema,
    descriptors: Vec<TrixelDescriptor>,
    /// file position just past the index table, where expansion fields begin
    expansion_offset: u64
}

impl Reader {
    /// Open and parse the preamble.  Fails on an unknown format version, an
    /// unrecognized byte-order marker, or a field with an unknown type code.
    pub fn open(path: &Path) -> Result<Self,DYNERR> {
        let mut fd = File::open(path)?;
        let mut preamble = [0u8;DESCRIPTION_BYTES+3];
        read_exact_at(&mut fd,0,&mut preamble)?;
        let description = codec::cstr(&preamble[0..DESCRIPTION_BYTES]);
        let marker: [u8;2] = preamble[DESCRIPTION_BYTES..DESCRIPTION_BYTES+2].try_into().expect("slice length fixed");
        let order = match ByteOrder::from_marker(&marker) {
            Some(order) => order,
            None => return Err(Box::new(Error::BadByteOrderMark(marker)))
        };
        let version = preamble[DESCRIPTION_BYTES+2];
        if version != FORMAT_VERSION {
            return Err(Box::new(Error::UnknownVersion(version)));
        }
        info!("opened container: {}",description);

        let mut pos = (DESCRIPTION_BYTES + 3) as u64;
        let mut word = [0u8;2];
        read_exact_at(&mut fd,pos,&mut word)?;
        pos += 2;
        let num_fields = match order {
            ByteOrder::Little => u16::from_le_bytes(word),
            ByteOrder::Big => u16::from_be_bytes(word)
        };

        let mut schema = Schema::new();
        let mut entry = [0u8;container::FIELD_ENTRY_BYTES];
        for _ in 0..num_fields {
            read_exact_at(&mut fd,pos,&mut entry)?;
            pos += entry.len() as u64;
            let name = codec::cstr(&entry[0..10]);
            let width = entry[10];
            let code = entry[11];
            let scale_bytes: [u8;4] = entry[12..16].try_into().expect("slice length fixed");
            let scale = match order {
                ByteOrder::Little => u32::from_le_bytes(scale_bytes),
                ByteOrder::Big => u32::from_be_bytes(scale_bytes)
            };
            let dtype = match DataType::from_code(code) {
                Some(dtype) => dtype,
                None => return Err(Box::new(Error::UnknownTypeCode { name, code }))
            };
            schema.push(FieldDescriptor::new(&name,dtype,width,scale)?)?;
        }

        let mut dword = [0u8;4];
        read_exact_at(&mut fd,pos,&mut dword)?;
        pos += 4;
        let num_trixels = match order {
            ByteOrder::Little => u32::from_le_bytes(dword),
            ByteOrder::Big => u32::from_be_bytes(dword)
        };
        debug!("container declares {} fields and {} trixels",num_fields,num_trixels);

        let mut descriptors = Vec::with_capacity(num_trixels as usize);
        let mut entry = [0u8;container::DESCRIPTOR_BYTES];
        for _ in 0..num_trixels {
            read_exact_at(&mut fd,pos,&mut entry)?;
            pos += entry.len() as u64;
            let mut words = [0u32;3];
            for i in 0..3 {
                let bytes: [u8;4] = entry[4*i..4*i+4].try_into().expect("slice length fixed");
                words[i] = match order {
                    ByteOrder::Little => u32::from_le_bytes(bytes),
                    ByteOrder::Big => u32::from_be_bytes(bytes)
                };
            }
            descriptors.push(TrixelDescriptor::new(words[0],words[1],words[2]));
        }

        Ok(Self {
            path: path.to_path_buf(),
            fd: RefCell::new(fd),
            order,
            description,
            schema,
            descriptors,
            expansion_offset: pos
        })
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }
    pub fn schema(&self) -> &Schema {
        &self.schema
    }
    pub fn record_size(&self) -> usize {
        self.schema.record_size()
    }
    /// File position just past the index table, where format-specific
    /// expansion fields begin.
    pub fn expansion_offset(&self) -> u64 {
        self.expansion_offset
    }
    pub fn trixel_count(&self) -> usize {
        self.descriptors.len()
    }
    /// Trixel by table index.  This is the position in the index table, not
    /// necessarily the trixel id.
    pub fn trixel(&self,index: usize) -> Result<Trixel<'_>,DYNERR> {
        match self.descriptors.get(index) {
            Some(desc) => Ok(Trixel { reader: self, desc: *desc }),
            None => Err(Box::new(Error::TableIndex(index)))
        }
    }
    /// Iterate trixels in table order.
    pub fn trixels(&self) -> impl Iterator<Item = Trixel<'_>> {
        self.descriptors.iter().map(move |desc| Trixel { reader: self, desc: *desc })
    }
    pub(crate) fn read_record(&self,desc: &TrixelDescriptor,index: usize) -> Result<Record<'_>,DYNERR> {
        if index >= desc.count as usize {
            return Err(Box::new(Error::RecordRange { id: desc.id, index, count: desc.count }));
        }
        let record_size = self.schema.record_size();
        let offset = desc.offset as u64 + (index * record_size) as u64;
        let mut buf = vec![0u8;record_size];
        read_exact_at(&mut self.fd.borrow_mut(),offset,&mut buf)?;
        Ok(Record::new(&self.schema,self.order,offset,buf))
    }
    pub(crate) fn read_expansion(&self,buf: &mut [u8]) -> Result<(),DYNERR> {
        read_exact_at(&mut self.fd.borrow_mut(),self.expansion_offset,buf)
    }
}

impl fmt::Display for Reader {
    fn fmt(&self,f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f,"container {}: `{}`, {:?} order, {} fields of {} bytes, {} trixels, data at {}",
            self.path.display(),self.description,self.order,self.schema.len(),
            self.schema.record_size(),self.descriptors.len(),self.expansion_offset)
    }
}

/// One trixel's worth of records, viewed through its index-table descriptor.
pub struct Trixel<'a> {
    reader: &'a Reader,
    desc: TrixelDescriptor
}

impl <'a> Trixel<'a> {
    pub fn id(&self) -> u32 {
        self.desc.id
    }
    pub fn offset(&self) -> u32 {
        self.desc.offset
    }
    pub fn len(&self) -> usize {
        self.desc.count as usize
    }
    pub fn is_empty(&self) -> bool {
        self.desc.count==0
    }
    /// Record by position within the trixel, in storage order.
    pub fn record(&self,index: usize) -> Result<Record<'a>,DYNERR> {
        self.reader.read_record(&self.desc,index)
    }
    /// Iterate records in storage order.
    pub fn records(&self) -> impl Iterator<Item = Result<Record<'a>,DYNERR>> + '_ {
        (0..self.desc.count as usize).map(move |i| self.reader.read_record(&self.desc,i))
    }
}

impl fmt::Display for Trixel<'_> {
    fn fmt(&self,f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f,"trixel {} with {} records at offset {}",self.desc.id,self.desc.count,self.desc.offset)
    }
}

/// Reader for star-catalog containers, which carry three expansion fields:
/// the magnitude limit (scaled per layout), the HTM level, and the largest
/// record count in any trixel.
pub struct StarReader {
    inner: Reader,
    maglim_raw: u16,
    htm_level: u8,
    max_records: u16
}

impl StarReader {
    pub fn open(path: &Path) -> Result<Self,DYNERR> {
        let inner = Reader::open(path)?;
        let mut buf = [0u8;5];
        inner.read_expansion(&mut buf)?;
        let maglim_raw = match inner.byte_order() {
            ByteOrder::Little => u16::from_le_bytes([buf[0],buf[1]]),
            ByteOrder::Big => u16::from_be_bytes([buf[0],buf[1]])
        };
        let htm_level = buf[2];
        let max_records = match inner.byte_order() {
            ByteOrder::Little => u16::from_le_bytes([buf[3],buf[4]]),
            ByteOrder::Big => u16::from_be_bytes([buf[3],buf[4]])
        };
        Ok(Self {
            inner,
            maglim_raw,
            htm_level,
            max_records
        })
    }
    /// The stored magnitude-limit integer, unscaled.
    pub fn maglim_raw(&self) -> u16 {
        self.maglim_raw
    }
    /// Magnitude limit under the layout's scale (100 for the standard star
    /// layout, 1000 otherwise).
    pub fn maglim(&self,scale: u32) -> f64 {
        self.maglim_raw as f64 / scale as f64
    }
    pub fn htm_level(&self) -> u8 {
        self.htm_level
    }
    /// Largest per-trixel record count, truncated mod 2^16 at write time.
    pub fn max_records(&self) -> u16 {
        self.max_records
    }
    pub fn reader(&self) -> &Reader {
        &self.inner
    }
}

/// A trixel read straight from a chunk file, with no container preamble.
pub struct DirTrixel<'a> {
    schema: &'a Schema,
    id: u32,
    data: Vec<u8>
}

impl <'a> DirTrixel<'a> {
    pub fn id(&self) -> u32 {
        self.id
    }
    pub fn len(&self) -> usize {
        self.data.len() / self.schema.record_size()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn record(&self,index: usize) -> Result<Record<'a>,DYNERR> {
        let record_size = self.schema.record_size();
        if index >= self.len() {
            return Err(Box::new(Error::RecordRange { id: self.id, index, count: self.len() as u32 }));
        }
        let offset = index * record_size;
        let buf = self.data[offset..offset+record_size].to_vec();
        Ok(Record::new(self.schema,ByteOrder::Little,offset as u64,buf))
    }
    pub fn records(&self) -> impl Iterator<Item = Result<Record<'a>,DYNERR>> + '_ {
        (0..self.len()).map(move |i| self.record(i))
    }
}

/// Reads a scratch directory of chunk files against a caller-supplied
/// schema.  Counts are inferred from file sizes, which must be a multiple of
/// the record size.
pub struct TrixelDirReader {
    schema: Schema,
    chunks: BTreeMap<u32,PathBuf>
}

impl TrixelDirReader {
    pub fn open(dir: &Path,schema: Schema) -> Result<Self,DYNERR> {
        let mut ans = Self {
            schema,
            chunks: BTreeMap::new()
        };
        let patt = dir.join(format!("{}*.dat",container::TRIXEL_PREFIX));
        for entry in glob(&patt.to_string_lossy())? {
            let path = entry?;
            let id = match container::parse_chunk_file_name(&path) {
                Some(id) => id,
                None => return Err(Box::new(Error::ChunkName(path.display().to_string())))
            };
            let size = std::fs::metadata(&path)?.len();
            let record_size = ans.schema.record_size();
            if size % record_size as u64 != 0 {
                return Err(Box::new(Error::ChunkInvariant { id, size, record_size }));
            }
            debug!("registered trixel {} from {}",id,path.display());
            ans.chunks.insert(id,path);
        }
        Ok(ans)
    }
    pub fn len(&self) -> usize {
        self.chunks.len()
    }
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
    pub fn contains(&self,id: u32) -> bool {
        self.chunks.contains_key(&id)
    }
    pub fn trixel_ids(&self) -> Vec<u32> {
        self.chunks.keys().copied().collect()
    }
    /// Load one trixel's chunk into memory, by trixel id.
    pub fn trixel(&self,id: u32) -> Result<DirTrixel<'_>,DYNERR> {
        let path = match self.chunks.get(&id) {
            Some(p) => p,
            None => return Err(Box::new(Error::UnregisteredPath(id)))
        };
        let data = std::fs::read(path)?;
        Ok(DirTrixel {
            schema: &self.schema,
            id,
            data
        })
    }
    /// Iterate trixels in ascending id order.
    pub fn trixels(&self) -> impl Iterator<Item = Result<DirTrixel<'_>,DYNERR>> {
        self.chunks.keys().map(move |id| self.trixel(*id))
    }
}
