//! # Container Writer
//!
//! The writer accumulates a schema and a table of per-trixel chunk files,
//! then assembles them into a single container on `finish`.  Chunks are
//! produced either through `TrixelChunkWriter` sessions or registered
//! manually (e.g. when a previous run left valid chunks behind).
//!
//! Assembly order follows the file layout: preamble, reserved index table
//! with zero offsets, expansion fields, then each trixel's payload with its
//! true offset backfilled into the table.  If anything goes wrong during
//! assembly the partial container is removed and the chunk files are kept
//! for inspection, so an interrupted build can be resumed or debugged.

use std::collections::HashMap;
use std::fs::{File,OpenOptions};
use std::io::{BufWriter,Seek,SeekFrom,Write};
use std::path::{Path,PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool,Ordering};
use log::{info,warn,error};

use crate::codec;
use crate::codec::{ByteOrder,DataType,Value};
use crate::schema;
use crate::schema::{FieldDescriptor,RecordPacker,Schema};
use crate::container::{self,Error,TrixelDescriptor,DESCRIPTOR_BYTES,DESCRIPTION_BYTES,FORMAT_VERSION};
use crate::container::chunk::TrixelChunkWriter;
use crate::{DYNERR,STDRESULT};

/// One per-trixel scratch file known to the writer.  The descriptor is set
/// only once a chunk session commits (or the chunk is registered manually).
#[derive(Debug)]
pub(crate) struct TrixelChunk {
    pub descriptor: Option<TrixelDescriptor>,
    pub path: PathBuf,
    pub auto_delete: bool
}

/// Chunk table preserving registration order, which becomes the container
/// output order when trixel sorting is off.
#[derive(Default,Debug)]
pub(crate) struct ChunkTable {
    pub order: Vec<u32>,
    pub map: HashMap<u32,TrixelChunk>
}

impl ChunkTable {
    fn ensure(&mut self,id: u32,default_path: PathBuf) -> &mut TrixelChunk {
        if !self.map.contains_key(&id) {
            self.order.push(id);
            self.map.insert(id,TrixelChunk {
                descriptor: None,
                path: default_path,
                auto_delete: true
            });
        }
        self.map.get_mut(&id).expect("entry ensured above")
    }
}

/// Writes one container file from per-trixel chunks.
///
/// Fields may be added until the first `record_packer` call, after which the
/// schema is frozen.  Containers are always written little endian.
#[derive(Debug)]
pub struct ContainerWriter {
    output: Option<PathBuf>,
    tmp_dir: PathBuf,
    num_trixels: u32,
    schema: Schema,
    frozen: AtomicBool,
    chunks: Mutex<ChunkTable>,
    sort_trixels: bool,
    auto_delete_chunks: bool,
    description: String
}

impl ContainerWriter {
    /// Create a writer that will assemble `output` from chunks in `tmp_dir`.
    /// The scratch directory is created if missing; an existing output file
    /// will be overwritten at assembly time.
    pub fn new(output: &Path,tmp_dir: &Path,num_trixels: u32) -> Result<Self,DYNERR> {
        if output.is_file() {
            warn!("output file {} exists, will be overwritten",output.display());
        }
        Self::create(Some(output.to_path_buf()),tmp_dir,num_trixels)
    }
    /// Create a writer with no container output: the chunk files themselves
    /// are the product and are never auto-deleted.
    pub fn chunks_only(tmp_dir: &Path,num_trixels: u32) -> Result<Self,DYNERR> {
        let mut ans = Self::create(None,tmp_dir,num_trixels)?;
        ans.auto_delete_chunks = false;
        Ok(ans)
    }
    fn create(output: Option<PathBuf>,tmp_dir: &Path,num_trixels: u32) -> Result<Self,DYNERR> {
        if !tmp_dir.is_dir() {
            std::fs::create_dir_all(tmp_dir)?;
        }
        Ok(Self {
            output,
            tmp_dir: tmp_dir.to_path_buf(),
            num_trixels,
            schema: Schema::new(),
            frozen: AtomicBool::new(false),
            chunks: Mutex::new(ChunkTable::default()),
            sort_trixels: true,
            auto_delete_chunks: true,
            description: "skybin catalog data".to_string()
        })
    }
    pub fn set_sort_trixels(&mut self,sort: bool) {
        self.sort_trixels = sort;
    }
    pub fn set_auto_delete_chunks(&mut self,auto: bool) {
        self.auto_delete_chunks = auto;
    }
    pub fn set_description(&mut self,description: &str) {
        if description.len() > DESCRIPTION_BYTES {
            warn!("description is longer than {} characters, will be truncated",DESCRIPTION_BYTES);
        }
        self.description = description.to_string();
    }
    /// Add a field to the schema.  Refused once a record packer exists.
    pub fn add_field(&mut self,field: FieldDescriptor) -> Result<(),DYNERR> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(Box::new(schema::Error::Frozen(field.name)));
        }
        self.schema.push(field)?;
        Ok(())
    }
    pub fn schema(&self) -> &Schema {
        &self.schema
    }
    pub fn record_size(&self) -> usize {
        self.schema.record_size()
    }
    pub fn num_trixels(&self) -> u32 {
        self.num_trixels
    }
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }
    /// Assemble a packer for this writer's schema, freezing the schema.
    pub fn record_packer(&self) -> RecordPacker<'_> {
        self.frozen.store(true,Ordering::Release);
        RecordPacker::new(&self.schema,ByteOrder::Little)
    }
    /// Scratch path a chunk session for this trixel will use.
    pub fn chunk_path(&self,id: u32) -> PathBuf {
        self.tmp_dir.join(container::chunk_file_name(id))
    }
    /// Open a chunk session for one trixel.  With `append` the session adds
    /// to a previously committed chunk; otherwise the chunk file must not
    /// already exist.
    pub fn trixel_writer(&self,id: u32,append: bool) -> Result<TrixelChunkWriter<'_>,DYNERR> {
        self.check_range(id)?;
        let path = {
            let mut chunks = self.chunks.lock().expect("chunk table poisoned");
            chunks.ensure(id,self.chunk_path(id)).path.clone()
        };
        TrixelChunkWriter::open(self,id,path,append)
    }
    /// Record count of a trixel's committed chunk, zero when nothing has
    /// been registered yet.
    pub fn registered_count(&self,id: u32) -> u32 {
        let chunks = self.chunks.lock().expect("chunk table poisoned");
        match chunks.map.get(&id).and_then(|c| c.descriptor) {
            Some(desc) => desc.count,
            None => 0
        }
    }
    /// Largest committed chunk, in records.
    pub fn max_chunk_count(&self) -> u32 {
        let chunks = self.chunks.lock().expect("chunk table poisoned");
        chunks.map.values().filter_map(|c| c.descriptor).map(|d| d.count).max().unwrap_or(0)
    }
    /// Number of trixels with a chunk entry.
    pub fn chunk_count(&self) -> usize {
        let chunks = self.chunks.lock().expect("chunk table poisoned");
        chunks.order.len()
    }
    /// Publish a chunk descriptor.  Chunk sessions call this on commit; it
    /// can also be called directly with a `path` to claim an externally
    /// produced chunk file, which disables auto-deletion for that chunk.
    pub fn register_chunk(&self,descriptor: TrixelDescriptor,path: Option<&Path>) -> STDRESULT {
        self.check_range(descriptor.id)?;
        let mut chunks = self.chunks.lock().expect("chunk table poisoned");
        let known = chunks.map.contains_key(&descriptor.id);
        if path.is_none() && !known {
            return Err(Box::new(Error::UnregisteredPath(descriptor.id)));
        }
        if let Some(p) = path {
            if known {
                warn!("overwriting existing path for trixel {} with {}",descriptor.id,p.display());
            }
        }
        let default_path = self.chunk_path(descriptor.id);
        let chunk = chunks.ensure(descriptor.id,default_path);
        chunk.descriptor = Some(descriptor);
        if let Some(p) = path {
            chunk.path = p.to_path_buf();
            chunk.auto_delete = false;
        }
        Ok(())
    }
    fn check_range(&self,id: u32) -> STDRESULT {
        if id >= self.num_trixels {
            return Err(Box::new(Error::TrixelRange { id, num_trixels: self.num_trixels }));
        }
        Ok(())
    }
    /// Assemble the container with no expansion fields.
    pub fn finish(self) -> STDRESULT {
        self.finish_with(|_| Ok(()))
    }
    /// Assemble the container, invoking `expansion` to write the
    /// format-specific fields between the index table and the payload.
    /// On success chunks are deleted if auto-deletion is on; on failure the
    /// partial container is removed and every chunk file is preserved.
    pub fn finish_with<F>(mut self,expansion: F) -> STDRESULT
    where F: FnOnce(&mut BufWriter<File>) -> STDRESULT {
        let output = match self.output.take() {
            Some(p) => p,
            None => {
                info!("no container output configured, chunks remain in {}",self.tmp_dir.display());
                return Ok(());
            }
        };
        match self.assemble(&output,expansion) {
            Ok(()) => {
                if self.auto_delete_chunks {
                    self.delete_chunks();
                }
                Ok(())
            },
            Err(e) => {
                error!("container assembly failed ({}); removing partial output, chunk files are preserved",e);
                let _ = std::fs::remove_file(&output);
                Err(e)
            }
        }
    }
    fn assemble<F>(&self,output: &Path,expansion: F) -> STDRESULT
    where F: FnOnce(&mut BufWriter<File>) -> STDRESULT {
        let fd = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(output)?;
        let mut fd = BufWriter::new(fd);

        let mut description = self.description.clone();
        description.truncate(DESCRIPTION_BYTES);
        fd.write_all(&codec::encode(&Value::Str(description),DataType::Str,DESCRIPTION_BYTES as u8,0,ByteOrder::Little)?)?;
        fd.write_all(&ByteOrder::Little.marker())?;
        fd.write_all(&[FORMAT_VERSION])?;

        fd.write_all(&(self.schema.len() as u16).to_le_bytes())?;
        for field in self.schema.fields() {
            fd.write_all(&codec::encode(&Value::Str(field.name.clone()),DataType::Str,schema::NAME_BYTES as u8,0,ByteOrder::Little)?)?;
            fd.write_all(&[field.width])?;
            fd.write_all(&[field.dtype.code()])?;
            fd.write_all(&field.scale.to_le_bytes())?;
        }

        fd.write_all(&self.num_trixels.to_le_bytes())?;

        let chunks = self.chunks.lock().expect("chunk table poisoned");
        let mut ids = chunks.order.clone();
        if ids.len() != self.num_trixels as usize {
            error!("number of trixels written {} does not match the declared count {}",ids.len(),self.num_trixels);
            for id in 0..self.num_trixels {
                if !chunks.map.contains_key(&id) {
                    ids.push(id);
                }
            }
        }
        if self.sort_trixels {
            ids.sort();
        }

        // index table with phony offsets, to be backfilled below
        let table_offset = fd.stream_position()?;
        let mut missing = 0;
        for id in &ids {
            fd.write_all(&id.to_le_bytes())?;
            fd.write_all(&0u32.to_le_bytes())?;
            let count = match chunks.map.get(id).and_then(|c| c.descriptor) {
                Some(desc) => desc.count,
                None => {
                    missing += 1;
                    0
                }
            };
            fd.write_all(&count.to_le_bytes())?;
        }
        if missing > 0 {
            warn!("descriptors for {} trixels were never registered, assumed empty",missing);
        }

        expansion(&mut fd)?;

        let record_size = self.schema.record_size();
        for (i,id) in ids.iter().enumerate() {
            let offset = fd.stream_position()?;
            if offset > u32::MAX as u64 {
                return Err(Box::new(Error::OffsetOverflow(*id)));
            }
            fd.seek(SeekFrom::Start(table_offset + (DESCRIPTOR_BYTES * i) as u64 + 4))?;
            fd.write_all(&(offset as u32).to_le_bytes())?;
            fd.seek(SeekFrom::Start(offset))?;

            let chunk = match chunks.map.get(id) {
                Some(c) => c,
                None => continue
            };
            let descriptor = match chunk.descriptor {
                Some(d) => d,
                None => continue
            };
            let size = std::fs::metadata(&chunk.path)?.len();
            if record_size != 0 {
                if size % record_size as u64 != 0 {
                    return Err(Box::new(Error::ChunkInvariant { id: *id, size, record_size }));
                }
                let actual = size / record_size as u64;
                if descriptor.count as u64 != actual {
                    return Err(Box::new(Error::CountDisagrees { id: *id, declared: descriptor.count, actual }));
                }
            }
            let mut src = File::open(&chunk.path)?;
            std::io::copy(&mut src,&mut fd)?;
        }
        fd.flush()?;
        Ok(())
    }
    fn delete_chunks(&self) {
        info!("removing temporary trixel files in {}",self.tmp_dir.display());
        let chunks = self.chunks.lock().expect("chunk table poisoned");
        for chunk in chunks.map.values() {
            if chunk.auto_delete {
                if let Err(e) = std::fs::remove_file(&chunk.path) {
                    if chunk.path.exists() {
                        error!("could not remove temporary file {}: {}",chunk.path.display(),e);
                    }
                }
            }
        }
    }
}
