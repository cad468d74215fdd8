//! # Trixel Chunk Sessions
//!
//! A chunk session appends records to one trixel's scratch file while
//! holding an exclusive advisory lock on it, so workers in separate
//! processes sharing a scratch directory serialize their appends.  Records
//! never interleave mid-record: the fixed-size append is the unit of
//! locking.
//!
//! The running count is read *after* the lock is taken, so a session that
//! waited on a concurrent writer picks up the records that writer
//! committed.  On `commit` the file is flushed and fsynced and the
//! descriptor is published into the owning container writer *before* the
//! lock drops; a session dropped without committing deletes its file and
//! publishes nothing.

use std::fs::{File,OpenOptions};
use std::io::{BufWriter,Write};
use std::path::PathBuf;
use fs2::FileExt;
use log::error;

use crate::codec::Value;
use crate::schema::RecordPacker;
use crate::container::{Error,TrixelDescriptor};
use crate::container::writer::ContainerWriter;
use crate::{DYNERR,STDRESULT};

/// One locked append session on a trixel's chunk file.  Obtained from
/// `ContainerWriter::trixel_writer`; consumed by `commit`.
#[derive(Debug)]
pub struct TrixelChunkWriter<'a> {
    owner: &'a ContainerWriter,
    id: u32,
    path: PathBuf,
    fd: BufWriter<File>,
    packer: RecordPacker<'a>,
    count: u32,
    committed: bool
}

impl <'a> TrixelChunkWriter<'a> {
    pub(crate) fn open(owner: &'a ContainerWriter,id: u32,path: PathBuf,append: bool) -> Result<Self,DYNERR> {
        let fd = match append {
            true => OpenOptions::new().append(true).create(true).open(&path)?,
            false => match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(fd) => fd,
                Err(e) if e.kind()==std::io::ErrorKind::AlreadyExists => {
                    return Err(Box::new(Error::ChunkExists(path.display().to_string())))
                },
                Err(e) => return Err(Box::new(e))
            }
        };
        fd.lock_exclusive()?;
        // read the count only now, in case a concurrent session on the same
        // trixel committed while we waited on the lock
        let packer = owner.record_packer();
        let count = match packer.record_size() {
            0 => owner.registered_count(id),
            record_size => {
                let size = fd.metadata()?.len();
                if size % record_size as u64 != 0 {
                    return Err(Box::new(Error::ChunkInvariant { id, size, record_size }));
                }
                (size / record_size as u64) as u32
            }
        };
        Ok(Self {
            owner,
            id,
            path,
            fd: BufWriter::new(fd),
            packer,
            count,
            committed: false
        })
    }
    pub fn id(&self) -> u32 {
        self.id
    }
    /// Records this session believes the chunk holds, including appends not
    /// yet committed.
    pub fn len(&self) -> u32 {
        self.count
    }
    pub fn is_empty(&self) -> bool {
        self.count==0
    }
    /// Encode one record from a name-to-value mapping and append it.
    /// Returns the number of bytes written.
    pub fn add(&mut self,values: &[(&str,Value)]) -> Result<usize,DYNERR> {
        let record = self.packer.pack(values)?;
        self.fd.write_all(&record)?;
        self.count += 1;
        Ok(record.len())
    }
    /// Append an already-packed record.
    pub fn add_packed(&mut self,record: &[u8]) -> STDRESULT {
        debug_assert_eq!(record.len(),self.packer.record_size());
        self.fd.write_all(record)?;
        self.count += 1;
        Ok(())
    }
    /// Flush, fsync, and publish the descriptor, then release the lock.
    pub fn commit(mut self) -> STDRESULT {
        self.fd.flush()?;
        self.fd.get_ref().sync_all()?;
        // publish before unlocking so a waiting session sees our count
        self.owner.register_chunk(TrixelDescriptor::new(self.id,0,self.count),None)?;
        self.committed = true;
        FileExt::unlock(self.fd.get_ref())?;
        Ok(())
    }
}

impl Drop for TrixelChunkWriter<'_> {
    fn drop(&mut self) {
        if !self.committed {
            error!("chunk session for trixel {} ended without commit, removing {}",self.id,self.path.display());
            let _ = self.fd.flush();
            let _ = FileExt::unlock(self.fd.get_ref());
            if let Err(e) = std::fs::remove_file(&self.path) {
                error!("could not remove {}: {}",self.path.display(),e);
            }
        }
    }
}
