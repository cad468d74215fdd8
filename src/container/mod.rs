//! # Container Module
//!
//! A container file packages every trixel shard of a catalog behind a
//! self-describing preamble:
//!
//! * 124-byte human-readable description, ASCII, `\0`-padded
//! * 2-byte byte-order marker (`SK` little endian, `KS` big endian)
//! * format version byte (currently 1)
//! * field count (u16) and one 16-byte entry per field
//! * trixel count (u32) and one 12-byte descriptor per trixel
//! * format-specific expansion fields
//! * the concatenated trixel payloads
//!
//! During a build each trixel's payload lives in its own scratch chunk file
//! (`chunk` submodule); the writer (`writer` submodule) assembles the chunks
//! into the container and backfills the true payload offsets into the index
//! table.  Readers (`reader` submodule) get random access by trixel and by
//! record.

pub mod reader;
pub mod writer;
pub mod chunk;

use std::path::Path;
use regex::Regex;

pub use reader::{Reader,StarReader,TrixelDirReader,Trixel};
pub use writer::ContainerWriter;
pub use chunk::TrixelChunkWriter;

/// Bytes reserved for the description at the head of the preamble.
pub const DESCRIPTION_BYTES: usize = 124;
/// The only container format version this library reads or writes.
pub const FORMAT_VERSION: u8 = 1;
/// Prefix of per-trixel scratch files.
pub const TRIXEL_PREFIX: &str = "trixel";
/// Bytes in one preamble field entry.
pub const FIELD_ENTRY_BYTES: usize = 16;
/// Bytes in one index-table descriptor.
pub const DESCRIPTOR_BYTES: usize = 12;

/// Enumerates container errors.  The `Display` trait will print equivalent long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("unhandled container format version {0}")]
    UnknownVersion(u8),
    #[error("unrecognized byte-order marker {0:02x?}")]
    BadByteOrderMark([u8;2]),
    #[error("field `{name}` carries unknown type code {code}")]
    UnknownTypeCode { name: String, code: u8 },
    #[error("short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    ShortRead { offset: u64, wanted: usize, got: usize },
    #[error("record size {record_size} does not divide the {size}-byte chunk for trixel {id}")]
    ChunkInvariant { id: u32, size: u64, record_size: usize },
    #[error("trixel {id} declares {declared} records but its chunk holds {actual}")]
    CountDisagrees { id: u32, declared: u32, actual: u64 },
    #[error("chunk file {0} already exists")]
    ChunkExists(String),
    #[error("chunk file {0} does not match the trixel naming pattern")]
    ChunkName(String),
    #[error("trixel id {id} exceeds the declared count of {num_trixels} trixels")]
    TrixelRange { id: u32, num_trixels: u32 },
    #[error("record index {index} out of range for trixel {id} with {count} records")]
    RecordRange { id: u32, index: usize, count: u32 },
    #[error("trixel table index {0} out of range")]
    TableIndex(usize),
    #[error("trixel {0} has no registered chunk path")]
    UnregisteredPath(u32),
    #[error("container payload grew past the 32-bit offset limit at trixel {0}")]
    OffsetOverflow(u32),
    #[error("scratch directory {0} holds chunk files but appending was not requested")]
    ScratchNotEmpty(String)
}

/// Index-table entry: the trixel's id, the absolute byte offset of its
/// payload, and its record count.  Offsets are zero in the reserved table
/// until the writer backfills them during assembly.
#[derive(Clone,Copy,PartialEq,Eq,Debug)]
pub struct TrixelDescriptor {
    pub id: u32,
    pub offset: u32,
    pub count: u32
}

impl TrixelDescriptor {
    pub fn new(id: u32,offset: u32,count: u32) -> Self {
        Self { id, offset, count }
    }
}

/// Scratch file name for a trixel, `trixelNNNNNNNNNNNN.dat` with the id
/// zero-padded to 12 digits.
pub fn chunk_file_name(id: u32) -> String {
    format!("{}{:012}.dat",TRIXEL_PREFIX,id)
}

/// Recover the trixel id from a scratch file path, or None if the name does
/// not match the pattern.
pub fn parse_chunk_file_name(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let patt = Regex::new(r"^trixel(\d{1,12})\.dat$").expect("regex parsing error");
    let caps = patt.captures(name)?;
    caps.get(1)?.as_str().parse::<u32>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn chunk_names() {
        assert_eq!(chunk_file_name(3),"trixel000000000003.dat");
        assert_eq!(parse_chunk_file_name(&PathBuf::from("/tmp/x/trixel000000000003.dat")),Some(3));
        assert_eq!(parse_chunk_file_name(&PathBuf::from("trixel12.dat")),Some(12));
        assert_eq!(parse_chunk_file_name(&PathBuf::from("trixel.dat")),None);
        assert_eq!(parse_chunk_file_name(&PathBuf::from("other000000000003.dat")),None);
    }
}
