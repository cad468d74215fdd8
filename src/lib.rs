//! # `skybin` main library
//!
//! This library builds and reads spherical-sky star catalogs stored in a
//! trixel-sharded binary container format.  The sky is subdivided by a
//! Hierarchical Triangular Mesh (HTM); each mesh cell ("trixel") owns one
//! shard of fixed-size records, and a container file holds the shards behind
//! a self-describing preamble and an index table.
//!
//! ## Architecture
//!
//! The pipeline is built from a few cooperating layers:
//! * `codec` and `schema` define the field types and pack/unpack fixed records
//! * `container` reads and writes the container format, including the
//!   per-trixel chunk files used as scratch space during a build
//! * `sky` and `htm` form the coordinate engine: angular distances,
//!   proper-motion propagation, and trixel coverage queries
//! * `catalog` is the high-level buffered writer that routes incoming points
//!   to trixels, duplicating fast-moving stars across every trixel their
//!   long-term track crosses
//! * `xmatch` cross-identifies two catalogs by nearest neighbor with
//!   magnitude and secondary-coordinate tie-breaking
//! * `staging` is the SQLite staging store backing cross-identification
//!
//! ## Writing a catalog
//!
//! A `container::ContainerWriter` is created with an empty schema; fields are
//! added until the first record packer is assembled, at which point the
//! schema freezes.  Records are appended through per-trixel chunk writers
//! which hold an exclusive advisory lock on their scratch file, so multiple
//! worker processes can share a scratch directory.  On `finish` the chunks
//! are assembled into a single container with a backfilled index table.
//!
//! Most callers use `catalog::BufferedCatalogWriter` instead, which buffers
//! records in memory, spills the fattest buckets when over budget, and
//! applies the proper-motion duplication policy.
//!
//! ## Reading
//!
//! `container::Reader` opens a container and exposes trixels by table index
//! with random access to records.  `container::StarReader` adds the
//! star-catalog expansion fields (magnitude limit, HTM level, largest
//! shard).  `container::TrixelDirReader` reads a scratch directory of raw
//! chunk files against a caller-supplied schema.

pub mod codec;
pub mod schema;
pub mod container;
pub mod sky;
pub mod htm;
pub mod catalog;
pub mod xmatch;
pub mod staging;

type DYNERR = Box<dyn std::error::Error>;
type STDRESULT = Result<(),Box<dyn std::error::Error>>;
