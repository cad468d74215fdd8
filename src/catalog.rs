//! # Catalog Writer Module
//!
//! High-level writing of ICRS/J2000 star catalogs.  `StarWriter` fixes the
//! star-container expansion fields (magnitude limit, HTM level, largest
//! shard) on top of the plain container writer.  `BufferedCatalogWriter`
//! adds the sky indexing: each incoming point is routed to its trixel, or to
//! several trixels when its proper motion carries it across cell boundaries
//! within the configured window, so a position-based query at any epoch in
//! the window still finds the star without re-indexing the container.
//!
//! Records are buffered in memory per trixel and the fattest buckets are
//! spilled through chunk sessions whenever the total crosses the budget.  A
//! scratch directory left over from an interrupted run can be reclaimed by
//! opening in append mode; chunk counts are then inferred from file sizes.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path,PathBuf};
use glob::glob;
use log::{info,warn,error};

use crate::codec::{ByteOrder,DataType,Value};
use crate::schema;
use crate::schema::{FieldDescriptor,Schema};
use crate::container::{self,ContainerWriter,Error,TrixelDescriptor};
use crate::htm::Indexer;
use crate::sky;
use crate::{DYNERR,STDRESULT};

/// Default magnitude limit written to the expansion fields.
pub const DEFAULT_MAGLIM: f64 = 65.5;

/// Scale applied to mas/yr proper-motion rates when advancing a star to
/// the edges of its duplication window: rates act per millennium, the same
/// convention epoch-advanced position queries use, so the covered track
/// lands in the cells those queries search.
const PM_WINDOW_RATE_SCALE: f64 = 1e-3;

/// Field list of the standard (bright-star) record layout.
pub fn standard_star_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new("RA",DataType::Int32,4,1_000_000).expect("valid field"),
        FieldDescriptor::new("Dec",DataType::Int32,4,100_000).expect("valid field"),
        FieldDescriptor::new("dRA",DataType::Int32,4,10).expect("valid field"),
        FieldDescriptor::new("dDec",DataType::Int32,4,10).expect("valid field"),
        FieldDescriptor::new("parallax",DataType::Int32,4,10).expect("valid field"),
        FieldDescriptor::new("HD",DataType::Int32,4,0).expect("valid field"),
        FieldDescriptor::new("mag",DataType::Int16,2,100).expect("valid field"),
        FieldDescriptor::new("bv_index",DataType::Int16,2,100).expect("valid field"),
        FieldDescriptor::new("spec_type",DataType::CharArray,2,0).expect("valid field"),
        FieldDescriptor::new("flags",DataType::Char,1,0).expect("valid field"),
        FieldDescriptor::new("unused",DataType::Char,1,0).expect("valid field")
    ]
}

/// Field list of the deep (faint-star) record layout, compact with B and V
/// magnitudes only.
pub fn deep_star_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new("RA",DataType::Int32,4,1_000_000).expect("valid field"),
        FieldDescriptor::new("Dec",DataType::Int32,4,100_000).expect("valid field"),
        FieldDescriptor::new("dRA",DataType::Int16,2,100).expect("valid field"),
        FieldDescriptor::new("dDec",DataType::Int16,2,100).expect("valid field"),
        FieldDescriptor::new("B",DataType::Int16,2,1000).expect("valid field"),
        FieldDescriptor::new("V",DataType::Int16,2,1000).expect("valid field")
    ]
}

/// Record layout of a star container.  The layout decides the field schema
/// and the scale of the stored magnitude limit.
#[derive(Clone)]
pub enum StarLayout {
    Standard,
    Deep,
    Custom(Vec<FieldDescriptor>)
}

impl StarLayout {
    pub fn fields(&self) -> Vec<FieldDescriptor> {
        match self {
            Self::Standard => standard_star_fields(),
            Self::Deep => deep_star_fields(),
            Self::Custom(fields) => fields.clone()
        }
    }
    /// Scale of the stored u16 magnitude limit.
    pub fn maglim_scale(&self) -> u32 {
        match self {
            Self::Standard => 100,
            _ => 1000
        }
    }
}

/// Container writer for star catalogs.  Wraps `ContainerWriter` with the
/// star expansion fields and a layout-derived schema.
pub struct StarWriter {
    inner: ContainerWriter,
    maglim_scale: u32,
    maglim: f64
}

impl StarWriter {
    pub fn new(output: Option<&Path>,tmp_dir: &Path,num_trixels: u32,layout: &StarLayout) -> Result<Self,DYNERR> {
        let mut inner = match output {
            Some(path) => ContainerWriter::new(path,tmp_dir,num_trixels)?,
            None => ContainerWriter::chunks_only(tmp_dir,num_trixels)?
        };
        for field in layout.fields() {
            inner.add_field(field)?;
        }
        inner.set_description("skybin star catalog");
        Ok(Self {
            inner,
            maglim_scale: layout.maglim_scale(),
            maglim: DEFAULT_MAGLIM
        })
    }
    pub fn set_maglim(&mut self,maglim: f64) {
        self.maglim = maglim;
    }
    pub fn container(&self) -> &ContainerWriter {
        &self.inner
    }
    pub fn container_mut(&mut self) -> &mut ContainerWriter {
        &mut self.inner
    }
    /// Subdivision level implied by the declared trixel count.
    pub fn htm_level(&self) -> u8 {
        ((self.inner.num_trixels() as f64 / 8.0).log2() / 2.0).round() as u8
    }
    /// Assemble the container with the star expansion fields appended to
    /// the preamble: scaled magnitude limit, HTM level, and the largest
    /// per-trixel record count truncated to 16 bits.
    pub fn finish(self) -> STDRESULT {
        let maglim = crate::codec::encode(&Value::Float(self.maglim),DataType::Uint16,2,self.maglim_scale,ByteOrder::Little)?;
        let htm_level = self.htm_level();
        let max_records = self.inner.max_chunk_count();
        if self.inner.chunk_count()==0 {
            warn!("no trixels were committed");
        }
        if max_records >= 1 << 16 {
            error!("largest trixel holds {} records, which overflows the 16-bit expansion field and will wrap",max_records);
        }
        self.inner.finish_with(|fd| {
            fd.write_all(&maglim)?;
            fd.write_all(&[htm_level])?;
            fd.write_all(&((max_records % (1 << 16)) as u16).to_le_bytes())?;
            Ok(())
        })
    }
}

/// Knobs for the buffered catalog writer.
#[derive(Clone)]
pub struct CatalogConfig {
    /// HTM subdivision level; the container declares `8 * 4^level` trixels.
    pub htm_level: u8,
    pub layout: StarLayout,
    /// Reclaim chunks already present in the scratch directory instead of
    /// refusing to run.  Forces chunk auto-deletion off.
    pub append: bool,
    /// Buffered-record count that triggers a spill; the default is 25 per
    /// trixel.
    pub buffer_limit: Option<usize>,
    /// Half-window in years for proper-motion duplication, zero to disable.
    pub proper_motion_duplicates: f64,
    /// Smallest motion, in arcseconds over the full window, that makes a
    /// star worth duplicating.
    pub proper_motion_threshold: f64
}

impl CatalogConfig {
    pub fn new(htm_level: u8,layout: StarLayout) -> Self {
        Self {
            htm_level,
            layout,
            append: false,
            buffer_limit: None,
            proper_motion_duplicates: 10000.0,
            proper_motion_threshold: 0.1
        }
    }
}

/// Buffered, sky-indexed catalog writer.  Single threaded by contract; the
/// chunk layer underneath tolerates concurrent writers from other processes.
pub struct BufferedCatalogWriter {
    star: StarWriter,
    indexer: Indexer,
    buffers: HashMap<u32,Vec<Vec<u8>>>,
    buffered: usize,
    written: u64,
    buffer_limit: usize,
    dup_years: f64,
    /// squared proper-motion magnitude below which a star is stationary, (mas/yr)^2
    pm_sqr_thresh: f64,
    pm_fields: Option<(usize,usize)>
}

impl BufferedCatalogWriter {
    /// Create a writer.  With `output` None only the chunk directory is
    /// produced, which is how bulk ingests hand off to a later assembly run.
    pub fn new(output: Option<&Path>,trixel_dir: &Path,config: &CatalogConfig) -> Result<Self,DYNERR> {
        let indexer = Indexer::new(config.htm_level)?;
        let num_trixels = indexer.num_trixels();

        let existing = existing_chunks(trixel_dir)?;
        if !existing.is_empty() && !config.append {
            return Err(Box::new(Error::ScratchNotEmpty(trixel_dir.display().to_string())));
        }

        let mut star = StarWriter::new(output,trixel_dir,num_trixels,&config.layout)?;
        if config.append {
            star.container_mut().set_auto_delete_chunks(false);
        }

        let record_size = star.container().record_size();
        for path in existing {
            let id = match container::parse_chunk_file_name(&path) {
                Some(id) => id,
                None => return Err(Box::new(Error::ChunkName(path.display().to_string())))
            };
            let size = std::fs::metadata(&path)?.len();
            if size % record_size as u64 != 0 {
                return Err(Box::new(Error::ChunkInvariant { id, size, record_size }));
            }
            let count = (size / record_size as u64) as u32;
            star.container().register_chunk(TrixelDescriptor::new(id,0,count),Some(&path))?;
            info!("reclaimed chunk for trixel {} with {} records",id,count);
        }

        let schema = star.container().schema();
        schema.require("RA")?;
        schema.require("Dec")?;
        let pm_fields = match (schema.position("dRA"),schema.position("dDec")) {
            (Some(a),Some(b)) => Some((a,b)),
            _ => None
        };

        let dup_years = config.proper_motion_duplicates;
        let pm_sqr_thresh = match dup_years > 0.0 {
            true => {
                let tau = config.proper_motion_threshold / (2.0 * dup_years / 1000.0);
                tau * tau
            },
            false => f64::INFINITY
        };

        Ok(Self {
            star,
            indexer,
            buffers: HashMap::new(),
            buffered: 0,
            written: 0,
            buffer_limit: config.buffer_limit.unwrap_or(25 * num_trixels as usize),
            dup_years,
            pm_sqr_thresh,
            pm_fields
        })
    }
    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }
    pub fn schema(&self) -> &Schema {
        self.star.container().schema()
    }
    pub fn set_maglim(&mut self,maglim: f64) {
        self.star.set_maglim(maglim);
    }
    pub fn set_description(&mut self,description: &str) {
        self.star.container_mut().set_description(description);
    }
    /// Records currently held in memory.
    pub fn buffered(&self) -> usize {
        self.buffered
    }
    /// Records accepted so far, counting proper-motion duplicates.
    pub fn written(&self) -> u64 {
        self.written
    }
    /// Route one star to its trixel set, buffer a record for each member,
    /// and spill if over budget.  Unknown field names are rejected; missing
    /// proper-motion fields are taken as zero.  Returns the number of
    /// copies buffered.
    pub fn add_point(&mut self,values: &[(&str,Value)]) -> Result<usize,DYNERR> {
        let full = self.normalize(values)?;
        let ra = self.numeric_field(&full,"RA")?;
        let dec = self.numeric_field(&full,"Dec")?;
        let (pm_ra,pm_dec) = match self.pm_fields {
            Some(_) => (self.numeric_field(&full,"dRA")?,self.numeric_field(&full,"dDec")?),
            None => (0.0,0.0)
        };
        let trixels = self.pm_trixels(ra,dec,pm_ra,pm_dec);
        let record = self.star.container().record_packer().pack(&full)?;
        for id in &trixels {
            self.buffers.entry(*id).or_default().push(record.clone());
        }
        self.buffered += trixels.len();
        self.written += trixels.len() as u64;
        if self.buffered > self.buffer_limit {
            self.spill(false)?;
        }
        Ok(trixels.len())
    }
    /// Buffer one record directly into a known trixel, bypassing the
    /// indexing and duplication policy.  Returns the record's index within
    /// that trixel.
    pub fn add_point_to_trixel(&mut self,id: u32,values: &[(&str,Value)]) -> Result<usize,DYNERR> {
        if id >= self.indexer.num_trixels() {
            return Err(Box::new(Error::TrixelRange { id, num_trixels: self.indexer.num_trixels() }));
        }
        let full = self.normalize(values)?;
        let record = self.star.container().record_packer().pack(&full)?;
        let bucket = self.buffers.entry(id).or_default();
        bucket.push(record);
        let index = self.star.container().registered_count(id) as usize + bucket.len() - 1;
        self.buffered += 1;
        self.written += 1;
        if self.buffered > self.buffer_limit {
            self.spill(false)?;
        }
        Ok(index)
    }
    /// Reject unknown names and inject zero proper motion when the schema
    /// carries pm fields the caller omitted.
    fn normalize<'v>(&self,values: &[(&'v str,Value)]) -> Result<Vec<(&'v str,Value)>,DYNERR> {
        let schema = self.star.container().schema();
        for (name,_) in values {
            if schema.position(name).is_none() {
                return Err(Box::new(schema::Error::UnknownField(name.to_string())));
            }
        }
        let mut full = values.to_vec();
        if self.pm_fields.is_some() {
            for pm_name in ["dRA","dDec"] {
                if !full.iter().any(|(name,_)| *name==pm_name) {
                    full.push((pm_name,Value::Float(0.0)));
                }
            }
        }
        Ok(full)
    }
    fn numeric_field(&self,values: &[(&str,Value)],name: &str) -> Result<f64,DYNERR> {
        for (n,v) in values {
            if *n==name {
                return v.as_f64().ok_or(Box::new(crate::codec::Error::ValueType(v.clone())) as DYNERR);
            }
        }
        Err(Box::new(schema::Error::MissingField(name.to_string())))
    }
    /// The trixel set a star must appear in.  Stationary stars (or sentinel
    /// zero motion) get exactly their home trixel; a star moving faster than
    /// the threshold gets every trixel on the great circle between its
    /// positions at the edges of the duplication window, with the mas/yr
    /// rate applied per millennium.
    fn pm_trixels(&self,ra: f64,dec: f64,pm_ra: f64,pm_dec: f64) -> Vec<u32> {
        if pm_ra * pm_ra + pm_dec * pm_dec <= self.pm_sqr_thresh {
            return vec![self.indexer.trixel(ra,dec)];
        }
        let (win_ra,win_dec) = (pm_ra * PM_WINDOW_RATE_SCALE,pm_dec * PM_WINDOW_RATE_SCALE);
        let (ra_fwd,dec_fwd) = sky::propagate(ra,dec,win_ra,win_dec,sky::J2000,sky::J2000 + self.dup_years);
        let (ra_back,dec_back) = sky::propagate(ra,dec,win_ra,win_dec,sky::J2000,sky::J2000 - self.dup_years);
        let mut ans = self.indexer.segment(ra_back,dec_back,ra_fwd,dec_fwd);
        let home = self.indexer.trixel(ra,dec);
        if let Err(pos) = ans.binary_search(&home) {
            ans.insert(pos,home);
        }
        ans
    }
    /// Drain the largest buckets through chunk sessions until the buffered
    /// total is below the target: zero for a full spill, a quarter of the
    /// budget otherwise.
    fn spill(&mut self,full: bool) -> STDRESULT {
        let target = match full {
            true => 0,
            false => self.buffer_limit / 4
        };
        if self.buffered <= target {
            return Ok(());
        }
        info!("spilling buffered records from {} down to {}",self.buffered,target);
        let mut order: Vec<u32> = self.buffers.keys().copied().collect();
        order.sort_by_key(|id| self.buffers[id].len());
        while self.buffered > target {
            let id = match order.pop() {
                Some(id) => id,
                None => break
            };
            let bucket = match self.buffers.remove(&id) {
                Some(b) => b,
                None => continue
            };
            let mut session = self.star.container().trixel_writer(id,true)?;
            for record in &bucket {
                session.add_packed(record)?;
            }
            session.commit()?;
            self.buffered -= bucket.len();
        }
        Ok(())
    }
    /// Spill everything held in memory.
    pub fn flush(&mut self) -> STDRESULT {
        self.spill(true)
    }
    /// Final full spill, then container assembly (when an output path was
    /// configured).
    pub fn finish(mut self) -> STDRESULT {
        self.spill(true)?;
        self.star.finish()
    }
}

fn existing_chunks(dir: &Path) -> Result<Vec<PathBuf>,DYNERR> {
    let mut ans = Vec::new();
    if !dir.is_dir() {
        return Ok(ans);
    }
    let patt = dir.join(format!("{}*.dat",container::TRIXEL_PREFIX));
    for entry in glob(&patt.to_string_lossy())? {
        ans.push(entry?);
    }
    Ok(ans)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_scales() {
        assert_eq!(StarLayout::Standard.maglim_scale(),100);
        assert_eq!(StarLayout::Deep.maglim_scale(),1000);
        assert_eq!(StarLayout::Custom(deep_star_fields()).maglim_scale(),1000);
    }

    #[test]
    fn layout_record_sizes() {
        let schema = Schema::from_fields(StarLayout::Standard.fields()).unwrap();
        assert_eq!(schema.record_size(),32);
        let schema = Schema::from_fields(StarLayout::Deep.fields()).unwrap();
        assert_eq!(schema.record_size(),16);
    }
}
