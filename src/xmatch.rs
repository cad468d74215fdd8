//! # Cross-Identification Module
//!
//! Matches the records of one catalog (`A`) against another (`B`) by
//! angular proximity, one target trixel at a time.  For every trixel the
//! engine gathers the `A` members, collects candidate trixels by opening a
//! cone around each member, pulls the `B` records in those trixels, and
//! picks each row's nearest neighbor from the pair-wise distance matrix.
//!
//! Ties at the minimum distance are resolved by a layered decision: if the
//! tie sits above a tight distance tolerance the row is not a true match
//! and the first candidate stands; otherwise magnitudes decide when one
//! candidate is clearly closer in brightness, and the secondary coordinate
//! set decides the rest.
//!
//! The engine never mutates its input catalogs; matches, unmatched rows,
//! and detected proper-motion duplicates are appended through a sink.

use log::{info,warn};

use crate::htm::Indexer;
use crate::sky;
use crate::{DYNERR,STDRESULT};

/// One catalog record as staged for cross-identification.  `ra`/`dec` are
/// the primary ICRS position; `ep_ra`/`ep_dec` are the epoch-specific
/// secondary coordinates used for tie-breaking when present.
#[derive(Clone,Debug)]
pub struct SourceRow {
    pub id: i64,
    pub ra: f64,
    pub dec: f64,
    pub mag: Option<f64>,
    pub ep_ra: Option<f64>,
    pub ep_dec: Option<f64>,
    /// trixel of the record in its source container, when known
    pub source_trixel: Option<u32>,
    /// trixel in the target mesh the record was staged under
    pub target_trixel: u32
}

impl SourceRow {
    /// Secondary coordinates, falling back to the primary position.
    fn secondary(&self) -> (f64,f64) {
        match (self.ep_ra,self.ep_dec) {
            (Some(ra),Some(dec)) => (ra,dec),
            _ => (self.ra,self.dec)
        }
    }
}

/// A nearest-neighbor match between two catalogs; distance in degrees.
#[derive(Clone,PartialEq,Debug)]
pub struct MatchRow {
    pub a_id: i64,
    pub b_id: i64,
    pub distance: f64
}

/// Read access to a staged catalog, keyed by target trixel.
pub trait CatalogSource {
    fn sources_in_trixel(&self,trixel: u32) -> Result<Vec<SourceRow>,DYNERR>;
    fn sources_in_trixels(&self,trixels: &[u32]) -> Result<Vec<SourceRow>,DYNERR> {
        let mut ans = Vec::new();
        for trixel in trixels {
            ans.append(&mut self.sources_in_trixel(*trixel)?);
        }
        Ok(ans)
    }
    /// Records staged under a *source*-container trixel, used for
    /// proper-motion duplicate mining.
    fn sources_with_source_trixel(&self,trixel: u32) -> Result<Vec<SourceRow>,DYNERR>;
}

/// Append-only output of a cross-identification run.
pub trait MatchSink {
    fn push_match(&mut self,row: &MatchRow) -> STDRESULT;
    /// A row whose nearest neighbor sits outside the search radius;
    /// distance in arcseconds.
    fn push_unmatched(&mut self,a_id: i64,closest_b: i64,distance_arcsec: f64) -> STDRESULT;
    /// A row recognized as a proper-motion duplicate of another `A` row.
    fn push_pm_duplicate(&mut self,dup_id: i64,orig_id: i64) -> STDRESULT {
        let _ = (dup_id,orig_id);
        Ok(())
    }
}

/// In-memory sink, mostly for tests and small runs.
#[derive(Default)]
pub struct VecSink {
    pub matches: Vec<MatchRow>,
    pub unmatched: Vec<(i64,i64,f64)>,
    pub pm_duplicates: Vec<(i64,i64)>
}

impl MatchSink for VecSink {
    fn push_match(&mut self,row: &MatchRow) -> STDRESULT {
        self.matches.push(row.clone());
        Ok(())
    }
    fn push_unmatched(&mut self,a_id: i64,closest_b: i64,distance_arcsec: f64) -> STDRESULT {
        self.unmatched.push((a_id,closest_b,distance_arcsec));
        Ok(())
    }
    fn push_pm_duplicate(&mut self,dup_id: i64,orig_id: i64) -> STDRESULT {
        self.pm_duplicates.push((dup_id,orig_id));
        Ok(())
    }
}

/// Knobs for the cross-identification engine.
#[derive(Clone)]
pub struct MatchConfig {
    /// Cone radius for candidate gathering, arcseconds.
    pub search_radius_arcsec: f64,
    /// Distance below which tied rows must be tie-broken, degrees.
    pub tie_tolerance_deg: f64,
    /// Magnitude-difference separation that makes the brightness
    /// comparison decisive on its own.
    pub magnitude_gap: f64,
    /// HTM level of the source containers, enabling proper-motion
    /// duplicate filtering when rows carry their source trixel.
    pub source_htm_level: Option<u8>
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            search_radius_arcsec: 100.0,
            tie_tolerance_deg: 1e-5,
            magnitude_gap: 0.5,
            source_htm_level: None
        }
    }
}

/// Totals accumulated over a run.
#[derive(Default,Clone,Copy,Debug)]
pub struct MatchStats {
    pub matched: u64,
    pub unmatched: u64,
    pub pm_duplicates: u64,
    /// matched pairs whose `b` record was also claimed by another `a` row
    /// within the tie tolerance
    pub shared_neighbors: u64
}

enum TieBreak {
    Winner(usize),
    Deferred
}

/// Nearest-neighbor cross-identification between two staged catalogs.
pub struct CrossMatcher {
    indexer: Indexer,
    config: MatchConfig
}

impl CrossMatcher {
    pub fn new(indexer: Indexer,config: MatchConfig) -> Self {
        Self { indexer, config }
    }
    /// Run the full sky: every target trixel of `a` against the candidate
    /// neighborhoods in `b`, appending results to `sink`.
    pub fn run(&self,a: &impl CatalogSource,b: &impl CatalogSource,sink: &mut dyn MatchSink) -> Result<MatchStats,DYNERR> {
        let mut stats = MatchStats::default();
        let src_indexer = match self.config.source_htm_level {
            Some(level) => Some(Indexer::new(level)?),
            None => None
        };
        for trixel in 0..self.indexer.num_trixels() {
            let rows = a.sources_in_trixel(trixel)?;
            if rows.is_empty() {
                continue;
            }
            let rows = self.filter_pm_duplicates(rows,a,src_indexer.as_ref(),sink,&mut stats)?;
            if rows.is_empty() {
                continue;
            }
            self.match_cell(&rows,b,sink,&mut stats)?;
        }
        info!("cross-identification matched {} rows, {} unmatched, {} proper-motion duplicates",
            stats.matched,stats.unmatched,stats.pm_duplicates);
        Ok(stats)
    }
    /// Drop rows that are proper-motion duplicates of another `A` row: the
    /// row's recomputed source trixel disagrees with the staged one, and a
    /// coordinate-equal row exists in the expected trixel.
    fn filter_pm_duplicates(&self,rows: Vec<SourceRow>,a: &impl CatalogSource,
        src_indexer: Option<&Indexer>,sink: &mut dyn MatchSink,stats: &mut MatchStats) -> Result<Vec<SourceRow>,DYNERR> {
        let src_indexer = match src_indexer {
            Some(ix) => ix,
            None => return Ok(rows)
        };
        let mut ans = Vec::with_capacity(rows.len());
        for row in rows {
            let staged = match row.source_trixel {
                Some(t) => t,
                None => {
                    ans.push(row);
                    continue;
                }
            };
            let expected = src_indexer.trixel(row.ra,row.dec);
            if staged==expected {
                ans.push(row);
                continue;
            }
            let mut original = None;
            for other in a.sources_with_source_trixel(expected)? {
                if other.id != row.id && (other.ra - row.ra).abs() < 1e-7 && (other.dec - row.dec).abs() < 1e-7 {
                    original = Some(other.id);
                    break;
                }
            }
            match original {
                Some(orig_id) => {
                    sink.push_pm_duplicate(row.id,orig_id)?;
                    stats.pm_duplicates += 1;
                },
                None => {
                    // no twin found; tolerate plain round-off near a cell edge
                    if src_indexer.cone(row.ra,row.dec,1e-4).contains(&staged) {
                        info!("row {} sits within round-off of source trixel {}, keeping it",row.id,staged);
                    } else {
                        warn!("row {} was staged under source trixel {} but resolves to {}, and no duplicate original was found",
                            row.id,staged,expected);
                    }
                    ans.push(row);
                }
            }
        }
        Ok(ans)
    }
    fn match_cell(&self,rows: &[SourceRow],b: &impl CatalogSource,
        sink: &mut dyn MatchSink,stats: &mut MatchStats) -> STDRESULT {
        let radius_deg = self.config.search_radius_arcsec / 3600.0;
        let mut candidate_trixels: Vec<u32> = Vec::new();
        for row in rows {
            for t in self.indexer.cone(row.ra,row.dec,radius_deg) {
                if let Err(pos) = candidate_trixels.binary_search(&t) {
                    candidate_trixels.insert(pos,t);
                }
            }
        }
        let candidates = b.sources_in_trixels(&candidate_trixels)?;
        if candidates.is_empty() {
            for row in rows {
                warn!("row {} has no candidates within {} arcsec",row.id,self.config.search_radius_arcsec);
                stats.unmatched += 1;
            }
            return Ok(());
        }
        // pair-wise distance matrix, row major over (rows, candidates)
        let distances: Vec<Vec<f64>> = rows.iter().map(|row|
            candidates.iter().map(|cand|
                sky::angular_distance(row.ra,row.dec,cand.ra,cand.dec)).collect()
        ).collect();

        let mut claimed: Vec<(i64,i64)> = Vec::new();
        for (i,row) in rows.iter().enumerate() {
            let best = pick_nearest(row,&candidates,&distances[i],&self.config);
            let distance = distances[i][best];
            if distance * 3600.0 > self.config.search_radius_arcsec {
                sink.push_unmatched(row.id,candidates[best].id,distance * 3600.0)?;
                stats.unmatched += 1;
                continue;
            }
            if distance <= self.config.tie_tolerance_deg {
                let b_id = candidates[best].id;
                if let Some((prior,_)) = claimed.iter().find(|(_,claimed_b)| *claimed_b==b_id) {
                    warn!("rows {} and {} both resolve to candidate {} within tolerance",prior,row.id,b_id);
                    stats.shared_neighbors += 1;
                }
                claimed.push((row.id,b_id));
            }
            sink.push_match(&MatchRow {
                a_id: row.id,
                b_id: candidates[best].id,
                distance
            })?;
            stats.matched += 1;
        }
        Ok(())
    }
}

/// Index of the nearest candidate, with the layered tie-break: distance,
/// then magnitude when decisive, then the secondary coordinates.
fn pick_nearest(row: &SourceRow,candidates: &[SourceRow],distances: &[f64],config: &MatchConfig) -> usize {
    let mut min = f64::INFINITY;
    for d in distances {
        if *d < min {
            min = *d;
        }
    }
    let ties: Vec<usize> = (0..distances.len()).filter(|j| distances[*j]==min).collect();
    if ties.len()==1 || min > config.tie_tolerance_deg {
        // a distant "tie" is not a true match, leave it to the radius check
        return ties[0];
    }
    match break_by_magnitude(row,candidates,&ties,config.magnitude_gap) {
        TieBreak::Winner(j) => j,
        TieBreak::Deferred => break_by_secondary(row,candidates,&ties)
    }
}

fn break_by_magnitude(row: &SourceRow,candidates: &[SourceRow],ties: &[usize],gap: f64) -> TieBreak {
    let mag = match row.mag {
        Some(m) => m,
        None => return TieBreak::Deferred
    };
    let mut diffs: Vec<(f64,usize)> = Vec::new();
    for j in ties {
        match candidates[*j].mag {
            Some(m) => diffs.push(((m - mag).abs(),*j)),
            None => return TieBreak::Deferred
        }
    }
    diffs.sort_by(|a,b| a.0.total_cmp(&b.0));
    if diffs.len() > 1 && diffs[1].0 - diffs[0].0 > gap {
        return TieBreak::Winner(diffs[0].1);
    }
    TieBreak::Deferred
}

fn break_by_secondary(row: &SourceRow,candidates: &[SourceRow],ties: &[usize]) -> usize {
    let (ra,dec) = row.secondary();
    let mut best = ties[0];
    let mut best_dist = f64::INFINITY;
    for j in ties {
        let (cra,cdec) = candidates[*j].secondary();
        let d = sky::angular_distance(ra,dec,cra,cdec);
        if d < best_dist {
            best = *j;
            best_dist = d;
        }
    }
    best
}
