//! # Hierarchical Triangular Mesh
//!
//! The sphere is split into 8 octahedral root triangles; each subdivision
//! level splits every triangle into 4 by connecting the edge midpoints, so a
//! level-`L` mesh has `8 * 4^L` cells ("trixels").  Trixel ids are formed by
//! the root index followed by two bits per level, giving the contiguous
//! range `[0, 8 * 4^L)`.
//!
//! The `Indexer` answers the three coverage questions the pipeline needs:
//! which trixel holds a point, which trixels a cone touches, and which
//! trixels a great-circle segment crosses.  Point location picks the child
//! whose edge tests fit best, so points sitting exactly on a shared edge
//! resolve deterministically instead of falling through.

use crate::sky::Vector3;

/// Deepest supported subdivision; ids remain well inside `u32`.
pub const MAX_LEVEL: u8 = 13;

const EPS: f64 = 1e-12;

/// Enumerates mesh errors.  The `Display` trait will print equivalent long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("HTM level {0} exceeds the supported maximum of 13")]
    LevelRange(u8)
}

/// Octahedron corners: poles and four equatorial points.
const VERTS: [Vector3;6] = [
    Vector3::new(0.0,0.0,1.0),
    Vector3::new(1.0,0.0,0.0),
    Vector3::new(0.0,1.0,0.0),
    Vector3::new(-1.0,0.0,0.0),
    Vector3::new(0.0,-1.0,0.0),
    Vector3::new(0.0,0.0,-1.0)
];

/// Root triangles in id order: four southern, four northern.
const ROOTS: [[usize;3];8] = [
    [1,5,2],
    [2,5,3],
    [3,5,4],
    [4,5,1],
    [1,0,4],
    [4,0,3],
    [3,0,2],
    [2,0,1]
];

#[derive(Clone,Copy)]
struct Triangle {
    v: [Vector3;3]
}

impl Triangle {
    fn root(index: usize) -> Self {
        let [a,b,c] = ROOTS[index];
        Self { v: [VERTS[a],VERTS[b],VERTS[c]] }
    }
    /// Children in id order; child 3 is the central triangle.
    fn children(&self) -> [Self;4] {
        let w0 = self.v[1].midpoint(&self.v[2]);
        let w1 = self.v[0].midpoint(&self.v[2]);
        let w2 = self.v[0].midpoint(&self.v[1]);
        [
            Self { v: [self.v[0],w2,w1] },
            Self { v: [self.v[1],w0,w2] },
            Self { v: [self.v[2],w1,w0] },
            Self { v: [w0,w1,w2] }
        ]
    }
    /// Smallest of the three edge-plane tests; positive inside, negative
    /// outside, zero on an edge.
    fn fit(&self,p: &Vector3) -> f64 {
        let t0 = self.v[0].cross(&self.v[1]).dot(p);
        let t1 = self.v[1].cross(&self.v[2]).dot(p);
        let t2 = self.v[2].cross(&self.v[0]).dot(p);
        t0.min(t1).min(t2)
    }
    fn contains(&self,p: &Vector3) -> bool {
        self.fit(p) >= -EPS
    }
    fn edges(&self) -> [(Vector3,Vector3);3] {
        [
            (self.v[0],self.v[1]),
            (self.v[1],self.v[2]),
            (self.v[2],self.v[0])
        ]
    }
}

/// Angular distance in radians from `p` to the arc from `a` to `b`.
fn arc_distance(a: &Vector3,b: &Vector3,p: &Vector3) -> f64 {
    let n = a.cross(b);
    let n_norm = n.norm();
    if n_norm < EPS {
        return p.angle_to(a);
    }
    let n = n.scaled(1.0 / n_norm);
    let foot = p.add(&n.scaled(-n.dot(p)));
    if foot.norm() > EPS {
        let foot = foot.normalized();
        if a.cross(&foot).dot(&n) >= -EPS && foot.cross(b).dot(&n) >= -EPS {
            // perpendicular foot lands on the arc
            return n.dot(p).abs().asin();
        }
    }
    p.angle_to(a).min(p.angle_to(b))
}

/// Whether `c`, assumed on the great circle of `(a, b)`, lies on the minor
/// arc between them.
fn on_arc(c: &Vector3,a: &Vector3,b: &Vector3) -> bool {
    let n = a.cross(b);
    a.cross(c).dot(&n) >= -EPS && c.cross(b).dot(&n) >= -EPS
}

/// Whether the minor arcs `(p, q)` and `(a, b)` intersect.
fn arcs_cross(p: &Vector3,q: &Vector3,a: &Vector3,b: &Vector3) -> bool {
    let n1 = p.cross(q);
    let n2 = a.cross(b);
    let dir = n1.cross(&n2);
    if dir.norm() < EPS {
        // coplanar arcs: they overlap if either one holds an endpoint of the other
        return on_arc(p,a,b) || on_arc(q,a,b) || on_arc(a,p,q) || on_arc(b,p,q);
    }
    let c = dir.normalized();
    for cand in [c,c.scaled(-1.0)] {
        if on_arc(&cand,p,q) && on_arc(&cand,a,b) {
            return true;
        }
    }
    false
}

enum Coverage {
    Inside,
    Partial,
    Outside
}

/// Routes sky positions to trixels at a fixed subdivision level.
pub struct Indexer {
    level: u8
}

impl Indexer {
    pub fn new(level: u8) -> Result<Self,Error> {
        if level > MAX_LEVEL {
            return Err(Error::LevelRange(level));
        }
        Ok(Self { level })
    }
    pub fn level(&self) -> u8 {
        self.level
    }
    pub fn num_trixels(&self) -> u32 {
        8u32 << (2 * self.level as u32)
    }
    /// The trixel holding a point.
    pub fn trixel(&self,ra: f64,dec: f64) -> u32 {
        let p = Vector3::from_equatorial(ra,dec);
        let mut best = 0;
        let mut best_fit = f64::NEG_INFINITY;
        for root in 0..8 {
            let fit = Triangle::root(root).fit(&p);
            if fit > best_fit {
                best = root;
                best_fit = fit;
            }
        }
        let mut id = best as u32;
        let mut tri = Triangle::root(best);
        for _ in 0..self.level {
            let children = tri.children();
            let mut child = 0;
            let mut child_fit = f64::NEG_INFINITY;
            for i in 0..4 {
                let fit = children[i].fit(&p);
                if fit > child_fit {
                    child = i;
                    child_fit = fit;
                }
            }
            id = id * 4 + child as u32;
            tri = children[child];
        }
        id
    }
    /// All trixels intersecting a cone around `(ra, dec)`, ascending.
    pub fn cone(&self,ra: f64,dec: f64,radius_deg: f64) -> Vec<u32> {
        let axis = Vector3::from_equatorial(ra,dec);
        let radius = radius_deg.to_radians();
        // the whole-triangle shortcut assumes a convex cap
        let convex = radius_deg < 90.0;
        let mut ans = Vec::new();
        for root in 0..8 {
            self.descend_cone(&Triangle::root(root),root as u32,0,&axis,radius,convex,&mut ans);
        }
        ans
    }
    fn descend_cone(&self,tri: &Triangle,id: u32,depth: u8,axis: &Vector3,radius: f64,convex: bool,out: &mut Vec<u32>) {
        let coverage = match self.cap_coverage(tri,axis,radius) {
            Coverage::Inside if !convex => Coverage::Partial,
            c => c
        };
        match coverage {
            Coverage::Outside => {},
            Coverage::Inside => {
                let shift = 2 * (self.level - depth) as u32;
                let base = id << shift;
                out.extend(base..base + (1u32 << shift));
            },
            Coverage::Partial => {
                if depth==self.level {
                    out.push(id);
                } else {
                    for (i,child) in tri.children().iter().enumerate() {
                        self.descend_cone(child,id * 4 + i as u32,depth + 1,axis,radius,convex,out);
                    }
                }
            }
        }
    }
    fn cap_coverage(&self,tri: &Triangle,axis: &Vector3,radius: f64) -> Coverage {
        let cos_radius = radius.cos();
        let inside = tri.v.iter().filter(|v| axis.dot(v) >= cos_radius).count();
        if inside==3 {
            return Coverage::Inside;
        }
        if inside > 0 || tri.contains(axis) {
            return Coverage::Partial;
        }
        for (a,b) in tri.edges() {
            if arc_distance(&a,&b,axis) <= radius {
                return Coverage::Partial;
            }
        }
        Coverage::Outside
    }
    /// All trixels crossed by the great-circle segment between two points,
    /// ascending.  Both endpoint trixels are always included.
    pub fn segment(&self,ra1: f64,dec1: f64,ra2: f64,dec2: f64) -> Vec<u32> {
        let p = Vector3::from_equatorial(ra1,dec1);
        let q = Vector3::from_equatorial(ra2,dec2);
        if p.angle_to(&q) < EPS {
            return vec![self.trixel(ra1,dec1)];
        }
        let mut ans = Vec::new();
        for root in 0..8 {
            self.descend_segment(&Triangle::root(root),root as u32,0,&p,&q,&mut ans);
        }
        ans
    }
    fn descend_segment(&self,tri: &Triangle,id: u32,depth: u8,p: &Vector3,q: &Vector3,out: &mut Vec<u32>) {
        let touched = tri.contains(p) || tri.contains(q)
            || tri.edges().iter().any(|(a,b)| arcs_cross(p,q,a,b));
        if !touched {
            return;
        }
        if depth==self.level {
            out.push(id);
            return;
        }
        for (i,child) in tri.children().iter().enumerate() {
            self.descend_segment(child,id * 4 + i as u32,depth + 1,p,q,out);
        }
    }
}
