//! Signed-distance shape trees
//!
//! Transforms are pushed down to the leaves, so every primitive carries its
//! own placement and the tree only contains leaves and booleans.

use std::sync::Arc;

use glam::{DAffine3, DVec2, DVec3};

use crate::kernel::{Axis, BooleanType, EdgeSelector, KernelError, KernelResult, Primitive};

/// Samples per longest axis on the first pass when probing for empty results
const EMPTY_PROBE_CELLS: f64 = 24.0;

/// Halvings of a probe cell that may still hold material (24 * 2^4 = 384 per axis)
const EMPTY_PROBE_LEVELS: u32 = 4;

/// A probe sample counts as material only this far inside, relative to the longest extent
const EMPTY_PROBE_DEPTH: f64 = 1e-9;

/// Deepest boolean tree a solid may have; every tree walk is recursive
pub(crate) const MAX_TREE_DEPTH: usize = 512;

/// Relative tolerance used when comparing edge positions
const SELECT_TOLERANCE: f64 = 1e-6;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb::new(self.min.min(other.min), self.max.max(other.max))
    }

    pub fn intersection(&self, other: &Aabb) -> Aabb {
        Aabb::new(self.min.max(other.min), self.max.min(other.max))
    }

    pub fn extent(&self) -> DVec3 {
        (self.max - self.min).max(DVec3::ZERO)
    }

    /// Bounds of the eight transformed corners
    pub fn transformed(&self, transform: &DAffine3) -> Aabb {
        let mut min = DVec3::splat(f64::INFINITY);
        let mut max = DVec3::splat(f64::NEG_INFINITY);
        for i in 0..8 {
            let corner = DVec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            let p = transform.transform_point3(corner);
            min = min.min(p);
            max = max.max(p);
        }
        Aabb::new(min, max)
    }
}

/// Edge blend style
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BlendKind {
    Round,
    Bevel,
}

impl BlendKind {
    fn name(&self) -> &'static str {
        match self {
            BlendKind::Round => "fillet",
            BlendKind::Bevel => "chamfer",
        }
    }
}

/// A selectable edge in world coordinates
#[derive(Debug, Clone, Copy)]
pub(crate) struct EdgeInfo {
    pub center: DVec3,
    /// Direction for linear edges, `None` for circular rims
    pub direction: Option<DVec3>,
}

/// A placed primitive with optional per-edge blends
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    primitive: Primitive,
    to_world: DAffine3,
    to_local: DAffine3,
    /// Smallest axis scale of `to_world`, converts local distances to world
    scale: f64,
    blends: Vec<Option<(BlendKind, f64)>>,
}

/// Box edge layout: edge direction axis plus the signs on the two other axes
fn box_edge(index: usize) -> (usize, usize, usize, f64, f64) {
    let k = index / 4;
    let (a, b) = match k {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    };
    let sa = if index % 2 == 0 { -1.0 } else { 1.0 };
    let sb = if (index / 2) % 2 == 0 { -1.0 } else { 1.0 };
    (k, a, b, sa, sb)
}

impl Leaf {
    pub fn new(primitive: Primitive, placement: DAffine3) -> KernelResult<Self> {
        validate_primitive(&primitive)?;
        let (to_local, scale) = invert_placement(&placement)?;
        let edge_count = match primitive {
            Primitive::Box { .. } => 12,
            Primitive::Cylinder { .. } => 2,
            Primitive::Sphere { .. } => 0,
        };
        Ok(Self {
            primitive,
            to_world: placement,
            to_local,
            scale,
            blends: vec![None; edge_count],
        })
    }

    fn local_bounds(&self) -> Aabb {
        let half = match self.primitive {
            Primitive::Box { size } => size * 0.5,
            Primitive::Cylinder { radius, height } => DVec3::new(radius, radius, height * 0.5),
            Primitive::Sphere { radius } => DVec3::splat(radius),
        };
        Aabb::new(-half, half)
    }

    fn bounds(&self) -> Aabb {
        self.local_bounds().transformed(&self.to_world)
    }

    fn transformed(&self, transform: &DAffine3) -> KernelResult<Self> {
        let to_world = *transform * self.to_world;
        let (to_local, scale) = invert_placement(&to_world)?;
        Ok(Self {
            to_world,
            to_local,
            scale,
            ..self.clone()
        })
    }

    fn edges(&self) -> Vec<EdgeInfo> {
        match self.primitive {
            Primitive::Box { size } => {
                let half = size * 0.5;
                (0..12)
                    .map(|i| {
                        let (k, a, b, sa, sb) = box_edge(i);
                        let mut mid = DVec3::ZERO;
                        mid[a] = sa * half[a];
                        mid[b] = sb * half[b];
                        let mut dir = DVec3::ZERO;
                        dir[k] = 1.0;
                        EdgeInfo {
                            center: self.to_world.transform_point3(mid),
                            direction: Some(self.to_world.transform_vector3(dir).normalize()),
                        }
                    })
                    .collect()
            }
            Primitive::Cylinder { height, .. } => [-1.0, 1.0]
                .iter()
                .map(|s| EdgeInfo {
                    center: self
                        .to_world
                        .transform_point3(DVec3::new(0.0, 0.0, s * height * 0.5)),
                    direction: None,
                })
                .collect(),
            Primitive::Sphere { .. } => Vec::new(),
        }
    }

    fn with_blend(&self, kind: BlendKind, amount: f64, selector: &EdgeSelector) -> KernelResult<Self> {
        if !is_uniform_scale(&self.to_world) {
            return Err(KernelError::Unsupported(format!(
                "{} on a non-uniformly scaled {}",
                kind.name(),
                self.primitive.type_name()
            )));
        }

        let selected = select_edges(&self.edges(), selector);
        if selected.is_empty() {
            return Err(KernelError::Degenerate(format!(
                "no edges of the {} match selector '{}'",
                self.primitive.type_name(),
                selector
            )));
        }

        let local = amount / self.scale;
        let mut blends = self.blends.clone();
        for &index in &selected {
            let limit = match self.primitive {
                Primitive::Box { size } => {
                    let (_, a, b, _, _) = box_edge(index);
                    (size[a] * 0.5).min(size[b] * 0.5)
                }
                Primitive::Cylinder { radius, height } => radius.min(height * 0.5),
                Primitive::Sphere { .. } => 0.0,
            };
            if local >= limit {
                return Err(KernelError::Degenerate(format!(
                    "{} size {} exceeds the adjacent face size {}",
                    kind.name(),
                    amount,
                    limit * self.scale
                )));
            }
            if blends[index].is_some() {
                return Err(KernelError::Unsupported(format!(
                    "edge {} of the {} is already blended",
                    index,
                    self.primitive.type_name()
                )));
            }
            blends[index] = Some((kind, local));
        }

        Ok(Self {
            blends,
            ..self.clone()
        })
    }

    fn distance(&self, p: DVec3) -> f64 {
        let q = self.to_local.transform_point3(p);
        let d = match self.primitive {
            Primitive::Box { size } => self.box_distance(q, size * 0.5),
            Primitive::Cylinder { radius, height } => self.cylinder_distance(q, radius, height * 0.5),
            Primitive::Sphere { radius } => q.length() - radius,
        };
        d * self.scale
    }

    fn box_distance(&self, q: DVec3, half: DVec3) -> f64 {
        let d = q.abs() - half;
        let mut dist = d.max(DVec3::ZERO).length() + d.max_element().min(0.0);

        for (index, blend) in self.blends.iter().enumerate() {
            let Some((kind, r)) = blend else { continue };
            let (_, a, b, sa, sb) = box_edge(index);
            dist = dist.max(blend_distance(
                *kind,
                *r,
                sa * q[a] - half[a],
                sb * q[b] - half[b],
            ));
        }
        dist
    }

    fn cylinder_distance(&self, q: DVec3, radius: f64, half_height: f64) -> f64 {
        let radial = DVec2::new(q.x, q.y).length();
        let d = DVec2::new(radial - radius, q.z.abs() - half_height);
        let mut dist = d.max(DVec2::ZERO).length() + d.max_element().min(0.0);

        for (index, blend) in self.blends.iter().enumerate() {
            let Some((kind, r)) = blend else { continue };
            let s = if index == 0 { -1.0 } else { 1.0 };
            dist = dist.max(blend_distance(
                *kind,
                *r,
                radial - radius,
                s * q.z - half_height,
            ));
        }
        dist
    }
}

/// Distance contribution of one blended edge
///
/// `u` and `v` are the signed offsets from the two faces meeting at the edge.
fn blend_distance(kind: BlendKind, r: f64, u: f64, v: f64) -> f64 {
    match kind {
        BlendKind::Round => {
            let (u, v) = (u + r, v + r);
            if u > 0.0 && v > 0.0 {
                (u * u + v * v).sqrt() - r
            } else {
                f64::NEG_INFINITY
            }
        }
        BlendKind::Bevel => (u + v + r) * std::f64::consts::FRAC_1_SQRT_2,
    }
}

fn validate_primitive(primitive: &Primitive) -> KernelResult<()> {
    let ok = |v: f64| v.is_finite() && v > 0.0;
    let valid = match *primitive {
        Primitive::Box { size } => ok(size.x) && ok(size.y) && ok(size.z),
        Primitive::Cylinder { radius, height } => ok(radius) && ok(height),
        Primitive::Sphere { radius } => ok(radius),
    };
    if valid {
        Ok(())
    } else {
        Err(KernelError::Degenerate(format!(
            "{} with non-positive extent: {:?}",
            primitive.type_name(),
            primitive
        )))
    }
}

/// Inverse placement and its smallest axis scale
fn invert_placement(placement: &DAffine3) -> KernelResult<(DAffine3, f64)> {
    let det = placement.matrix3.determinant();
    if !det.is_finite() || det.abs() < 1e-12 {
        return Err(KernelError::Degenerate(
            "transform collapses the solid (singular matrix)".into(),
        ));
    }
    let m = placement.matrix3;
    let scale = m
        .x_axis
        .length()
        .min(m.y_axis.length())
        .min(m.z_axis.length());
    Ok((placement.inverse(), scale))
}

fn is_uniform_scale(placement: &DAffine3) -> bool {
    let m = placement.matrix3;
    let (x, y, z) = (m.x_axis.length(), m.y_axis.length(), m.z_axis.length());
    let tol = 1e-9 * x.max(y).max(z);
    (x - y).abs() <= tol && (y - z).abs() <= tol
}

fn select_edges(edges: &[EdgeInfo], selector: &EdgeSelector) -> Vec<usize> {
    let mut selected: Vec<usize> = match selector {
        EdgeSelector::All => (0..edges.len()).collect(),
        EdgeSelector::Parallel(axis) => edges
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.direction
                    .map(|d| d.dot(axis.unit()).abs() > 1.0 - SELECT_TOLERANCE)
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect(),
        EdgeSelector::Max(axis) => extreme_edges(edges, *axis, 1.0),
        EdgeSelector::Min(axis) => extreme_edges(edges, *axis, -1.0),
        EdgeSelector::Any(terms) => terms
            .iter()
            .flat_map(|t| select_edges(edges, t))
            .collect(),
    };
    selected.sort_unstable();
    selected.dedup();
    selected
}

fn extreme_edges(edges: &[EdgeInfo], axis: Axis, sign: f64) -> Vec<usize> {
    let key = |e: &EdgeInfo| sign * e.center.dot(axis.unit());
    let Some(best) = edges.iter().map(key).reduce(f64::max) else {
        return Vec::new();
    };
    let tol = SELECT_TOLERANCE * (1.0 + best.abs());
    edges
        .iter()
        .enumerate()
        .filter(|(_, e)| best - key(e) <= tol)
        .map(|(i, _)| i)
        .collect()
}

/// A solid as a signed-distance tree
#[derive(Debug, Clone)]
pub(crate) enum Shape {
    Leaf(Leaf),
    Boolean {
        op: BooleanType,
        a: Arc<Shape>,
        b: Arc<Shape>,
        depth: usize,
    },
}

impl Shape {
    pub fn primitive(primitive: Primitive, placement: DAffine3) -> KernelResult<Self> {
        Ok(Shape::Leaf(Leaf::new(primitive, placement)?))
    }

    pub fn boolean(op: BooleanType, a: Arc<Shape>, b: Arc<Shape>) -> Self {
        let depth = 1 + a.depth().max(b.depth());
        Shape::Boolean { op, a, b, depth }
    }

    /// Height of the boolean tree; a single primitive has depth 0
    pub fn depth(&self) -> usize {
        match self {
            Shape::Leaf(_) => 0,
            Shape::Boolean { depth, .. } => *depth,
        }
    }

    /// Signed distance (negative inside), in world units
    pub fn distance(&self, p: DVec3) -> f64 {
        match self {
            Shape::Leaf(leaf) => leaf.distance(p),
            Shape::Boolean { op, a, b, .. } => {
                let da = a.distance(p);
                let db = b.distance(p);
                match op {
                    BooleanType::Union => da.min(db),
                    BooleanType::Intersect => da.max(db),
                    BooleanType::Subtract => da.max(-db),
                }
            }
        }
    }

    pub fn bounds(&self) -> Aabb {
        match self {
            Shape::Leaf(leaf) => leaf.bounds(),
            Shape::Boolean { op, a, b, .. } => match op {
                BooleanType::Union => a.bounds().union(&b.bounds()),
                BooleanType::Intersect => a.bounds().intersection(&b.bounds()),
                BooleanType::Subtract => a.bounds(),
            },
        }
    }

    pub fn transformed(&self, transform: &DAffine3) -> KernelResult<Self> {
        match self {
            Shape::Leaf(leaf) => Ok(Shape::Leaf(leaf.transformed(transform)?)),
            Shape::Boolean { op, a, b, depth } => Ok(Shape::Boolean {
                op: *op,
                a: Arc::new(a.transformed(transform)?),
                b: Arc::new(b.transformed(transform)?),
                depth: *depth,
            }),
        }
    }

    pub fn with_blend(&self, kind: BlendKind, amount: f64, selector: &EdgeSelector) -> KernelResult<Self> {
        match self {
            Shape::Leaf(leaf) => Ok(Shape::Leaf(leaf.with_blend(kind, amount, selector)?)),
            Shape::Boolean { .. } => Err(KernelError::Unsupported(format!(
                "{} on a boolean result is not supported by the implicit kernel",
                kind.name()
            ))),
        }
    }

    /// Whether the solid encloses no volume
    ///
    /// Probes a coarse grid and halves every cell that could still hold
    /// material. Only a sample strictly inside counts, so solids that merely
    /// touch themselves (`A - A`) are empty.
    pub fn is_empty(&self) -> bool {
        let bounds = self.bounds();
        if bounds.is_empty() {
            return true;
        }

        let extent = bounds.extent();
        let longest = extent.max_element();
        if !longest.is_finite() || longest <= 0.0 {
            return true;
        }
        let counts = (extent / (longest / EMPTY_PROBE_CELLS)).ceil().max(DVec3::ONE);
        let (nx, ny, nz) = (counts.x as usize, counts.y as usize, counts.z as usize);
        let cell = extent / counts;
        let inside = -EMPTY_PROBE_DEPTH * longest;

        let mut pending = Vec::with_capacity(nx * ny * nz);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let center = bounds.min + cell * DVec3::new(i as f64 + 0.5, j as f64 + 0.5, k as f64 + 0.5);
                    pending.push((center, cell, 0));
                }
            }
        }

        while let Some((center, size, level)) = pending.pop() {
            let d = self.distance(center);
            if d < inside {
                return false;
            }
            // Distances are 1-Lipschitz: nothing in this cell lies deeper than d - half diagonal
            if level == EMPTY_PROBE_LEVELS || d - size.length() * 0.5 >= inside {
                continue;
            }
            let half = size * 0.5;
            for corner in 0..8 {
                let offset = DVec3::new(
                    if corner & 1 == 0 { -0.5 } else { 0.5 },
                    if corner & 2 == 0 { -0.5 } else { 0.5 },
                    if corner & 4 == 0 { -0.5 } else { 0.5 },
                ) * half;
                pending.push((center + offset, half, level + 1));
            }
        }
        true
    }
}
