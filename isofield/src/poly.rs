//! Polygonisation of the zero layer, one mesh per spatial partition.
//!
//! Each partition owns a [`Poly`] mesh whose vertex-index grid extends one
//! node past the partition box on the positive axes, so cubes based inside
//! the partition can place vertices on its far faces. Dirty state is
//! tracked at two levels: partitions flagged by [`Polys::notify`] after a
//! surface update, and individual cubes collected while marching —
//! including cubes that spill across a partition boundary into a
//! neighbouring mesh, which is what keeps seams watertight.

use crate::partition::{PartitionedGrid, PartitionedLookup};
use crate::surface::Surface;
use crate::tables::{CubeTables, Dim};
use crate::tracked::TrackedGrid;
use crate::vector::VecD;
use itertools::Itertools;
use rayon::prelude::*;
use rustc_hash::FxHashSet;

/// A mesh vertex on the zero isosurface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Vertex<const D: usize> {
    /// Position on the interpolated zero crossing.
    pub pos: VecD<f32, D>,
    /// Surface normal from the central-difference gradient (zero where the
    /// gradient vanishes, e.g. at a singular seed point).
    pub norm: VecD<f32, D>,
}

/// A simplex of the zero isosurface: a line in 2D, a triangle in 3D, as
/// indices into the owning mesh's vertex array.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Simplex<const D: usize> {
    /// Vertex indices, `D` per simplex.
    pub idxs: VecD<u32, D>,
}

/// Polygonisation of a single partition of the iso-field.
#[derive(Debug)]
pub struct Poly<const D: usize> {
    /// Per-axis vertex indices, memoising edge vertices across the cubes of
    /// this partition. One-list tracked grid for O(touched) reset.
    vtx_grid: TrackedGrid<VecD<u32, D>, D, 1>,
    vtxs: Vec<Vertex<D>>,
    spxs: Vec<Simplex<D>>,
}

impl<const D: usize> Poly<D>
where
    Dim<D>: CubeTables<D>,
{
    const NULL_TUPLE: VecD<u32, D> = VecD([crate::lookup::NULL_IDX; D]);

    /// Constructs an empty mesh for a partition box. The vertex-index grid
    /// gets a one-node overlap on the positive faces.
    #[must_use]
    pub fn new(size: VecD<u32, D>, offset: VecD<i32, D>) -> Self {
        let padded = VecD::from_fn(|i| size[i] + 1);
        Self {
            vtx_grid: TrackedGrid::new(padded, offset, Self::NULL_TUPLE),
            vtxs: Vec::new(),
            spxs: Vec::new(),
        }
    }

    /// The vertex array.
    #[must_use]
    pub fn vtxs(&self) -> &[Vertex<D>] {
        &self.vtxs
    }

    /// The simplex array.
    #[must_use]
    pub fn spxs(&self) -> &[Simplex<D>] {
        &self.spxs
    }

    /// Drops all vertices and simplices and nulls the touched vertex-index
    /// cells.
    pub fn reset(&mut self) {
        self.vtx_grid.reset(0);
        self.vtxs.clear();
        self.spxs.clear();
    }

    /// Corner in/out bitmask of the cube at `base`: bit `i` is set when the
    /// iso value at corner `i` is positive (outside).
    #[must_use]
    pub fn corner_mask<const N: usize>(
        iso: &PartitionedGrid<f32, D, N>,
        base: VecD<i32, D>,
    ) -> usize {
        let mut mask = 0;
        for i in 0..1_usize << D {
            let value = iso.get_or_background(base + <Dim<D> as CubeTables<D>>::corner(i));
            mask |= usize::from(value > 0.0) << i;
        }
        mask
    }

    /// Index of the vertex on the zero crossing of the edge at `pos` along
    /// `axis`, creating and caching it on first use.
    ///
    /// Placement follows the degenerate-aware rules: at an endpoint whose
    /// value is within ε of zero, at the midpoint when the endpoint values
    /// are within ε of each other, else linearly interpolated.
    pub fn vertex_index<const N: usize>(
        &mut self,
        pos: VecD<i32, D>,
        axis: usize,
        iso: &PartitionedGrid<f32, D, N>,
    ) -> u32 {
        let cached = self.vtx_grid.get(pos)[axis];
        if cached != crate::lookup::NULL_IDX {
            return cached;
        }

        let mut opposite = pos;
        opposite[axis] += 1;

        let val_a = iso.get_or_background(pos);
        let val_b = iso.get_or_background(opposite);

        let vertex_pos = if val_a.abs() <= f32::EPSILON {
            pos.to_f32()
        } else if val_b.abs() <= f32::EPSILON {
            opposite.to_f32()
        } else {
            let t = if (val_a - val_b).abs() <= f32::EPSILON {
                0.5
            } else {
                val_a / (val_a - val_b)
            };
            let a = pos.to_f32();
            let b = opposite.to_f32();
            a + (b - a) * t
        };

        let grad = iso.grad_central_at(vertex_pos);
        let norm = if grad.squared_norm() > 0.0 {
            grad.normalized()
        } else {
            grad
        };

        let index = self.vtxs.len() as u32;
        self.vtxs.push(Vertex {
            pos: vertex_pos,
            norm,
        });
        let mut tuple = self.vtx_grid.get(pos);
        tuple[axis] = index;
        self.vtx_grid.track(pos, tuple, 0);
        index
    }

    /// Emits the simplices of the cube based at `base` into this mesh.
    ///
    /// Simplices whose vertices coincide under ε are dropped individually;
    /// the remaining simplices of the same cube are kept.
    pub fn emit_cube<const N: usize>(
        &mut self,
        base: VecD<i32, D>,
        iso: &PartitionedGrid<f32, D, N>,
    ) {
        let mask = Self::corner_mask(iso, base);
        let edge_mask = <Dim<D> as CubeTables<D>>::edge_mask(mask);
        if edge_mask == 0 {
            return;
        }

        let mut edge_vtxs = [0_u32; 16];
        for e in 0..<Dim<D> as CubeTables<D>>::NUM_EDGES {
            if (edge_mask >> e) & 1 == 1 {
                let edge = <Dim<D> as CubeTables<D>>::edge(e);
                edge_vtxs[e] = self.vertex_index(base + edge.offset, edge.axis, iso);
            }
        }

        let order = <Dim<D> as CubeTables<D>>::simplex_order(mask);
        for chunk in order.chunks(D) {
            if chunk[0] < 0 {
                break;
            }
            let idxs: VecD<u32, D> = VecD::from_fn(|i| edge_vtxs[chunk[i] as usize]);
            if self.is_degenerate(idxs) {
                continue;
            }
            self.spxs.push(Simplex { idxs });
        }
    }

    /// A simplex is degenerate when any two of its vertices coincide.
    fn is_degenerate(&self, idxs: VecD<u32, D>) -> bool {
        for i in 0..D {
            for j in i + 1..D {
                let a = self.vtxs[idxs[i] as usize].pos;
                let b = self.vtxs[idxs[j] as usize].pos;
                if (a - b).squared_norm() <= f32::EPSILON {
                    return true;
                }
            }
        }
        false
    }
}

/// Polygonisation engine: one [`Poly`] per iso-field partition, with change
/// tracking so that only touched partitions are re-marched.
#[derive(Debug)]
pub struct Polys<const D: usize, const N: usize = 5> {
    meshes: Vec<Poly<D>>,
    /// Dirty partitions (parent level) and dirty cube bases (leaf level).
    changes: PartitionedLookup<D, 1>,
}

impl<const D: usize, const N: usize> Polys<D, N>
where
    Dim<D>: CubeTables<D>,
{
    /// Constructs meshes covering every partition of the surface.
    #[must_use]
    pub fn new(surface: &Surface<D, N>) -> Self {
        let layout = *surface.isogrid().layout();
        let meshes = (0..layout.num_children())
            .map(|index| {
                let pos_child = layout.child_position(index);
                Poly::new(
                    layout.child_size().to_u32(),
                    layout.child_offset(pos_child),
                )
            })
            .collect();
        Self {
            meshes,
            changes: PartitionedLookup::new(layout.size(), layout.offset(), layout.child_size()),
        }
    }

    /// The mesh of the partition at a flat child index.
    #[must_use]
    pub fn mesh(&self, index: usize) -> &Poly<D> {
        &self.meshes[index]
    }

    /// Number of per-partition meshes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    /// Returns `true` if there are no meshes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    /// Partitions currently marked dirty — meaningful between
    /// [`Polys::notify`] and [`Polys::march`].
    #[must_use]
    pub fn changes(&self) -> Vec<VecD<i32, D>> {
        self.changes.children_in(0)
    }

    /// Records which partitions the last surface update dirtied: those with
    /// zero-layer delta writes or zero-layer status changes. Partitions
    /// with neither zero-layer points nor previously emitted simplices are
    /// dropped again.
    pub fn notify(&mut self, surface: &Surface<D, N>) {
        let touched: Vec<VecD<i32, D>> = surface
            .delta_children(0)
            .into_iter()
            .chain(surface.status_children(0))
            .unique()
            .collect();
        for pos_child in touched {
            self.notify_child(surface, pos_child);
        }
    }

    fn notify_child(&mut self, surface: &Surface<D, N>, pos_child: VecD<i32, D>) {
        let layout = surface.isogrid().layout();
        let index = layout.child_index(pos_child);
        let idx0 = Surface::<D, N>::layer_index(0);
        let has_zero = !surface.isogrid().child(index).list(idx0).is_empty();
        if has_zero || !self.meshes[index].spxs().is_empty() {
            self.changes.track_child(pos_child, 0);
        } else {
            self.changes.untrack_child(pos_child, 0);
        }
    }

    /// Marks every partition with zero-layer points as dirty — for callers
    /// that mutated the surface without calling [`Polys::notify`].
    pub fn invalidate(&mut self, surface: &Surface<D, N>) {
        let idx0 = Surface::<D, N>::layer_index(0);
        for pos_child in surface.isogrid().children_in(idx0) {
            self.changes.track_child(pos_child, 0);
        }
    }

    /// Re-polygonises every dirty partition.
    ///
    /// A first pass walks the zero-layer points of dirty partitions and
    /// collects the `2^D` cubes incident to each, tracking every cube in
    /// the partition that owns its base — activating neighbour partitions
    /// when a cube spills over a boundary, and iterating until the dirty
    /// set stops growing. A second, parallel pass resets each dirty mesh
    /// and emits its collected cubes.
    pub fn march(&mut self, surface: &Surface<D, N>) {
        let layout = *surface.isogrid().layout();
        let idx0 = Surface::<D, N>::layer_index(0);

        // First pass: collect dirty cubes to a fixpoint over spill-overs.
        let mut processed: FxHashSet<usize> = FxHashSet::default();
        loop {
            let pending: Vec<VecD<i32, D>> = self
                .changes
                .children_in(0)
                .into_iter()
                .filter(|&pos_child| !processed.contains(&layout.child_index(pos_child)))
                .collect();
            if pending.is_empty() {
                break;
            }
            for pos_child in pending {
                let index = layout.child_index(pos_child);
                processed.insert(index);
                let zeros: Vec<VecD<i32, D>> = {
                    let child = surface.isogrid().child(index);
                    child
                        .list(idx0)
                        .iter()
                        .map(|&leaf| child.position(leaf))
                        .collect()
                };
                for pos in zeros {
                    for corner in 0..1_usize << D {
                        let base = pos - <Dim<D> as CubeTables<D>>::corner(corner);
                        if layout.inside(base) {
                            self.changes.track(base, 0);
                        }
                    }
                }
            }
        }

        // Second pass: reset and re-emit each dirty mesh.
        let dirty: FxHashSet<usize> = self
            .changes
            .children_in(0)
            .into_iter()
            .map(|pos_child| layout.child_index(pos_child))
            .collect();
        let changes = &self.changes;
        let iso = surface.isogrid();
        let remarch = |(index, mesh): (usize, &mut Poly<D>)| {
            if !dirty.contains(&index) {
                return;
            }
            mesh.reset();
            let pos_child = layout.child_position(index);
            let cubes: Vec<VecD<i32, D>> = changes
                .child(index)
                .list(0)
                .iter()
                .map(|&leaf| changes.leaf_position(pos_child, leaf))
                .collect();
            for base in cubes {
                mesh.emit_cube(base, iso);
            }
        };
        if dirty.len() >= crate::partition::PAR_MIN_CHILDREN {
            self.meshes.par_iter_mut().enumerate().for_each(remarch);
        } else {
            self.meshes.iter_mut().enumerate().for_each(remarch);
        }

        self.changes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{Surface2, Surface3};
    use float_cmp::assert_approx_eq;

    /// A 2D iso grid over one partition with values from `f`.
    fn iso_from_fn(half: i32, f: impl Fn(i32, i32) -> f32) -> PartitionedGrid<f32, 2, 5> {
        let size = (2 * half + 1) as u32;
        let grid = PartitionedGrid::new(
            VecD([size, size]),
            VecD([-half, -half]),
            VecD([size as i32, size as i32]),
            3.0,
        );
        for x in -half..=half {
            for y in -half..=half {
                grid.track(f(x, y), VecD([x, y]), 0);
            }
        }
        grid
    }

    #[test]
    fn single_corner_cube_emits_one_line() {
        // Corner (1, 0) outside, the rest inside: corner mask 0b0010.
        let iso = iso_from_fn(2, |x, y| if (x, y) == (1, 0) { 1.0 } else { -1.0 });
        let mut poly = Poly::<2>::new(VecD([5, 5]), VecD([-2, -2]));

        assert_eq!(Poly::<2>::corner_mask(&iso, VecD([0, 0])), 0b0010);
        poly.emit_cube(VecD([0, 0]), &iso);

        assert_eq!(poly.spxs().len(), 1);
        assert_eq!(poly.vtxs().len(), 2);
        // The endpoints sit on the two edges adjacent to the outside corner.
        let a = poly.vtxs()[poly.spxs()[0].idxs[0] as usize].pos;
        let b = poly.vtxs()[poly.spxs()[0].idxs[1] as usize].pos;
        assert_approx_eq!(f32, a[0], 0.5, epsilon = 1e-6);
        assert_approx_eq!(f32, a[1], 0.0, epsilon = 1e-6);
        assert_approx_eq!(f32, b[0], 1.0, epsilon = 1e-6);
        assert_approx_eq!(f32, b[1], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn shared_edge_vertices_are_memoised() {
        // A vertical interface at x = 0.5 crossing two stacked cubes.
        let iso = iso_from_fn(2, |x, _| x as f32 - 0.5);
        let mut poly = Poly::<2>::new(VecD([5, 5]), VecD([-2, -2]));

        poly.emit_cube(VecD([0, 0]), &iso);
        let after_one = poly.vtxs().len();
        poly.emit_cube(VecD([0, 1]), &iso);

        // The cubes share the edge at (0, 1): three vertices total, not four.
        assert_eq!(after_one, 2);
        assert_eq!(poly.vtxs().len(), 3);
        assert_eq!(poly.spxs().len(), 2);
    }

    #[test]
    fn vertex_lands_on_near_zero_endpoint() {
        let iso = iso_from_fn(2, |x, _| x as f32);
        let mut poly = Poly::<2>::new(VecD([5, 5]), VecD([-2, -2]));

        // The crossing sits exactly on the lattice at x = 0.
        let index = poly.vertex_index(VecD([0, 0]), 0, &iso);
        let vertex = poly.vtxs()[index as usize];
        assert_eq!(vertex.pos, VecD([0.0, 0.0]));
        // Normal points along +x, the gradient direction.
        assert_approx_eq!(f32, vertex.norm[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn singular_seed_emits_no_simplices() {
        // All three cut edges of the cube collapse onto the seed point, so
        // the one candidate triangle is degenerate and dropped.
        let mut surface = Surface3::new(VecD([9, 9, 9]));
        surface.seed(VecD([0, 0, 0]));

        let mut poly = Poly::<3>::new(VecD([9, 9, 9]), VecD([-4, -4, -4]));
        poly.emit_cube(VecD([0, 0, 0]), surface.isogrid());

        assert_eq!(poly.vtxs().len(), 3);
        assert!(poly.spxs().is_empty());
    }

    #[test]
    fn expanded_seed_polygonises() {
        let mut surface = Surface3::new(VecD([9, 9, 9]));
        surface.seed(VecD([0, 0, 0]));
        surface.update(|_, _| -1.0);

        let mut polys = Polys::new(&surface);
        polys.notify(&surface);
        assert!(!polys.changes().is_empty());
        polys.march(&surface);
        assert!(polys.changes().is_empty());

        let total: usize = (0..polys.len()).map(|i| polys.mesh(i).spxs().len()).sum();
        // The octahedron |x|+|y|+|z| = 1 triangulates into eight faces.
        assert_eq!(total, 8);

        // Every emitted vertex lies on the interpolated zero crossing.
        for i in 0..polys.len() {
            for vertex in polys.mesh(i).vtxs() {
                let value = surface.isogrid().interp(vertex.pos);
                assert_approx_eq!(f32, value, 0.0, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn collapse_clears_meshes() {
        let mut surface = Surface2::new(VecD([9, 9]));
        surface.seed(VecD([0, 0]));
        surface.update(|_, _| -1.0);

        let mut polys = Polys::new(&surface);
        polys.notify(&surface);
        polys.march(&surface);
        let total: usize = (0..polys.len()).map(|i| polys.mesh(i).spxs().len()).sum();
        assert!(total > 0);

        // Contract until the surface is gone; the dirty partitions still
        // hold stale simplices and must be re-marched to empty.
        surface.update(|_, _| 1.0);
        polys.notify(&surface);
        surface.update(|_, _| 1.0);
        polys.notify(&surface);
        polys.march(&surface);
        let total: usize = (0..polys.len()).map(|i| polys.mesh(i).spxs().len()).sum();
        assert_eq!(total, 0);
    }

    #[test]
    fn invalidate_marks_zero_partitions() {
        let mut surface = Surface2::new(VecD([9, 9]));
        surface.seed(VecD([0, 0]));
        surface.update(|_, _| -1.0);

        // No notify after the update: invalidate recovers the dirty set.
        let mut polys = Polys::new(&surface);
        polys.invalidate(&surface);
        polys.march(&surface);

        let total: usize = (0..polys.len()).map(|i| polys.mesh(i).spxs().len()).sum();
        assert!(total > 0);
    }

    /// Canonical multiset of simplices as sorted vertex-position keys,
    /// independent of vertex indexing and winding.
    fn simplex_keys<const D: usize, const N: usize>(polys: &Polys<D, N>) -> Vec<Vec<[i64; 3]>>
    where
        Dim<D>: CubeTables<D>,
    {
        let mut keys = Vec::new();
        for i in 0..polys.len() {
            let mesh = polys.mesh(i);
            for simplex in mesh.spxs() {
                let mut verts: Vec<[i64; 3]> = (0..D)
                    .map(|v| {
                        let p = mesh.vtxs()[simplex.idxs[v] as usize].pos;
                        let mut key = [0_i64; 3];
                        for axis in 0..D {
                            key[axis] = (p[axis] * 1024.0).round() as i64;
                        }
                        key
                    })
                    .collect();
                verts.sort_unstable();
                keys.push(verts);
            }
        }
        keys.sort_unstable();
        keys
    }

    #[test]
    fn partitioned_march_matches_monolithic() {
        let build = |partition: i32| {
            let mut surface =
                Surface3::with_partition_size(VecD([15, 15, 15]), VecD::splat(partition));
            surface.seed(VecD([0, 0, 0]));
            surface.update(|_, _| -1.0);
            surface.update(|_, _| -1.0);
            let mut polys = Polys::new(&surface);
            polys.notify(&surface);
            polys.march(&surface);
            simplex_keys(&polys)
        };

        let partitioned = build(5);
        let monolithic = build(15);
        assert!(!monolithic.is_empty());
        // Identical simplex sets up to vertex relabelling: no seam holes,
        // no duplicates.
        assert_eq!(partitioned, monolithic);
    }
}
