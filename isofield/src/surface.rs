//! Sparse-field level-set surfaces with narrow-band tracking.
//!
//! A [`Surface`] embeds a `D`-dimensional implicit surface as the zero
//! crossing of a signed-distance field sampled on a regular grid. Only a
//! narrow band of points within `L` grid units of the crossing is stored and
//! updated; the band is maintained incrementally by a layered distance
//! transform rather than any global re-initialisation.
//!
//! An update step has three phases: delta intake ([`Surface::update_start`]
//! plus [`Surface::delta`] or the bulk [`Surface::update`]), application to
//! the zero layer, and outer-layer redistancing with layer transitions,
//! band expansion and convergence ([`Surface::update_end`]).

use crate::error::{Error, PrecondKind, PrecondViolation, Result};
use crate::grid::unravel;
use crate::partition::{for_each_maybe_par, PartitionedGrid, PartitionedLookup};
use crate::vector::VecD;
use ndarray::{ArrayD, IxDyn};
use rustc_hash::FxHashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

/// File format tag written ahead of a serialised iso-field.
const FILE_VERSION: u32 = 1;

/// Newton iteration cap for the raycast.
const RAY_MAX_STEPS: usize = 100;

/// Margin below which a raycast is considered converged on the surface.
const TINY: f32 = 1e-5;

/// Counts of partitions currently occupying memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Stats {
    /// Number of active iso-field partitions.
    pub active_iso_children: usize,
    /// Number of active delta partitions.
    pub active_delta_children: usize,
}

/// A spatially partitioned narrow-band signed-distance surface.
///
/// `N` is the number of tracking lists, one per narrow-band layer:
/// `N = 2·L + 1` for layer radius `L`. The default `N = 5` gives the usual
/// two outer layers on each side of the zero crossing.
#[derive(Debug)]
pub struct Surface<const D: usize, const N: usize = 5> {
    /// Canonical signed distance; its lists hold the band layer members.
    iso: PartitionedGrid<f32, D, N>,
    /// Per-point velocity for the current step, accumulated under list 0.
    delta: PartitionedGrid<f32, D, N>,
    /// Points whose layer changed this step; list id is the *source* layer,
    /// the stored value the target layer.
    status: PartitionedGrid<i8, D, N>,
    /// Outer-layer points whose distance may need recomputation.
    affected: PartitionedLookup<D, N>,
    affected_buf: PartitionedLookup<D, N>,
}

impl<const D: usize, const N: usize> Surface<D, N> {
    /// Narrow-band layer radius `L`.
    pub const RADIUS: i32 = (N as i32 - 1) / 2;

    /// Layer id sentinel for space outside the surface.
    const OUTSIDE_ID: i32 = Self::RADIUS + 1;

    /// Raycast miss sentinel.
    pub const RAY_MISS: VecD<f32, D> = VecD([f32::INFINITY; D]);

    const VALID: () = assert!(N % 2 == 1 && N >= 3, "N must be an odd layer-list count >= 3");

    /// Constructs a centred surface of the given size with the default
    /// partition size of 8.
    #[must_use]
    pub fn new(size: VecD<i32, D>) -> Self {
        Self::with_partition_size(size, VecD::splat(8))
    }

    /// Constructs a centred surface with an explicit partition size.
    ///
    /// The offset is always `−size / 2`; every point starts outside the
    /// surface at the background distance `L + 1`.
    #[must_use]
    pub fn with_partition_size(size: VecD<i32, D>, partition_size: VecD<i32, D>) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID;
        let offset = -(size / 2);
        let iso = PartitionedGrid::new(size.to_u32(), offset, partition_size, Self::outside());
        Self::from_iso(iso)
    }

    /// Rebuilds the companion grids around an existing iso-field.
    fn from_iso(iso: PartitionedGrid<f32, D, N>) -> Self {
        let layout = *iso.layout();
        let (size, offset, child) = (layout.size(), layout.offset(), layout.child_size());
        Self {
            delta: PartitionedGrid::new(size, offset, child, 0.0),
            status: PartitionedGrid::new(size, offset, child, Self::OUTSIDE_ID as i8),
            affected: PartitionedLookup::new(size, offset, child),
            affected_buf: PartitionedLookup::new(size, offset, child),
            iso,
        }
    }

    /// Background distance of never-touched space.
    fn outside() -> f32 {
        Self::OUTSIDE_ID as f32
    }

    /// Narrow-band layer id a signed distance belongs to.
    ///
    /// Rounds to the nearest integer with a small epsilon so that values of
    /// exactly `±0.5` round upward; this keeps half-integer points stable
    /// under floating-point noise.
    #[must_use]
    pub fn layer_id(value: f32) -> i32 {
        (value + f32::EPSILON).round() as i32
    }

    /// Tracking-list index of a layer id.
    #[must_use]
    pub fn layer_index(id: i32) -> usize {
        (id + Self::RADIUS) as usize
    }

    /// Whether a layer id lies within the narrow band.
    #[must_use]
    pub fn inside_band(id: i32) -> bool {
        id.abs() <= Self::RADIUS
    }

    /// The iso-field grid, for samplers and update functors.
    #[must_use]
    pub const fn isogrid(&self) -> &PartitionedGrid<f32, D, N> {
        &self.iso
    }

    /// Grid spacing used by distances and finite differences.
    #[must_use]
    pub const fn dx(&self) -> f32 {
        self.iso.dx()
    }

    /// Sets the grid spacing.
    pub fn set_dx(&mut self, dx: f32) {
        self.iso.set_dx(dx);
    }

    /// Positions currently tracked in the given narrow-band layer.
    #[must_use]
    pub fn layer(&self, id: i32) -> Vec<VecD<i32, D>> {
        self.iso.leaf_positions(Self::layer_index(id))
    }

    /// Number of points tracked in the given narrow-band layer.
    #[must_use]
    pub fn layer_len(&self, id: i32) -> usize {
        self.iso.leaf_count(Self::layer_index(id))
    }

    /// Partitions whose iso values were touched in the last update, for the
    /// given layer.
    #[must_use]
    pub fn delta_children(&self, id: i32) -> Vec<VecD<i32, D>> {
        self.delta.children_in(Self::layer_index(id))
    }

    /// Partitions where a layer transition out of the given source layer
    /// occurred in the last update.
    #[must_use]
    pub fn status_children(&self, id: i32) -> Vec<VecD<i32, D>> {
        self.status.children_in(Self::layer_index(id))
    }

    /// Approximate partition occupancy (max across layer lists).
    #[must_use]
    pub fn stats(&self) -> Stats {
        let max_over = |grid: &PartitionedGrid<f32, D, N>| {
            (0..N).map(|k| grid.children_in_len(k)).max().unwrap_or(0)
        };
        Stats {
            active_iso_children: max_over(&self.iso),
            active_delta_children: max_over(&self.delta),
        }
    }

    /// Dense row-major dump of the iso-field over its full extent.
    #[must_use]
    pub fn snapshot(&self) -> ArrayD<f32> {
        let layout = self.iso.layout();
        let shape: Vec<usize> = layout.size().0.iter().map(|&s| s as usize).collect();
        let values = (0..layout.size().area())
            .map(|index| self.iso.get(unravel(index, layout.size(), layout.offset())))
            .collect();
        ArrayD::from_shape_vec(IxDyn(&shape), values).expect("snapshot buffer matches grid shape")
    }

    /// Seeds the iso-field with a city-block distance pyramid of radius `L`
    /// centred on `pos`, populating the layer lists accordingly.
    ///
    /// Does not handle overwriting points already on the surface.
    ///
    /// # Panics
    ///
    /// Panics if any band point of the pyramid falls outside the grid.
    pub fn seed(&mut self, pos: VecD<i32, D>) {
        let radius = Self::RADIUS;
        let window: VecD<u32, D> = VecD::splat((2 * radius + 1) as u32);
        let lo = pos - VecD::splat(radius);

        for index in 0..window.area() {
            let probe = unravel(index, window, lo);
            let dist = (probe - pos).abs_sum() as f32;
            let id = Self::layer_id(dist);
            if Self::inside_band(id) {
                assert!(
                    self.iso.layout().inside(probe),
                    "seed at {:?} does not fit the grid",
                    pos.0
                );
                self.iso.track(dist, probe, Self::layer_index(id));
            }
        }
    }

    /// Begins an update step: resets the delta, status and affected grids
    /// against the iso-field (partitions the iso-field still tracks stay
    /// allocated to avoid churn).
    pub fn update_start(&mut self) {
        self.delta.reset(&self.iso);
        self.affected.reset(&self.iso);
        self.affected_buf.reset(&self.iso);
        self.status.reset(&self.iso);
    }

    /// Records a velocity for a single zero-layer point.
    ///
    /// Must be called between [`Surface::update_start`] and
    /// [`Surface::update_end`]. The value accumulates into the delta grid
    /// under list 0.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `|value| > 1` (a CFL violation); release
    /// builds clamp to the unit step.
    pub fn delta(&self, pos: VecD<i32, D>, value: f32) {
        let value = Self::clamp_delta(pos, value);
        self.delta.track(value, pos, Self::layer_index(0));
    }

    /// Runs a whole update step, invoking `f` for every zero-layer point to
    /// obtain its velocity. Partitions are processed in parallel.
    pub fn update<F>(&mut self, f: F)
    where
        F: Fn(VecD<i32, D>, &PartitionedGrid<f32, D, N>) -> f32 + Send + Sync,
    {
        self.update_start();
        // The whole zero layer is visited, so open the delta grid across the
        // iso-field's entire active set up front.
        self.delta.track_children(&self.iso);

        let idx0 = Self::layer_index(0);
        let children = self.iso.children_in(idx0);
        let iso = &self.iso;
        let delta = &self.delta;
        for_each_maybe_par(&children, |pos_child| {
            let index = iso.layout().child_index(pos_child);
            let leafs: Vec<(u32, VecD<i32, D>)> = {
                let child = iso.child(index);
                child
                    .list(idx0)
                    .iter()
                    .map(|&leaf| (leaf, child.position(leaf)))
                    .collect()
            };
            let mut delta_child = delta.child_mut(index);
            for (leaf, pos) in leafs {
                let value = Self::clamp_delta(pos, f(pos, iso));
                delta_child.track(value, leaf, idx0);
            }
        });

        self.update_end();
    }

    /// Runs a whole update step restricted to the inclusive box
    /// `[lo, hi]`, invoking `f` for the zero-layer points inside it.
    pub fn update_bbox<F>(&mut self, lo: VecD<i32, D>, hi: VecD<i32, D>, f: F)
    where
        F: Fn(VecD<i32, D>, &PartitionedGrid<f32, D, N>) -> f32 + Send + Sync,
    {
        self.update_start();

        let layout = *self.iso.layout();
        let lo_grid = VecD::from_fn(|i| lo[i].max(layout.offset()[i]));
        let hi_grid =
            VecD::from_fn(|i| hi[i].min(layout.offset()[i] + layout.size()[i] as i32 - 1));
        if (0..D).any(|i| lo_grid[i] > hi_grid[i]) {
            self.update_end();
            return;
        }

        let child_lo = layout.pos_child(lo_grid);
        let child_hi = layout.pos_child(hi_grid);
        let box_size: VecD<u32, D> = VecD::from_fn(|i| (child_hi[i] - child_lo[i] + 1) as u32);
        let children: Vec<VecD<i32, D>> = (0..box_size.area())
            .map(|index| unravel(index, box_size, child_lo))
            .collect();

        let idx0 = Self::layer_index(0);
        let iso = &self.iso;
        let delta = &self.delta;
        for_each_maybe_par(&children, |pos_child| {
            let index = layout.child_index(pos_child);
            let leafs: Vec<VecD<i32, D>> = {
                let child = iso.child(index);
                if child.is_active() {
                    child
                        .list(idx0)
                        .iter()
                        .map(|&leaf| child.position(leaf))
                        .collect()
                } else {
                    Vec::new()
                }
            };
            for pos in leafs {
                if (0..D).all(|i| pos[i] >= lo[i] && pos[i] <= hi[i]) {
                    let value = Self::clamp_delta(pos, f(pos, iso));
                    delta.track(value, pos, idx0);
                }
            }
        });

        self.update_end();
    }

    /// Applies the accumulated deltas: updates the zero layer, redistances
    /// the affected outer layers, flushes layer transitions, expands the
    /// band over newly revealed surface, and iterates until no transition
    /// remains.
    pub fn update_end(&mut self) {
        self.calc_affected();
        self.iso.track_children(&self.affected);
        self.delta.track_children(&self.affected);

        self.update_zero_layer();
        let mut changed = self.update_distance();
        self.flush_status_change();
        self.expand_narrow_band();

        // Points may keep jumping layers while collapsing regions settle;
        // each pass re-runs the distance transform over the points buffered
        // by the previous one.
        while changed {
            self.affected.reset(&self.iso);
            std::mem::swap(&mut self.affected, &mut self.affected_buf);
            self.status.reset(&self.affected);
            self.iso.track_children(&self.affected);
            self.delta.track_children(&self.affected);

            changed = self.update_distance();
            self.flush_status_change();
            self.expand_narrow_band();
        }

        #[cfg(debug_assertions)]
        self.assert_layers_consistent();
    }

    /// Casts a ray at the zero layer.
    ///
    /// Returns the hit position on the surface, or [`Self::RAY_MISS`] if the
    /// ray leaves the grid without striking it. Only partitions whose
    /// layer 0 or ±1 lists are non-empty are marched.
    #[must_use]
    pub fn ray(&self, origin: VecD<f32, D>, dir: VecD<f32, D>) -> VecD<f32, D> {
        let layout = *self.iso.layout();

        // A ray starting inside the grid first marches its own partition.
        if layout.inside_f32(origin) {
            if let Some(hit) = self.ray_march_child(origin, dir) {
                return hit;
            }
        }

        // Slab traversal: every partition transition crosses a partition
        // boundary plane on some axis, so collecting the ray's crossings of
        // all boundary planes enumerates every candidate partition.
        let mut candidates: Vec<(f32, usize)> = Vec::new();
        for axis in 0..D {
            if dir[axis] == 0.0 {
                continue;
            }
            for step in 0..=layout.children_size()[axis] {
                let plane =
                    (layout.offset()[axis] + step as i32 * layout.child_size()[axis]) as f32;
                let t = (plane - origin[axis]) / dir[axis];
                if t <= 0.0 {
                    continue;
                }
                let entry = origin + dir * t + dir * TINY;
                if !layout.inside_f32(entry) {
                    continue;
                }
                let index = layout.child_index(layout.pos_child(entry.floor_i32()));
                let near_zero = {
                    let child = self.iso.child(index);
                    !child.list(Self::layer_index(0)).is_empty()
                        || !child.list(Self::layer_index(1)).is_empty()
                        || !child.list(Self::layer_index(-1)).is_empty()
                };
                if near_zero {
                    candidates.push((t, index));
                }
            }
        }

        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut seen = FxHashSet::default();
        for (t, index) in candidates {
            if !seen.insert(index) {
                continue;
            }
            let entry = origin + dir * t + dir * TINY;
            if let Some(hit) = self.ray_march_child(entry, dir) {
                return hit;
            }
        }

        Self::RAY_MISS
    }

    /// Saves the iso-field: a version tag followed by an LZ4 frame holding
    /// the bincode image of the partitioned grid.
    ///
    /// # Errors
    ///
    /// Returns an error if writing or encoding fails.
    pub fn save<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&FILE_VERSION.to_le_bytes())?;
        let mut encoder = lz4_flex::frame::FrameEncoder::new(writer);
        bincode::serialize_into(&mut encoder, &self.iso)
            .map_err(|err| Error::Other(anyhow::Error::new(err)))?;
        encoder
            .finish()
            .map_err(|err| Error::Other(anyhow::Error::new(err)))?;
        Ok(())
    }

    /// Loads a surface previously written by [`Surface::save`]. The delta,
    /// status and affected grids are rebuilt fresh from the iso-field's
    /// extents.
    ///
    /// # Errors
    ///
    /// Returns an error on a version mismatch or if reading/decoding fails.
    pub fn load<R: Read>(mut reader: R) -> Result<Self> {
        let mut tag = [0_u8; 4];
        reader.read_exact(&mut tag)?;
        let version = u32::from_le_bytes(tag);
        if version != FILE_VERSION {
            return Err(Error::General(format!(
                "unsupported surface file version {version}, expected {FILE_VERSION}"
            )));
        }
        let decoder = lz4_flex::frame::FrameDecoder::new(reader);
        let iso = bincode::deserialize_from(decoder)
            .map_err(|err| Error::Other(anyhow::Error::new(err)))?;
        Ok(Self::from_iso(iso))
    }

    // ---- update internals ----------------------------------------------

    /// Clamps a zero-layer velocity to the unit step.
    fn clamp_delta(pos: VecD<i32, D>, value: f32) -> f32 {
        if value.abs() > 1.0 {
            #[cfg(debug_assertions)]
            panic!(
                "{}",
                PrecondViolation::at(
                    PrecondKind::DeltaTooLarge,
                    pos,
                    format!("zero-layer delta {value} exceeds the unit step"),
                )
            );
            #[cfg(not(debug_assertions))]
            {
                return value.clamp(-1.0, 1.0);
            }
        }
        value
    }

    /// Calls `f` for each in-bounds cardinal neighbour of `pos`, in the
    /// order `−e₀, +e₀, −e₁, +e₁, …`.
    fn for_each_neigh(&self, pos: VecD<i32, D>, mut f: impl FnMut(VecD<i32, D>)) {
        let mut probe = pos;
        for axis in 0..D {
            probe[axis] -= 1;
            if self.iso.layout().inside(probe) {
                f(probe);
            }
            probe[axis] += 2;
            if self.iso.layout().inside(probe) {
                f(probe);
            }
            probe[axis] -= 1;
        }
    }

    /// City-block distance of `pos` from the zero layer, one step outward
    /// from its neighbour closest to the crossing on the given side.
    ///
    /// The scan starts from the point's own value, so an isolated point with
    /// no closer neighbour decays by one unit per pass until it leaves the
    /// band — this is what makes collapsing regions converge.
    fn distance(&self, pos: VecD<i32, D>, side: f32) -> f32 {
        let mut best = self.iso.get(pos) * side;
        self.for_each_neigh(pos, |probe| {
            let candidate = self.iso.get(probe) * side;
            if candidate < best {
                best = candidate;
            }
        });
        best * side + side * self.iso.dx()
    }

    /// Grows the affected set: seeds it with the changed zero-layer points,
    /// then expands ring by ring up to `L`, adding every in-band neighbour
    /// to the list of its current layer.
    ///
    /// The per-partition `(first, last)` windows paginate each ring so that
    /// points added by the current ring are not re-expanded until the next —
    /// a layered BFS over the tracking lists with stable indices.
    fn calc_affected(&self) {
        let idx0 = Self::layer_index(0);

        for pos_child in self.delta.children_in(idx0) {
            let index = self.delta.layout().child_index(pos_child);
            let leafs: Vec<VecD<i32, D>> = {
                let child = self.delta.child(index);
                child
                    .list(idx0)
                    .iter()
                    .map(|&leaf| child.position(leaf))
                    .collect()
            };
            for pos in leafs {
                self.affected.track(pos, idx0);
            }
        }

        let mut first = vec![Vec::new(); N];
        let mut last = vec![Vec::new(); N];

        for _ring in 1..=Self::RADIUS {
            for k in 0..N {
                let children = self.affected.children_in(k);
                first[k].resize(children.len(), 0);
                last[k].resize(children.len(), 0);
                for (i, pos_child) in children.iter().enumerate() {
                    let index = self.affected.layout().child_index(*pos_child);
                    last[k][i] = self.affected.child(index).list(k).len();
                }
            }

            for k in 0..N {
                let children = self.affected.children_in(k);
                // Only the partitions known before this ring; the parent
                // list may grow while we track neighbours, and appends keep
                // earlier indices stable.
                for i in 0..first[k].len() {
                    let pos_child = children[i];
                    let index = self.affected.layout().child_index(pos_child);
                    let window: Vec<u32> = {
                        let child = self.affected.child(index);
                        child.list(k)[first[k][i]..last[k][i]].to_vec()
                    };
                    for leaf in window {
                        let pos = self.affected.leaf_position(pos_child, leaf);
                        self.for_each_neigh(pos, |probe| {
                            let id = Self::layer_id(self.iso.get(probe));
                            if Self::inside_band(id) {
                                self.affected.track(probe, Self::layer_index(id));
                            }
                        });
                    }
                }
            }

            for k in 0..N {
                for i in 0..last[k].len() {
                    first[k][i] = last[k][i];
                }
            }
        }
    }

    /// Applies the delta grid to the zero layer, recording layer
    /// transitions. Parallel over partitions.
    fn update_zero_layer(&self) {
        let idx0 = Self::layer_index(0);
        let children = self.delta.children_in(idx0);
        for_each_maybe_par(&children, |pos_child| {
            let index = self.iso.layout().child_index(pos_child);
            let entries: Vec<(u32, VecD<i32, D>, f32)> = {
                let child = self.delta.child(index);
                child
                    .list(idx0)
                    .iter()
                    .map(|&leaf| (leaf, child.position(leaf), child.get(leaf)))
                    .collect()
            };
            let mut iso_child = self.iso.child_mut(index);
            for (leaf, pos, delta) in entries {
                let prev = iso_child.get(leaf);
                debug_assert!(
                    Self::layer_id(prev) == 0,
                    "zero-layer update at non-zero point {:?} = {prev}",
                    pos.0
                );
                let next = prev + delta;
                let to = Self::layer_id(next);
                debug_assert!(
                    to.abs() <= 1,
                    "zero-layer update at {:?} jumps to layer {to}",
                    pos.0
                );
                iso_child.set(leaf, next);
                self.status_change(index, pos, leaf, 0, to);
            }
        });
    }

    /// Runs the distance transform over every affected outer layer, inner
    /// side first. Returns `true` if any point changed layer.
    fn update_distance(&self) -> bool {
        let mut changed = false;
        for step in 1..=Self::RADIUS {
            changed |= self.update_distance_layer(-step, -1);
        }
        for step in 1..=Self::RADIUS {
            changed |= self.update_distance_layer(step, 1);
        }
        changed
    }

    /// Distance transform for one layer: a first parallel pass computes
    /// distances into the delta grid (so neighbouring points within the
    /// pass never observe each other's new values), a second copies them
    /// into the iso-field and records layer transitions.
    fn update_distance_layer(&self, layer: i32, side: i32) -> bool {
        let k = Self::layer_index(layer);
        let children = self.affected.children_in(k);

        for_each_maybe_par(&children, |pos_child| {
            let index = self.affected.layout().child_index(pos_child);
            let leafs: Vec<(u32, VecD<i32, D>)> = {
                let child = self.affected.child(index);
                child
                    .list(k)
                    .iter()
                    .map(|&leaf| (leaf, self.affected.leaf_position(pos_child, leaf)))
                    .collect()
            };
            let mut delta_child = self.delta.child_mut(index);
            for (leaf, pos) in leafs {
                let dist = self.distance(pos, side as f32);
                debug_assert!(
                    (Self::layer_id(dist) - layer).abs() <= 1,
                    "distance at {:?} jumps from layer {layer} to {}",
                    pos.0,
                    Self::layer_id(dist)
                );
                delta_child.track(dist, leaf, k);
            }
        });

        let changed = AtomicBool::new(false);
        for_each_maybe_par(&children, |pos_child| {
            let index = self.affected.layout().child_index(pos_child);
            let entries: Vec<(u32, VecD<i32, D>, f32)> = {
                let affected_child = self.affected.child(index);
                let delta_child = self.delta.child(index);
                affected_child
                    .list(k)
                    .iter()
                    .map(|&leaf| {
                        (
                            leaf,
                            self.affected.leaf_position(pos_child, leaf),
                            delta_child.get(leaf),
                        )
                    })
                    .collect()
            };
            let mut iso_child = self.iso.child_mut(index);
            for (leaf, pos, dist) in entries {
                iso_child.set(leaf, dist);
                if self.status_change(index, pos, leaf, layer, Self::layer_id(dist)) {
                    changed.store(true, Ordering::Relaxed);
                }
            }
        });
        changed.load(Ordering::Relaxed)
    }

    /// Records that a point should move from layer `from` to layer `to`.
    ///
    /// A point already marked in this pass has its target overwritten — it
    /// is jumping a further layer on a later convergence iteration. In-band
    /// targets are buffered for the next distance pass.
    fn status_change(
        &self,
        child_index: usize,
        pos: VecD<i32, D>,
        leaf: u32,
        from: i32,
        to: i32,
    ) -> bool {
        if from == to {
            return false;
        }
        let outside = Self::OUTSIDE_ID as i8;
        let current = self.status.child(child_index).get(leaf);
        if current == outside {
            self.status.track(to as i8, pos, Self::layer_index(from));
        } else {
            self.status.child_mut(child_index).set(leaf, to as i8);
        }
        if Self::inside_band(to) {
            self.affected_buf.track(pos, Self::layer_index(to));
        }
        true
    }

    /// Moves every status-changed point to its target layer list, or out of
    /// the band entirely (installing the `±(L+1)` sentinel as the point's
    /// value, and as the partition background if the partition empties).
    fn flush_status_change(&self) {
        for from in -Self::RADIUS..=Self::RADIUS {
            let k = Self::layer_index(from);
            let children = self.status.children_in(k);
            for_each_maybe_par(&children, |pos_child| {
                let index = self.status.layout().child_index(pos_child);
                let entries: Vec<(VecD<i32, D>, i8)> = {
                    let child = self.status.child(index);
                    child
                        .list(k)
                        .iter()
                        .map(|&leaf| (child.position(leaf), child.get(leaf)))
                        .collect()
                };
                for (pos, to) in entries {
                    let to = i32::from(to);
                    if Self::inside_band(to) {
                        self.iso.retrack(pos, k, Self::layer_index(to));
                    } else {
                        self.iso.untrack(to as f32, pos, k);
                    }
                }
            });
        }
    }

    /// Adds new points to the outermost layers when the band moves.
    ///
    /// A point that just stepped from `±L` to `±(L−1)` has revealed fresh
    /// surface: any of its neighbours still at the background sentinel now
    /// lies at distance `±L` and joins the band.
    fn expand_narrow_band(&self) {
        for layer in [-Self::RADIUS, Self::RADIUS] {
            let k = Self::layer_index(layer);
            let side = layer.signum();
            let target = layer - side;
            for pos_child in self.status.children_in(k) {
                let index = self.status.layout().child_index(pos_child);
                let entries: Vec<(VecD<i32, D>, i8)> = {
                    let child = self.status.child(index);
                    child
                        .list(k)
                        .iter()
                        .map(|&leaf| (child.position(leaf), child.get(leaf)))
                        .collect()
                };
                for (pos, to) in entries {
                    if i32::from(to) != target {
                        continue;
                    }
                    self.for_each_neigh(pos, |probe| {
                        let id = Self::layer_id(self.iso.get(probe));
                        if Self::inside_band(id) {
                            return;
                        }
                        let dist = self.distance(probe, side as f32);
                        debug_assert!(
                            Self::layer_id(dist) == layer,
                            "expansion at {:?} computed layer {} instead of {layer}",
                            probe.0,
                            Self::layer_id(dist)
                        );
                        self.iso.track(dist, probe, k);
                    });
                }
            }
        }
    }

    /// Marches a ray through one partition in `0.5·dx` steps, Newton
    /// converging onto the zero crossing when a sample lands on it from the
    /// outside.
    fn ray_march_child(&self, start: VecD<f32, D>, dir: VecD<f32, D>) -> Option<VecD<f32, D>> {
        let layout = *self.iso.layout();
        let child_index = layout.child_index(layout.pos_child(start.floor_i32()));
        let (child_offset, child_size) = {
            let child = self.iso.child(child_index);
            (child.offset(), child.size())
        };
        let inside_child = |p: VecD<f32, D>| {
            (0..D).all(|i| {
                p[i] >= child_offset[i] as f32 && p[i] < (child_offset[i] + child_size[i] as i32) as f32
            })
        };

        let mut pos = start;
        let mut t = 0.0;
        while inside_child(pos) {
            if Self::layer_id(self.iso.interp(pos)) == 0 {
                let mut normal = self.iso.grad_at(pos).normalized();
                debug_assert!(!normal[0].is_nan(), "isosurface normal is NaN at {:?}", pos.0);
                if normal.dot(dir) < 0.0 {
                    for _ in 0..RAY_MAX_STEPS {
                        let dist = self.iso.interp(pos);
                        pos = pos - normal * dist;
                        if !layout.inside_f32(pos) {
                            return None;
                        }
                        if dist.abs() <= TINY || normal.dot(dir) >= 0.0 {
                            return Some(pos);
                        }
                        normal = self.iso.grad_at(pos).normalized();
                    }
                    #[cfg(debug_assertions)]
                    panic!(
                        "{}",
                        PrecondViolation::at_f32(
                            PrecondKind::RayIter,
                            pos,
                            format!("raycast failed to converge within {RAY_MAX_STEPS} steps"),
                        )
                    );
                    #[cfg(not(debug_assertions))]
                    {
                        log::warn!(
                            "raycast failed to converge within {RAY_MAX_STEPS} steps at {:?}",
                            pos.0
                        );
                        return Some(pos);
                    }
                }
            }
            t += 0.5 * self.iso.dx();
            pos = start + dir * t;
        }
        None
    }

    /// Debug validation: every tracked point's value must round to the layer
    /// it is tracked in.
    #[cfg(debug_assertions)]
    fn assert_layers_consistent(&self) {
        for id in -Self::RADIUS..=Self::RADIUS {
            for pos in self.layer(id) {
                let actual = Self::layer_id(self.iso.get(pos));
                assert!(
                    actual == id,
                    "{}",
                    PrecondViolation::at(
                        PrecondKind::DegenerateLayer,
                        pos,
                        format!("tracked in layer {id} but value rounds to layer {actual}"),
                    )
                );
            }
        }
    }
}

/// Two-dimensional surface with the default two-layer band.
pub type Surface2 = Surface<2, 5>;
/// Three-dimensional surface with the default two-layer band.
pub type Surface3 = Surface<3, 5>;
