//! Spatially partitioned grids: a coarse grid of lazily-activated children.
//!
//! Storage is split at two scales. The *children* grid is a coarse lookup of
//! [`Child`] leaf grids, each `child_size` wide. A child allocates its value
//! buffer and lookup cells only when the first point in it is tracked, and
//! frees them again when its last tracking list empties, so only regions of
//! space touched by the narrow band consume memory.
//!
//! Children sit behind [`RwLock`]s: workers take a long-lived write guard
//! only on the partition they own in a phase, while cross-partition reads
//! take short-lived read guards. The parent lookup has its own lock and is
//! never held across a child operation.

use crate::grid::{ravel, unravel};
use crate::lookup::{LeafLookup, MultiLookup};
use crate::vector::VecD;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Minimum number of active partitions before loops dispatch in parallel.
///
/// Below this, the fixed cost of a parallel dispatch exceeds the work.
pub const PAR_MIN_CHILDREN: usize = 32;

/// Runs `f` for each position, in parallel when the list is large enough.
pub(crate) fn for_each_maybe_par<const D: usize>(
    positions: &[VecD<i32, D>],
    f: impl Fn(VecD<i32, D>) + Send + Sync,
) where
    VecD<i32, D>: Send + Sync,
{
    if positions.len() >= PAR_MIN_CHILDREN {
        positions.par_iter().for_each(|&pos| f(pos));
    } else {
        for &pos in positions {
            f(pos);
        }
    }
}

/// Addressing arithmetic shared by the partitioned containers.
///
/// Child coordinates are zero-based: child `(0, …)` starts at the global
/// `offset`, and a leaf position maps to `(child, leaf-in-child)` by
/// division and remainder on `pos − offset`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct PartitionLayout<const D: usize> {
    size: VecD<u32, D>,
    offset: VecD<i32, D>,
    child_size: VecD<i32, D>,
    children_size: VecD<u32, D>,
}

impl<const D: usize> PartitionLayout<D> {
    /// Constructs a layout covering `size` leaves from `offset` with
    /// partitions of `child_size`. The children grid is `ceil(size /
    /// child_size)` wide, so edge children may overhang the global bounds.
    #[must_use]
    pub fn new(size: VecD<u32, D>, offset: VecD<i32, D>, child_size: VecD<i32, D>) -> Self {
        let children_size = VecD::from_fn(|i| (size[i] + child_size[i] as u32 - 1) / child_size[i] as u32);
        Self {
            size,
            offset,
            child_size,
            children_size,
        }
    }

    /// Global leaf size.
    #[must_use]
    pub const fn size(&self) -> VecD<u32, D> {
        self.size
    }

    /// Global leaf offset.
    #[must_use]
    pub const fn offset(&self) -> VecD<i32, D> {
        self.offset
    }

    /// Size of one partition.
    #[must_use]
    pub const fn child_size(&self) -> VecD<i32, D> {
        self.child_size
    }

    /// Size of the children grid.
    #[must_use]
    pub const fn children_size(&self) -> VecD<u32, D> {
        self.children_size
    }

    /// Number of children.
    #[must_use]
    pub fn num_children(&self) -> usize {
        self.children_size.area()
    }

    /// Returns `true` if the leaf position is inside the global bounds.
    #[must_use]
    pub fn inside(&self, pos: VecD<i32, D>) -> bool {
        (0..D).all(|i| {
            let p = pos[i] - self.offset[i];
            p >= 0 && p < self.size[i] as i32
        })
    }

    /// Returns `true` if the real-valued position is inside the global bounds.
    #[must_use]
    pub fn inside_f32(&self, pos: VecD<f32, D>) -> bool {
        (0..D).all(|i| {
            let p = pos[i] - self.offset[i] as f32;
            p >= 0.0 && p < self.size[i] as f32
        })
    }

    /// Child coordinate containing the leaf position.
    #[must_use]
    pub fn pos_child(&self, pos: VecD<i32, D>) -> VecD<i32, D> {
        (pos - self.offset).cwise_div(self.child_size)
    }

    /// Flat index of a child coordinate.
    #[must_use]
    pub fn child_index(&self, pos_child: VecD<i32, D>) -> usize {
        ravel(pos_child, self.children_size, VecD::splat(0))
    }

    /// Child coordinate of a flat child index.
    #[must_use]
    pub fn child_position(&self, index: usize) -> VecD<i32, D> {
        unravel(index, self.children_size, VecD::splat(0))
    }

    /// Leaf offset of a child's box.
    #[must_use]
    pub fn child_offset(&self, pos_child: VecD<i32, D>) -> VecD<i32, D> {
        self.offset + pos_child.cwise_mul(self.child_size)
    }
}

/// One partition of a [`PartitionedGrid`]: a lazy tracked leaf grid.
///
/// Inactive children own no buffers and answer every query with their
/// `background` value. Leaf addressing is by flat index within the child.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Child<T, const D: usize, const N: usize> {
    offset: VecD<i32, D>,
    size: VecD<u32, D>,
    background: T,
    data: Option<Vec<T>>,
    lookup: LeafLookup<N>,
}

impl<T: Copy, const D: usize, const N: usize> Child<T, D, N> {
    /// Constructs an inactive child.
    #[must_use]
    pub fn new(size: VecD<u32, D>, offset: VecD<i32, D>, background: T) -> Self {
        Self {
            offset,
            size,
            background,
            data: None,
            lookup: LeafLookup::new(size.area()),
        }
    }

    /// Leaf offset of this child's box.
    #[must_use]
    pub const fn offset(&self) -> VecD<i32, D> {
        self.offset
    }

    /// Leaf size of this child's box.
    #[must_use]
    pub const fn size(&self) -> VecD<u32, D> {
        self.size
    }

    /// Current background value.
    #[must_use]
    pub fn background(&self) -> T {
        self.background
    }

    /// Returns `true` if the buffers are allocated.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.data.is_some()
    }

    /// Allocates the value buffer (filled with the background) and the
    /// lookup cells.
    pub fn activate(&mut self) {
        debug_assert!(self.data.is_none(), "child already active");
        self.data = Some(vec![self.background; self.size.area()]);
        self.lookup.activate();
    }

    /// Frees all buffers and installs `background` as the new background.
    pub fn deactivate(&mut self, background: T) {
        self.background = background;
        self.data = None;
        self.lookup.deactivate();
    }

    /// Flat leaf index of a global position inside this child.
    #[must_use]
    pub fn index(&self, pos: VecD<i32, D>) -> u32 {
        ravel(pos, self.size, self.offset) as u32
    }

    /// Global position of a flat leaf index.
    #[must_use]
    pub fn position(&self, idx: u32) -> VecD<i32, D> {
        unravel(idx as usize, self.size, self.offset)
    }

    /// Value at a flat leaf index; the background when inactive.
    #[must_use]
    pub fn get(&self, idx: u32) -> T {
        self.data
            .as_ref()
            .map_or(self.background, |data| data[idx as usize])
    }

    /// Value at a global position; the background when inactive.
    #[must_use]
    pub fn get_pos(&self, pos: VecD<i32, D>) -> T {
        self.data
            .as_ref()
            .map_or(self.background, |data| data[self.index(pos) as usize])
    }

    /// Sets the value at a flat leaf index. The child must be active.
    pub fn set(&mut self, idx: u32, value: T) {
        self.data.as_mut().expect("child not active")[idx as usize] = value;
    }

    /// Tracking list `k`, as flat leaf indices.
    #[must_use]
    pub fn list(&self, k: usize) -> &[u32] {
        self.lookup.list(k)
    }

    /// Returns `true` if every tracking list is empty.
    #[must_use]
    pub fn all_empty(&self) -> bool {
        self.lookup.all_empty()
    }

    /// Returns `true` if the leaf index is tracked in any list.
    #[must_use]
    pub fn is_tracked(&self, idx: u32) -> bool {
        self.lookup.is_tracked(idx)
    }

    /// Writes `value` and tracks the leaf in list `k`. The child must be
    /// active.
    pub fn track(&mut self, value: T, idx: u32, k: usize) -> bool {
        self.set(idx, value);
        self.lookup.track(idx, k)
    }

    /// Restores `background` at the leaf and removes it from list `k`.
    pub fn untrack(&mut self, background: T, idx: u32, k: usize) {
        if self.data.is_some() {
            self.set(idx, background);
        }
        self.lookup.untrack(idx, k);
    }

    /// Moves the leaf from list `from` to list `to`, keeping its value.
    pub fn retrack(&mut self, idx: u32, from: usize, to: usize) {
        self.lookup.retrack(idx, from, to);
    }

    /// Restores the background for every leaf in list `k` and clears it.
    pub fn reset(&mut self, k: usize) {
        if let Some(data) = self.data.as_mut() {
            for &idx in self.lookup.list(k) {
                data[idx as usize] = self.background;
            }
        }
        self.lookup.reset(k);
    }
}

/// A mask describing which children another partitioned container considers
/// live — used to keep paired partitions from being created and destroyed in
/// lock-step.
pub trait PartitionMask<const D: usize> {
    /// Returns `true` if the mask tracks the child in any list.
    fn is_child_tracked(&self, pos_child: VecD<i32, D>) -> bool;

    /// Snapshot of the mask's child positions for list `k`.
    fn child_list(&self, k: usize) -> Vec<VecD<i32, D>>;
}

/// A spatially partitioned tracked grid of `T` with `N` tracking lists.
///
/// The parent lookup tracks, per list, which children hold tracked points of
/// that list; the per-list pairing is exact — a child appears in parent list
/// `k` iff its own list `k` is non-empty.
#[derive(Debug)]
pub struct PartitionedGrid<T, const D: usize, const N: usize> {
    layout: PartitionLayout<D>,
    dx: f32,
    background: T,
    children: Vec<RwLock<Child<T, D, N>>>,
    lookup: RwLock<MultiLookup<D, N>>,
}

impl<T: Copy, const D: usize, const N: usize> PartitionedGrid<T, D, N> {
    /// Constructs a fully-inactive partitioned grid.
    #[must_use]
    pub fn new(
        size: VecD<u32, D>,
        offset: VecD<i32, D>,
        child_size: VecD<i32, D>,
        background: T,
    ) -> Self {
        let layout = PartitionLayout::new(size, offset, child_size);
        let children = (0..layout.num_children())
            .map(|index| {
                let pos_child = layout.child_position(index);
                RwLock::new(Child::new(
                    child_size.to_u32(),
                    layout.child_offset(pos_child),
                    background,
                ))
            })
            .collect();
        Self {
            layout,
            dx: 1.0,
            background,
            children,
            lookup: RwLock::new(MultiLookup::new(layout.children_size(), VecD::splat(0))),
        }
    }

    /// The addressing layout.
    #[must_use]
    pub const fn layout(&self) -> &PartitionLayout<D> {
        &self.layout
    }

    /// Grid spacing used by the finite-difference operators.
    #[must_use]
    pub const fn dx(&self) -> f32 {
        self.dx
    }

    /// Sets the grid spacing.
    pub fn set_dx(&mut self, dx: f32) {
        self.dx = dx;
    }

    /// The grid-level background (the value of never-touched space).
    #[must_use]
    pub fn background(&self) -> T {
        self.background
    }

    /// Read access to the child at a flat index.
    #[must_use]
    pub fn child(&self, index: usize) -> RwLockReadGuard<'_, Child<T, D, N>> {
        self.children[index].read().unwrap()
    }

    /// Write access to the child at a flat index.
    #[must_use]
    pub fn child_mut(&self, index: usize) -> RwLockWriteGuard<'_, Child<T, D, N>> {
        self.children[index].write().unwrap()
    }

    /// Snapshot of the parent tracking list `k` (child positions).
    #[must_use]
    pub fn children_in(&self, k: usize) -> Vec<VecD<i32, D>> {
        self.lookup.read().unwrap().list(k).to_vec()
    }

    /// Number of children in the parent tracking list `k`.
    #[must_use]
    pub fn children_in_len(&self, k: usize) -> usize {
        self.lookup.read().unwrap().list(k).len()
    }

    /// Returns `true` if the child is tracked in parent list `k`.
    #[must_use]
    pub fn is_child_tracked_in(&self, pos_child: VecD<i32, D>, k: usize) -> bool {
        self.lookup.read().unwrap().is_tracked(pos_child, k)
    }

    /// Value at a global position.
    ///
    /// Inactive children answer with their background. Out-of-bounds reads
    /// panic in debug builds and return the grid background in release.
    #[must_use]
    pub fn get(&self, pos: VecD<i32, D>) -> T {
        debug_assert!(
            self.layout.inside(pos),
            "{}",
            crate::error::PrecondViolation::at(
                crate::error::PrecondKind::OutOfBounds,
                pos,
                format!(
                    "grid of size {:?} at offset {:?}",
                    self.layout.size().0,
                    self.layout.offset().0
                ),
            )
        );
        if !self.layout.inside(pos) {
            return self.background;
        }
        let index = self.layout.child_index(self.layout.pos_child(pos));
        self.child(index).get_pos(pos)
    }

    /// Value at a global position, or the grid background when out of
    /// bounds. Never panics; used by samplers that probe near the boundary.
    #[must_use]
    pub fn get_or_background(&self, pos: VecD<i32, D>) -> T {
        if !self.layout.inside(pos) {
            return self.background;
        }
        let index = self.layout.child_index(self.layout.pos_child(pos));
        self.child(index).get_pos(pos)
    }

    /// Sets the value at a global position of an already-active child,
    /// without touching tracking state.
    pub fn set(&self, pos: VecD<i32, D>, value: T) {
        let index = self.layout.child_index(self.layout.pos_child(pos));
        let mut child = self.child_mut(index);
        let idx = child.index(pos);
        child.set(idx, value);
    }

    /// Ensures the child containing `pos_child` is active and tracked in
    /// parent list `k`.
    ///
    /// Thread safe: the parent lock is taken for the slow path only, and is
    /// released before returning.
    pub fn track_child(&self, pos_child: VecD<i32, D>, k: usize) {
        if self.lookup.read().unwrap().is_tracked(pos_child, k) {
            return;
        }
        let mut lookup = self.lookup.write().unwrap();
        // Re-check under the write lock; another thread may have won.
        if lookup.is_tracked(pos_child, k) {
            return;
        }
        let index = self.layout.child_index(pos_child);
        {
            let mut child = self.children[index].write().unwrap();
            if !child.is_active() {
                child.activate();
            }
        }
        lookup.track(pos_child, k);
    }

    /// Writes `value` at `pos` and tracks it in list `k`, activating and
    /// parent-tracking the containing child as needed. Thread safe.
    pub fn track(&self, value: T, pos: VecD<i32, D>, k: usize) -> bool {
        let pos_child = self.layout.pos_child(pos);
        self.track_child(pos_child, k);
        let index = self.layout.child_index(pos_child);
        let mut child = self.children[index].write().unwrap();
        let idx = child.index(pos);
        child.track(value, idx, k)
    }

    /// Removes `pos` from list `k`, restoring `background` at the point.
    ///
    /// If the child's list `k` empties, the child leaves parent list `k`;
    /// if every list is empty it deactivates with `background` as its new
    /// background value.
    pub fn untrack(&self, background: T, pos: VecD<i32, D>, k: usize) {
        let pos_child = self.layout.pos_child(pos);
        let index = self.layout.child_index(pos_child);
        let (list_empty, all_empty) = {
            let mut child = self.children[index].write().unwrap();
            let idx = child.index(pos);
            child.untrack(background, idx, k);
            (child.list(k).is_empty(), child.all_empty())
        };
        if !list_empty {
            return;
        }
        let mut lookup = self.lookup.write().unwrap();
        lookup.untrack(pos_child, k);
        if all_empty && !lookup.is_tracked_any(pos_child) {
            self.children[index].write().unwrap().deactivate(background);
        }
    }

    /// Moves `pos` from list `from` to list `to`, preserving its value and
    /// keeping the parent lists paired with the child lists.
    pub fn retrack(&self, pos: VecD<i32, D>, from: usize, to: usize) {
        let pos_child = self.layout.pos_child(pos);
        let index = self.layout.child_index(pos_child);
        let from_empty = {
            let mut child = self.children[index].write().unwrap();
            let idx = child.index(pos);
            child.retrack(idx, from, to);
            child.list(from).is_empty()
        };
        self.track_child(pos_child, to);
        if from_empty {
            self.lookup.write().unwrap().untrack(pos_child, from);
        }
    }

    /// Activates and parent-tracks, per list, every child the mask tracks —
    /// "opens" a working area before a parallel write phase.
    pub fn track_children(&self, mask: &impl PartitionMask<D>) {
        for k in 0..N {
            for pos_child in mask.child_list(k) {
                self.track_child(pos_child, k);
            }
        }
    }

    /// Resets every tracking list against a mask: children the mask still
    /// tracks are kept allocated with their backgrounds restored; children
    /// it does not are untracked and deactivated.
    pub fn reset(&self, mask: &impl PartitionMask<D>) {
        for k in 0..N {
            let tracked = self.children_in(k);
            for pos_child in tracked {
                let index = self.layout.child_index(pos_child);
                if !mask.is_child_tracked(pos_child) {
                    let mut lookup = self.lookup.write().unwrap();
                    lookup.untrack(pos_child, k);
                    if !lookup.is_tracked_any(pos_child) {
                        let mut child = self.children[index].write().unwrap();
                        let background = child.background();
                        child.deactivate(background);
                    }
                }
                let mut child = self.children[index].write().unwrap();
                if child.is_active() {
                    child.reset(k);
                } else {
                    child.lookup.reset(k);
                }
            }
        }
    }

    /// Sum of tracked points over every child list `k`.
    #[must_use]
    pub fn leaf_count(&self, k: usize) -> usize {
        self.children_in(k)
            .into_iter()
            .map(|pos_child| self.child(self.layout.child_index(pos_child)).list(k).len())
            .sum()
    }

    /// Global positions of every point tracked in list `k`.
    #[must_use]
    pub fn leaf_positions(&self, k: usize) -> Vec<VecD<i32, D>> {
        let mut out = Vec::new();
        for pos_child in self.children_in(k) {
            let child = self.child(self.layout.child_index(pos_child));
            out.extend(child.list(k).iter().map(|&idx| child.position(idx)));
        }
        out
    }
}

impl<T: Copy, const D: usize, const N: usize> PartitionMask<D> for PartitionedGrid<T, D, N> {
    fn is_child_tracked(&self, pos_child: VecD<i32, D>) -> bool {
        self.lookup.read().unwrap().is_tracked_any(pos_child)
    }

    fn child_list(&self, k: usize) -> Vec<VecD<i32, D>> {
        self.children_in(k)
    }
}

/// Owned wire image of a [`PartitionedGrid`]: a header, the per-child
/// records (active flag, box, background, raw values, lists) and the
/// parent lookup.
#[derive(Deserialize, Serialize)]
struct GridImage<T, const D: usize, const N: usize> {
    size: VecD<u32, D>,
    offset: VecD<i32, D>,
    child_size: VecD<i32, D>,
    num_lists: u32,
    dx: f32,
    background: T,
    children: Vec<Child<T, D, N>>,
    lookup: MultiLookup<D, N>,
}

impl<T: Copy + Serialize, const D: usize, const N: usize> Serialize for PartitionedGrid<T, D, N> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let image = GridImage::<T, D, N> {
            size: self.layout.size(),
            offset: self.layout.offset(),
            child_size: self.layout.child_size(),
            num_lists: N as u32,
            dx: self.dx,
            background: self.background,
            children: self
                .children
                .iter()
                .map(|child| child.read().unwrap().clone())
                .collect(),
            lookup: self.lookup.read().unwrap().clone(),
        };
        image.serialize(serializer)
    }
}

impl<'de, T, const D: usize, const N: usize> Deserialize<'de> for PartitionedGrid<T, D, N>
where
    T: Copy + Deserialize<'de>,
{
    fn deserialize<De: serde::Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        let image = GridImage::<T, D, N>::deserialize(deserializer)?;
        if image.num_lists != N as u32 {
            return Err(serde::de::Error::custom(format!(
                "grid tracks {} lists, expected {N}",
                image.num_lists
            )));
        }
        let layout = PartitionLayout::new(image.size, image.offset, image.child_size);
        if image.children.len() != layout.num_children() {
            return Err(serde::de::Error::custom(format!(
                "grid holds {} children, layout requires {}",
                image.children.len(),
                layout.num_children()
            )));
        }
        Ok(Self {
            layout,
            dx: image.dx,
            background: image.background,
            children: image.children.into_iter().map(RwLock::new).collect(),
            lookup: RwLock::new(image.lookup),
        })
    }
}

/// A spatially partitioned lookup with no value storage — tracking lists
/// only. Used for the affected-point and dirty-cube bookkeeping grids.
#[derive(Debug)]
pub struct PartitionedLookup<const D: usize, const N: usize> {
    layout: PartitionLayout<D>,
    children: Vec<RwLock<LeafLookup<N>>>,
    lookup: RwLock<MultiLookup<D, N>>,
}

impl<const D: usize, const N: usize> PartitionedLookup<D, N> {
    /// Constructs a fully-inactive partitioned lookup.
    #[must_use]
    pub fn new(size: VecD<u32, D>, offset: VecD<i32, D>, child_size: VecD<i32, D>) -> Self {
        let layout = PartitionLayout::new(size, offset, child_size);
        let children = (0..layout.num_children())
            .map(|_| RwLock::new(LeafLookup::new(child_size.to_u32().area())))
            .collect();
        Self {
            layout,
            children,
            lookup: RwLock::new(MultiLookup::new(layout.children_size(), VecD::splat(0))),
        }
    }

    /// The addressing layout.
    #[must_use]
    pub const fn layout(&self) -> &PartitionLayout<D> {
        &self.layout
    }

    /// Read access to the child lookup at a flat index.
    #[must_use]
    pub fn child(&self, index: usize) -> RwLockReadGuard<'_, LeafLookup<N>> {
        self.children[index].read().unwrap()
    }

    /// Flat leaf index of `pos` within its child.
    #[must_use]
    pub fn leaf_index(&self, pos: VecD<i32, D>) -> u32 {
        let pos_child = self.layout.pos_child(pos);
        ravel(
            pos,
            self.layout.child_size().to_u32(),
            self.layout.child_offset(pos_child),
        ) as u32
    }

    /// Global position of a flat leaf index within the child at `pos_child`.
    #[must_use]
    pub fn leaf_position(&self, pos_child: VecD<i32, D>, idx: u32) -> VecD<i32, D> {
        unravel(
            idx as usize,
            self.layout.child_size().to_u32(),
            self.layout.child_offset(pos_child),
        )
    }

    /// Snapshot of the parent tracking list `k` (child positions).
    #[must_use]
    pub fn children_in(&self, k: usize) -> Vec<VecD<i32, D>> {
        self.lookup.read().unwrap().list(k).to_vec()
    }

    /// Tracks `pos` in list `k`, activating the child as needed.
    ///
    /// Returns `false` if the point was already tracked (in any list).
    /// Thread safe; rejects duplicates, which is what makes it usable as a
    /// de-dupe grid for neighbourhood queries.
    pub fn track(&self, pos: VecD<i32, D>, k: usize) -> bool {
        let pos_child = self.layout.pos_child(pos);
        let index = self.layout.child_index(pos_child);
        self.track_child(pos_child, k);
        let mut child = self.children[index].write().unwrap();
        child.track(self.leaf_index(pos), k)
    }

    /// Ensures the child is active and tracked in parent list `k`.
    pub fn track_child(&self, pos_child: VecD<i32, D>, k: usize) {
        if self.lookup.read().unwrap().is_tracked(pos_child, k) {
            return;
        }
        let mut lookup = self.lookup.write().unwrap();
        if lookup.is_tracked(pos_child, k) {
            return;
        }
        let index = self.layout.child_index(pos_child);
        {
            let mut child = self.children[index].write().unwrap();
            if !child.is_active() {
                child.activate();
            }
        }
        lookup.track(pos_child, k);
    }

    /// Returns `true` if `pos` is tracked in any list.
    #[must_use]
    pub fn is_tracked(&self, pos: VecD<i32, D>) -> bool {
        let index = self.layout.child_index(self.layout.pos_child(pos));
        self.child(index).is_tracked(self.leaf_index(pos))
    }

    /// Removes the child from parent list `k`, deactivating it when no list
    /// tracks it any more.
    pub fn untrack_child(&self, pos_child: VecD<i32, D>, k: usize) {
        let mut lookup = self.lookup.write().unwrap();
        lookup.untrack(pos_child, k);
        if !lookup.is_tracked_any(pos_child) {
            let index = self.layout.child_index(pos_child);
            self.children[index].write().unwrap().deactivate();
        }
    }

    /// Unconditionally clears every list and deactivates every child.
    pub fn clear(&self) {
        let mut lookup = self.lookup.write().unwrap();
        for k in 0..N {
            let tracked: Vec<VecD<i32, D>> = lookup.list(k).to_vec();
            for pos_child in tracked {
                lookup.untrack(pos_child, k);
                let index = self.layout.child_index(pos_child);
                self.children[index].write().unwrap().deactivate();
            }
        }
    }

    /// Resets every tracking list against a mask, deactivating children the
    /// mask no longer tracks.
    pub fn reset(&self, mask: &impl PartitionMask<D>) {
        for k in 0..N {
            let tracked = self.children_in(k);
            for pos_child in tracked {
                let index = self.layout.child_index(pos_child);
                if !mask.is_child_tracked(pos_child) {
                    let mut lookup = self.lookup.write().unwrap();
                    lookup.untrack(pos_child, k);
                    if !lookup.is_tracked_any(pos_child) {
                        self.children[index].write().unwrap().deactivate();
                        continue;
                    }
                }
                self.children[index].write().unwrap().reset(k);
            }
        }
    }

    /// Sum of tracked points over every child list `k`.
    #[must_use]
    pub fn leaf_count(&self, k: usize) -> usize {
        self.children_in(k)
            .into_iter()
            .map(|pos_child| self.child(self.layout.child_index(pos_child)).list(k).len())
            .sum()
    }
}

impl<const D: usize, const N: usize> PartitionMask<D> for PartitionedLookup<D, N> {
    fn is_child_tracked(&self, pos_child: VecD<i32, D>) -> bool {
        self.lookup.read().unwrap().is_tracked_any(pos_child)
    }

    fn child_list(&self, k: usize) -> Vec<VecD<i32, D>> {
        self.children_in(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_addressing() {
        let layout = PartitionLayout::<2>::new(VecD([16, 16]), VecD([-8, -8]), VecD([8, 8]));
        assert_eq!(layout.children_size(), VecD([2, 2]));
        assert_eq!(layout.pos_child(VecD([-8, -8])), VecD([0, 0]));
        assert_eq!(layout.pos_child(VecD([-1, -1])), VecD([0, 0]));
        assert_eq!(layout.pos_child(VecD([0, 0])), VecD([1, 1]));
        assert_eq!(layout.pos_child(VecD([7, -8])), VecD([1, 0]));
        assert_eq!(layout.child_offset(VecD([1, 1])), VecD([0, 0]));
        assert_eq!(layout.child_offset(VecD([0, 0])), VecD([-8, -8]));
    }

    #[test]
    fn layout_rounds_children_up() {
        let layout = PartitionLayout::<2>::new(VecD([15, 15]), VecD([-7, -7]), VecD([4, 4]));
        assert_eq!(layout.children_size(), VecD([4, 4]));
        assert_eq!(layout.pos_child(VecD([7, 7])), VecD([3, 3]));
    }

    #[test]
    fn track_activates_child() {
        let grid = PartitionedGrid::<f32, 2, 5>::new(VecD([16, 16]), VecD([-8, -8]), VecD([8, 8]), 3.0);

        // Untouched space reads the background without allocating.
        assert_eq!(grid.get(VecD([0, 0])), 3.0);
        assert!(!grid.child(0).is_active());

        assert!(grid.track(0.0, VecD([0, 0]), 2));
        let pos_child = grid.layout().pos_child(VecD([0, 0]));
        assert!(grid.child(grid.layout().child_index(pos_child)).is_active());
        assert!(grid.is_child_tracked_in(pos_child, 2));
        assert_eq!(grid.get(VecD([0, 0])), 0.0);
        // The rest of the activated child is background-filled.
        assert_eq!(grid.get(VecD([1, 1])), 3.0);
        // Other children stay inactive.
        assert!(!grid.child(0).is_active());
    }

    #[test]
    fn untrack_deactivates_empty_child() {
        let grid = PartitionedGrid::<f32, 2, 5>::new(VecD([16, 16]), VecD([-8, -8]), VecD([8, 8]), 3.0);
        grid.track(0.0, VecD([0, 0]), 2);
        grid.track(1.0, VecD([1, 0]), 3);

        grid.untrack(3.0, VecD([0, 0]), 2);
        let pos_child = grid.layout().pos_child(VecD([0, 0]));
        // Still active: list 3 holds a point.
        assert!(grid.child(grid.layout().child_index(pos_child)).is_active());
        assert!(!grid.is_child_tracked_in(pos_child, 2));
        assert!(grid.is_child_tracked_in(pos_child, 3));

        // Removing the last point deactivates and installs the new background.
        grid.untrack(-3.0, VecD([1, 0]), 3);
        assert!(!grid.child(grid.layout().child_index(pos_child)).is_active());
        assert!(!grid.is_child_tracked_in(pos_child, 3));
        assert_eq!(grid.get(VecD([0, 0])), -3.0);
    }

    #[test]
    fn retrack_moves_between_lists() {
        let grid = PartitionedGrid::<f32, 2, 5>::new(VecD([16, 16]), VecD([-8, -8]), VecD([8, 8]), 3.0);
        grid.track(0.4, VecD([0, 0]), 2);

        grid.retrack(VecD([0, 0]), 2, 3);
        assert_eq!(grid.get(VecD([0, 0])), 0.4);
        let pos_child = grid.layout().pos_child(VecD([0, 0]));
        assert!(!grid.is_child_tracked_in(pos_child, 2));
        assert!(grid.is_child_tracked_in(pos_child, 3));
        assert_eq!(grid.leaf_count(3), 1);
    }

    #[test]
    fn reset_respects_mask() {
        let mask = PartitionedGrid::<f32, 2, 5>::new(VecD([16, 16]), VecD([-8, -8]), VecD([8, 8]), 3.0);
        let grid = PartitionedGrid::<f32, 2, 5>::new(VecD([16, 16]), VecD([-8, -8]), VecD([8, 8]), 0.0);

        // Mask holds a point in the (1, 1) child only.
        mask.track(0.0, VecD([0, 0]), 2);

        grid.track(0.5, VecD([0, 0]), 2);
        grid.track(0.7, VecD([-8, -8]), 2);

        grid.reset(&mask);

        // Child under the mask stays allocated, values restored.
        let kept = grid.layout().child_index(grid.layout().pos_child(VecD([0, 0])));
        assert!(grid.child(kept).is_active());
        assert_eq!(grid.get(VecD([0, 0])), 0.0);
        assert_eq!(grid.leaf_count(2), 0);

        // Child outside the mask is deallocated.
        let dropped = grid.layout().child_index(grid.layout().pos_child(VecD([-8, -8])));
        assert!(!grid.child(dropped).is_active());
    }

    #[test]
    fn partitioned_lookup_dedupes() {
        let lookup = PartitionedLookup::<2, 5>::new(VecD([16, 16]), VecD([-8, -8]), VecD([8, 8]));
        assert!(lookup.track(VecD([3, 3]), 1));
        assert!(!lookup.track(VecD([3, 3]), 1));
        assert!(!lookup.track(VecD([3, 3]), 2));
        assert!(lookup.is_tracked(VecD([3, 3])));
        assert_eq!(lookup.leaf_count(1), 1);
        assert_eq!(lookup.children_in(1).len(), 1);
    }

    #[test]
    fn leaf_positions_round_trip() {
        let grid = PartitionedGrid::<f32, 3, 5>::new(
            VecD([9, 9, 9]),
            VecD([-4, -4, -4]),
            VecD([3, 3, 3]),
            3.0,
        );
        let points = [VecD([0, 0, 0]), VecD([-4, 2, 3]), VecD([4, 4, 4])];
        for &pos in &points {
            grid.track(1.0, pos, 0);
        }
        let mut positions = grid.leaf_positions(0);
        positions.sort_by_key(|p| (p[0], p[1], p[2]));
        let mut expected = points.to_vec();
        expected.sort_by_key(|p| (p[0], p[1], p[2]));
        assert_eq!(positions, expected);
    }
}
