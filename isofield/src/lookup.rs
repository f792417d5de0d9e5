//! Bidirectional maps between grid cells and tracking lists.
//!
//! A lookup grid stores, at each cell, the index of that cell's entry in one
//! of `N` tracking lists, while each list stores the cells it contains. The
//! invariant is symmetric: `cell(pos)[k] = j ⇔ list(k)[j] = pos`. Insertion
//! is push-back; removal swaps the last entry into the hole and patches the
//! swapped cell's index, so list order is not stable across removals.
//!
//! Two variants exist. [`MultiLookup`] keeps an `N`-tuple per cell so a cell
//! can be active in several lists at once — used at the partition level,
//! where one child holds points of many narrow-band layers.
//! [`LeafLookup`] keeps a single index per cell (the caller knows which
//! list) over flat leaf indices, and its cell buffer is lazily allocated —
//! used inside partition children.

use crate::grid::Grid;
use crate::vector::VecD;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;

/// Index value meaning "not in any list".
pub const NULL_IDX: u32 = u32::MAX;

/// A fixed-size bundle of `N` tracking lists.
#[derive(Clone, Debug)]
pub struct Lists<T, const N: usize>(pub [Vec<T>; N]);

impl<T, const N: usize> Default for Lists<T, N> {
    fn default() -> Self {
        Self(std::array::from_fn(|_| Vec::new()))
    }
}

impl<T, const N: usize> Lists<T, N> {
    /// Returns `true` if every list is empty.
    #[must_use]
    pub fn all_empty(&self) -> bool {
        self.0.iter().all(Vec::is_empty)
    }

    /// Clears every list and releases its storage.
    pub fn clear_shrink(&mut self) {
        for list in &mut self.0 {
            list.clear();
            list.shrink_to_fit();
        }
    }
}

impl<T: Serialize, const N: usize> Serialize for Lists<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(N)?;
        for list in &self.0 {
            tuple.serialize_element(list)?;
        }
        tuple.end()
    }
}

impl<'de, T: Deserialize<'de>, const N: usize> Deserialize<'de> for Lists<T, N> {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        struct ListsVisitor<T, const N: usize>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>, const N: usize> Visitor<'de> for ListsVisitor<T, N> {
            type Value = Lists<T, N>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a tuple of {N} lists")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut lists = Lists::default();
                for (i, list) in lists.0.iter_mut().enumerate() {
                    *list = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(lists)
            }
        }

        deserializer.deserialize_tuple(N, ListsVisitor(PhantomData))
    }
}

/// A multi-index lookup grid: each cell may be active in up to `N` lists
/// simultaneously.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MultiLookup<const D: usize, const N: usize> {
    cells: Grid<VecD<u32, N>, D>,
    lists: Lists<VecD<i32, D>, N>,
}

impl<const D: usize, const N: usize> MultiLookup<D, N> {
    /// Constructs a lookup grid with every cell untracked.
    #[must_use]
    pub fn new(size: VecD<u32, D>, offset: VecD<i32, D>) -> Self {
        Self {
            cells: Grid::new(size, offset, VecD::splat(NULL_IDX)),
            lists: Lists::default(),
        }
    }

    /// Returns the tracking list with id `k`.
    #[must_use]
    pub fn list(&self, k: usize) -> &[VecD<i32, D>] {
        &self.lists.0[k]
    }

    /// Returns `true` if `pos` is tracked in list `k`.
    #[must_use]
    pub fn is_tracked(&self, pos: VecD<i32, D>, k: usize) -> bool {
        self.cells.get(pos)[k] != NULL_IDX
    }

    /// Returns `true` if `pos` is tracked in any list.
    #[must_use]
    pub fn is_tracked_any(&self, pos: VecD<i32, D>) -> bool {
        self.cells.get(pos).iter().any(|&idx| idx != NULL_IDX)
    }

    /// Adds `pos` to list `k`, storing its list index in the cell.
    ///
    /// Returns `false` without modification if already tracked in `k`.
    pub fn track(&mut self, pos: VecD<i32, D>, k: usize) -> bool {
        let mut indices = self.cells.get(pos);
        if indices[k] != NULL_IDX {
            return false;
        }
        indices[k] = self.lists.0[k].len() as u32;
        self.cells.set(pos, indices);
        self.lists.0[k].push(pos);
        true
    }

    /// Removes `pos` from list `k` by swapping the last entry into its slot.
    ///
    /// No-op if `pos` is not tracked in `k`.
    pub fn untrack(&mut self, pos: VecD<i32, D>, k: usize) {
        let mut indices = self.cells.get(pos);
        let idx = indices[k];
        if idx == NULL_IDX {
            return;
        }
        indices[k] = NULL_IDX;
        self.cells.set(pos, indices);

        let list = &mut self.lists.0[k];
        let last = list.len() - 1;
        if (idx as usize) < last {
            let moved = list[last];
            list[idx as usize] = moved;
            let mut moved_indices = self.cells.get(moved);
            moved_indices[k] = idx;
            self.cells.set(moved, moved_indices);
        }
        list.pop();
    }

    /// Clears list `k` and nulls the index of each of its cells.
    pub fn reset(&mut self, k: usize) {
        let list = std::mem::take(&mut self.lists.0[k]);
        for pos in &list {
            let mut indices = self.cells.get(*pos);
            indices[k] = NULL_IDX;
            self.cells.set(*pos, indices);
        }
        // Keep the allocation for the next round.
        let mut list = list;
        list.clear();
        self.lists.0[k] = list;
    }
}

/// A lazily-allocated single-index lookup over flat leaf indices.
///
/// A cell is active in at most one of the `N` lists at a time; the list id
/// is not stored per cell — the caller always knows it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LeafLookup<const N: usize> {
    len: u32,
    cells: Option<Vec<u32>>,
    lists: Lists<u32, N>,
}

impl<const N: usize> LeafLookup<N> {
    /// Constructs an inactive lookup over `len` cells.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            len: len as u32,
            cells: None,
            lists: Lists::default(),
        }
    }

    /// Returns `true` if the cell buffer is allocated.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.cells.is_some()
    }

    /// Allocates the cell buffer, all cells untracked.
    pub fn activate(&mut self) {
        debug_assert!(self.cells.is_none(), "lookup already active");
        self.cells = Some(vec![NULL_IDX; self.len as usize]);
    }

    /// Frees the cell buffer and all lists.
    pub fn deactivate(&mut self) {
        self.cells = None;
        self.lists.clear_shrink();
    }

    /// Returns the tracking list with id `k`.
    #[must_use]
    pub fn list(&self, k: usize) -> &[u32] {
        &self.lists.0[k]
    }

    /// Returns `true` if every list is empty.
    #[must_use]
    pub fn all_empty(&self) -> bool {
        self.lists.all_empty()
    }

    /// Returns `true` if leaf `idx` is tracked (in whichever list).
    #[must_use]
    pub fn is_tracked(&self, idx: u32) -> bool {
        self.cells
            .as_ref()
            .is_some_and(|cells| cells[idx as usize] != NULL_IDX)
    }

    /// Adds leaf `idx` to list `k`.
    ///
    /// Returns `false` without modification if the cell is already occupied
    /// (by `k` or any other list).
    pub fn track(&mut self, idx: u32, k: usize) -> bool {
        let cells = self.cells.as_mut().expect("lookup not active");
        if cells[idx as usize] != NULL_IDX {
            return false;
        }
        cells[idx as usize] = self.lists.0[k].len() as u32;
        self.lists.0[k].push(idx);
        true
    }

    /// Removes leaf `idx` from list `k` by swap-with-last.
    ///
    /// No-op if the cell is untracked.
    pub fn untrack(&mut self, idx: u32, k: usize) {
        let Some(cells) = self.cells.as_mut() else {
            return;
        };
        let list_idx = cells[idx as usize];
        if list_idx == NULL_IDX {
            return;
        }
        cells[idx as usize] = NULL_IDX;

        let list = &mut self.lists.0[k];
        let last = list.len() - 1;
        if (list_idx as usize) < last {
            let moved = list[last];
            list[list_idx as usize] = moved;
            cells[moved as usize] = list_idx;
        }
        list.pop();
    }

    /// Moves leaf `idx` from list `from` to list `to`.
    pub fn retrack(&mut self, idx: u32, from: usize, to: usize) {
        self.untrack(idx, from);
        self.track(idx, to);
    }

    /// Clears list `k` and nulls the index of each of its cells.
    pub fn reset(&mut self, k: usize) {
        if let Some(cells) = self.cells.as_mut() {
            for &idx in &self.lists.0[k] {
                cells[idx as usize] = NULL_IDX;
            }
        }
        self.lists.0[k].clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_invariant<const D: usize, const N: usize>(lookup: &MultiLookup<D, N>) {
        for k in 0..N {
            for (j, &pos) in lookup.list(k).iter().enumerate() {
                assert!(lookup.is_tracked(pos, k));
                assert_eq!(lookup.cells.get(pos)[k], j as u32);
            }
        }
    }

    #[test]
    fn multi_track_untrack() {
        let mut lookup = MultiLookup::<2, 3>::new(VecD([9, 9]), VecD([-4, -4]));

        assert!(lookup.track(VecD([0, 0]), 0));
        assert!(lookup.track(VecD([1, 0]), 0));
        assert!(lookup.track(VecD([2, 0]), 0));
        // Duplicate insert is rejected.
        assert!(!lookup.track(VecD([1, 0]), 0));
        // Same cell may join another list.
        assert!(lookup.track(VecD([1, 0]), 2));

        assert_eq!(lookup.list(0), &[VecD([0, 0]), VecD([1, 0]), VecD([2, 0])]);
        assert_eq!(lookup.list(2), &[VecD([1, 0])]);
        assert!(lookup.is_tracked_any(VecD([1, 0])));
        check_invariant(&lookup);

        // Swap-with-last removal: the tail entry takes the hole.
        lookup.untrack(VecD([0, 0]), 0);
        assert_eq!(lookup.list(0), &[VecD([2, 0]), VecD([1, 0])]);
        assert!(!lookup.is_tracked(VecD([0, 0]), 0));
        check_invariant(&lookup);

        // Removing from one list leaves the other untouched.
        lookup.untrack(VecD([1, 0]), 0);
        assert_eq!(lookup.list(0), &[VecD([2, 0])]);
        assert_eq!(lookup.list(2), &[VecD([1, 0])]);
        check_invariant(&lookup);
    }

    #[test]
    fn multi_reset() {
        let mut lookup = MultiLookup::<2, 2>::new(VecD([5, 5]), VecD([0, 0]));
        lookup.track(VecD([1, 1]), 0);
        lookup.track(VecD([2, 2]), 0);
        lookup.track(VecD([3, 3]), 1);

        lookup.reset(0);
        assert!(lookup.list(0).is_empty());
        assert!(!lookup.is_tracked(VecD([1, 1]), 0));
        assert!(!lookup.is_tracked(VecD([2, 2]), 0));
        // Other lists survive a reset.
        assert!(lookup.is_tracked(VecD([3, 3]), 1));
    }

    #[test]
    fn leaf_lifecycle() {
        let mut lookup = LeafLookup::<5>::new(16);
        assert!(!lookup.is_active());
        lookup.activate();
        assert!(lookup.is_active());

        assert!(lookup.track(3, 2));
        assert!(lookup.track(7, 2));
        assert!(lookup.track(9, 4));
        // A cell is active in at most one list.
        assert!(!lookup.track(3, 4));

        assert_eq!(lookup.list(2), &[3, 7]);
        assert_eq!(lookup.list(4), &[9]);
        assert!(lookup.is_tracked(3));
        assert!(!lookup.all_empty());

        lookup.untrack(3, 2);
        assert_eq!(lookup.list(2), &[7]);
        assert!(!lookup.is_tracked(3));

        lookup.retrack(7, 2, 0);
        assert_eq!(lookup.list(2), &[] as &[u32]);
        assert_eq!(lookup.list(0), &[7]);

        lookup.deactivate();
        assert!(!lookup.is_active());
        assert!(lookup.all_empty());
        assert!(!lookup.is_tracked(7));
    }

    #[test]
    fn leaf_swap_with_last_patches_moved_cell() {
        let mut lookup = LeafLookup::<1>::new(8);
        lookup.activate();
        for idx in [0, 2, 4, 6] {
            lookup.track(idx, 0);
        }

        lookup.untrack(2, 0);
        assert_eq!(lookup.list(0), &[0, 6, 4]);
        // The moved entry must still round-trip through its cell.
        lookup.untrack(6, 0);
        assert_eq!(lookup.list(0), &[0, 4]);

        lookup.reset(0);
        assert!(lookup.list(0).is_empty());
        assert!(!lookup.is_tracked(0));
        assert!(!lookup.is_tracked(4));
    }
}
