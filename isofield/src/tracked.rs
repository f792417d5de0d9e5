//! Dense value grid paired with a lookup, mutated and tracked in one step.

use crate::grid::Grid;
use crate::lookup::{Lists, NULL_IDX};
use crate::vector::VecD;
use serde::{Deserialize, Serialize};

/// A dense grid of `T` whose mutated cells are tracked in `N` lists.
///
/// Tracking a cell writes its value and records it in a list; resetting a
/// list restores the background value of exactly the cells it tracked, in
/// O(tracked) rather than O(grid). A cell is tracked in at most one list.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TrackedGrid<T, const D: usize, const N: usize> {
    values: Grid<T, D>,
    cells: Grid<u32, D>,
    lists: Lists<VecD<i32, D>, N>,
    background: T,
}

impl<T: Copy, const D: usize, const N: usize> TrackedGrid<T, D, N> {
    /// Constructs a tracked grid filled with `background`.
    #[must_use]
    pub fn new(size: VecD<u32, D>, offset: VecD<i32, D>, background: T) -> Self {
        Self {
            values: Grid::new(size, offset, background),
            cells: Grid::new(size, offset, NULL_IDX),
            lists: Lists::default(),
            background,
        }
    }

    /// Returns the grid size.
    #[must_use]
    pub const fn size(&self) -> VecD<u32, D> {
        self.values.size()
    }

    /// Returns the spatial offset.
    #[must_use]
    pub const fn offset(&self) -> VecD<i32, D> {
        self.values.offset()
    }

    /// Returns `true` if `pos` lies inside the grid bounds.
    #[must_use]
    pub fn inside(&self, pos: VecD<i32, D>) -> bool {
        self.values.inside(pos)
    }

    /// Value at `pos`.
    #[must_use]
    pub fn get(&self, pos: VecD<i32, D>) -> T {
        self.values.get(pos)
    }

    /// Sets the value at `pos` without touching the tracking state.
    pub fn set(&mut self, pos: VecD<i32, D>, value: T) {
        self.values.set(pos, value);
    }

    /// Returns the tracking list with id `k`.
    #[must_use]
    pub fn list(&self, k: usize) -> &[VecD<i32, D>] {
        &self.lists.0[k]
    }

    /// Returns `true` if `pos` is tracked in any list.
    #[must_use]
    pub fn is_tracked(&self, pos: VecD<i32, D>) -> bool {
        self.cells.get(pos) != NULL_IDX
    }

    /// Sets the value at `pos` and tracks the cell in list `k`.
    ///
    /// Returns `false` if the cell was already tracked (the value is still
    /// written).
    pub fn track(&mut self, pos: VecD<i32, D>, value: T, k: usize) -> bool {
        self.values.set(pos, value);
        if self.cells.get(pos) != NULL_IDX {
            return false;
        }
        self.cells.set(pos, self.lists.0[k].len() as u32);
        self.lists.0[k].push(pos);
        true
    }

    /// Restores `background` at `pos` and removes the cell from list `k`.
    pub fn untrack(&mut self, pos: VecD<i32, D>, background: T, k: usize) {
        self.values.set(pos, background);
        let idx = self.cells.get(pos);
        if idx == NULL_IDX {
            return;
        }
        self.cells.set(pos, NULL_IDX);

        let list = &mut self.lists.0[k];
        let last = list.len() - 1;
        if (idx as usize) < last {
            let moved = list[last];
            list[idx as usize] = moved;
            self.cells.set(moved, idx);
        }
        list.pop();
    }

    /// Moves `pos` from list `from` to list `to`, preserving its value.
    pub fn retrack(&mut self, pos: VecD<i32, D>, from: usize, to: usize) {
        let value = self.values.get(pos);
        self.untrack(pos, value, from);
        self.track(pos, value, to);
    }

    /// Restores the background for every cell in list `k` and clears it.
    pub fn reset(&mut self, k: usize) {
        let list = std::mem::take(&mut self.lists.0[k]);
        for &pos in &list {
            self.values.set(pos, self.background);
            self.cells.set(pos, NULL_IDX);
        }
        let mut list = list;
        list.clear();
        self.lists.0[k] = list;
    }

    /// Resets every list.
    pub fn reset_all(&mut self) {
        for k in 0..N {
            self.reset(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_sets_value_and_list() {
        let mut grid = TrackedGrid::<f32, 2, 3>::new(VecD([5, 5]), VecD([-2, -2]), 3.0);

        assert!(grid.track(VecD([0, 0]), 0.0, 1));
        assert!(grid.track(VecD([1, 0]), 1.0, 2));
        assert_eq!(grid.get(VecD([0, 0])), 0.0);
        assert_eq!(grid.get(VecD([1, 0])), 1.0);
        assert_eq!(grid.list(1), &[VecD([0, 0])]);
        assert_eq!(grid.list(2), &[VecD([1, 0])]);

        // Re-tracking an occupied cell updates the value only.
        assert!(!grid.track(VecD([0, 0]), 0.5, 1));
        assert_eq!(grid.get(VecD([0, 0])), 0.5);
        assert_eq!(grid.list(1).len(), 1);
    }

    #[test]
    fn untrack_restores_background() {
        let mut grid = TrackedGrid::<f32, 2, 1>::new(VecD([5, 5]), VecD([0, 0]), 3.0);
        grid.track(VecD([1, 1]), -1.0, 0);
        grid.track(VecD([2, 2]), -2.0, 0);

        grid.untrack(VecD([1, 1]), 3.0, 0);
        assert_eq!(grid.get(VecD([1, 1])), 3.0);
        assert!(!grid.is_tracked(VecD([1, 1])));
        assert_eq!(grid.list(0), &[VecD([2, 2])]);
    }

    #[test]
    fn retrack_preserves_value() {
        let mut grid = TrackedGrid::<f32, 2, 5>::new(VecD([5, 5]), VecD([0, 0]), 3.0);
        grid.track(VecD([1, 1]), 1.4, 3);

        grid.retrack(VecD([1, 1]), 3, 4);
        assert_eq!(grid.get(VecD([1, 1])), 1.4);
        assert!(grid.list(3).is_empty());
        assert_eq!(grid.list(4), &[VecD([1, 1])]);
    }

    #[test]
    fn reset_restores_only_tracked_cells() {
        let mut grid = TrackedGrid::<i8, 2, 2>::new(VecD([4, 4]), VecD([0, 0]), 9);
        grid.track(VecD([0, 0]), 1, 0);
        grid.track(VecD([1, 1]), 2, 0);
        grid.track(VecD([2, 2]), 3, 1);
        grid.set(VecD([3, 3]), 4);

        grid.reset(0);
        assert_eq!(grid.get(VecD([0, 0])), 9);
        assert_eq!(grid.get(VecD([1, 1])), 9);
        // List 1 and untracked writes are untouched.
        assert_eq!(grid.get(VecD([2, 2])), 3);
        assert_eq!(grid.get(VecD([3, 3])), 4);

        grid.reset_all();
        assert_eq!(grid.get(VecD([2, 2])), 9);
        assert_eq!(grid.get(VecD([3, 3])), 4);
    }
}
