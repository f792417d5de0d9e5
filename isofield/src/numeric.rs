//! Finite-difference and interpolation operators over partitioned grids.
//!
//! Every operator resolves samples through [`PartitionedGrid::get`], so
//! stencils cross partition boundaries transparently. Real-valued sample
//! positions go through D-linear interpolation.

use crate::partition::PartitionedGrid;
use crate::vector::VecD;
use arrayvec::ArrayVec;

impl<const D: usize, const N: usize> PartitionedGrid<f32, D, N> {
    /// Forward difference gradient: `(u(p + eᵢ) − u(p)) / dx` per axis.
    #[must_use]
    pub fn grad_forward(&self, pos: VecD<i32, D>) -> VecD<f32, D> {
        let centre = self.get(pos);
        let mut probe = pos;
        VecD::from_fn(|axis| {
            probe[axis] += 1;
            let forward = self.get(probe);
            probe[axis] -= 1;
            (forward - centre) / self.dx()
        })
    }

    /// Backward difference gradient: `(u(p) − u(p − eᵢ)) / dx` per axis.
    #[must_use]
    pub fn grad_backward(&self, pos: VecD<i32, D>) -> VecD<f32, D> {
        let centre = self.get(pos);
        let mut probe = pos;
        VecD::from_fn(|axis| {
            probe[axis] -= 1;
            let back = self.get(probe);
            probe[axis] += 1;
            (centre - back) / self.dx()
        })
    }

    /// Central difference gradient: `(u(p + eᵢ) − u(p − eᵢ)) / (2·dx)`.
    #[must_use]
    pub fn grad_central(&self, pos: VecD<i32, D>) -> VecD<f32, D> {
        let mut probe = pos;
        VecD::from_fn(|axis| {
            probe[axis] -= 1;
            let back = self.get(probe);
            probe[axis] += 2;
            let forward = self.get(probe);
            probe[axis] -= 1;
            (forward - back) / (2.0 * self.dx())
        })
    }

    /// Central difference gradient at a real-valued position, each axis
    /// sample interpolated.
    #[must_use]
    pub fn grad_central_at(&self, pos: VecD<f32, D>) -> VecD<f32, D> {
        let mut probe = pos;
        VecD::from_fn(|axis| {
            probe[axis] -= 1.0;
            let back = self.interp(probe);
            probe[axis] += 2.0;
            let forward = self.interp(probe);
            probe[axis] -= 1.0;
            (forward - back) / (2.0 * self.dx())
        })
    }

    /// Safe gradient: central where both neighbours are in bounds, else the
    /// one-sided difference with the in-bounds side, else zero.
    #[must_use]
    pub fn grad(&self, pos: VecD<i32, D>) -> VecD<f32, D> {
        let centre = self.get(pos);
        let mut probe = pos;
        VecD::from_fn(|axis| {
            let mut back = centre;
            let mut forward = centre;
            let mut order = 0.0;
            probe[axis] -= 1;
            if self.layout().inside(probe) {
                back = self.get(probe);
                order += 1.0;
            }
            probe[axis] += 2;
            if self.layout().inside(probe) {
                forward = self.get(probe);
                order += 1.0;
            }
            probe[axis] -= 1;
            if order == 0.0 {
                0.0
            } else {
                (forward - back) / (order * self.dx())
            }
        })
    }

    /// Safe gradient at a real-valued position, sampled by interpolation.
    #[must_use]
    pub fn grad_at(&self, pos: VecD<f32, D>) -> VecD<f32, D> {
        let centre = self.interp(pos);
        let mut probe = pos;
        VecD::from_fn(|axis| {
            let mut back = centre;
            let mut forward = centre;
            let mut order = 0.0;
            probe[axis] -= 1.0;
            if self.layout().inside_f32(probe) {
                back = self.interp(probe);
                order += 1.0;
            }
            probe[axis] += 2.0;
            if self.layout().inside_f32(probe) {
                forward = self.interp(probe);
                order += 1.0;
            }
            probe[axis] -= 1.0;
            if order == 0.0 {
                0.0
            } else {
                (forward - back) / (order * self.dx())
            }
        })
    }

    /// Entropy-satisfying upwind gradient:
    /// `(min(u(p) − u(p − eᵢ), 0) + max(u(p + eᵢ) − u(p), 0)) / dx`.
    #[must_use]
    pub fn grad_entropic(&self, pos: VecD<i32, D>) -> VecD<f32, D> {
        let centre = self.get(pos);
        let mut probe = pos;
        VecD::from_fn(|axis| {
            probe[axis] -= 1;
            let back = self.get(probe);
            probe[axis] += 2;
            let forward = self.get(probe);
            probe[axis] -= 1;
            ((centre - back).min(0.0) + (forward - centre).max(0.0)) / self.dx()
        })
    }

    /// Divergence `Σᵢ (gradB − gradF)ᵢ / dx²` — the (negated) Laplacian
    /// stencil.
    #[must_use]
    pub fn divergence(&self, pos: VecD<i32, D>) -> f32 {
        (self.grad_backward(pos) - self.grad_forward(pos)).sum() / (self.dx() * self.dx())
    }

    /// Mean curvature by the difference-of-normals method: half the sum over
    /// axes of the forward minus backward principal normal components, each
    /// normalised against the central differences across the other axes.
    #[must_use]
    pub fn curvature(&self, pos: VecD<i32, D>) -> f32 {
        let centre = self.get(pos);
        let mut probe = pos;

        let mut total = 0.0;
        for axis in 0..D {
            probe[axis] += 1;
            total += self.principal_normal(probe, self.get(probe) - centre, axis);
            probe[axis] -= 1;
        }
        for axis in 0..D {
            probe[axis] -= 1;
            total -= self.principal_normal(probe, centre - self.get(probe), axis);
            probe[axis] += 1;
        }
        total / 2.0
    }

    /// Axial component of the surface normal at `probe`, normalised against
    /// the central differences across the other axes.
    fn principal_normal(&self, probe: VecD<i32, D>, axial: f32, axis: usize) -> f32 {
        let mut cross_sq = 0.0;
        for other in 0..D {
            if other == axis {
                continue;
            }
            let mut neigh = probe;
            neigh[other] -= 1;
            let low = self.get(neigh);
            neigh[other] += 2;
            let high = self.get(neigh);
            let central = (high - low) / 2.0;
            cross_sq += central * central;
        }
        axial / (axial * axial + cross_sq).sqrt()
    }

    /// D-linear interpolation at a real-valued position.
    ///
    /// Gathers the 2^D corner values of the containing cell and reduces one
    /// axis at a time by `high·t + low·(1 − t)`. Corners that fall outside
    /// the grid contribute the background, so sampling right at the boundary
    /// is safe.
    #[must_use]
    pub fn interp(&self, pos: VecD<f32, D>) -> f32 {
        let base = pos.floor_i32();
        let frac = pos - base.to_f32();

        let mut corners: ArrayVec<f32, 8> = ArrayVec::new();
        for i in 0..1_usize << D {
            let corner = VecD::from_fn(|axis| base[axis] + ((i >> axis) & 1) as i32);
            corners.push(self.get_or_background(corner));
        }

        let mut len = corners.len();
        for axis in 0..D {
            let t = frac[axis];
            for pair in 0..len / 2 {
                corners[pair] = corners[2 * pair + 1] * t + corners[2 * pair] * (1.0 - t);
            }
            len /= 2;
        }
        corners[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    /// Builds a 2D grid whose values come from `f`, all tracked in list 0.
    fn grid_from_fn(half: i32, f: impl Fn(i32, i32) -> f32) -> PartitionedGrid<f32, 2, 5> {
        let size = (2 * half + 1) as u32;
        let grid = PartitionedGrid::new(
            VecD([size, size]),
            VecD([-half, -half]),
            VecD([size as i32, size as i32]),
            0.0,
        );
        for x in -half..=half {
            for y in -half..=half {
                grid.track(f(x, y), VecD([x, y]), 0);
            }
        }
        grid
    }

    #[test]
    fn gradients_of_linear_field() {
        let grid = grid_from_fn(3, |x, y| 2.0 * x as f32 - y as f32);
        let pos = VecD([0, 0]);

        assert_eq!(grid.grad_forward(pos), VecD([2.0, -1.0]));
        assert_eq!(grid.grad_backward(pos), VecD([2.0, -1.0]));
        assert_eq!(grid.grad_central(pos), VecD([2.0, -1.0]));
        assert_eq!(grid.grad(pos), VecD([2.0, -1.0]));
        // All differences agree, so the divergence vanishes.
        assert_eq!(grid.divergence(pos), 0.0);
    }

    #[test]
    fn safe_gradient_falls_back_at_edges(){
        let grid = grid_from_fn(2, |x, _| x as f32);
        // At the −x edge only the forward difference is available.
        assert_eq!(grid.grad(VecD([-2, 0])), VecD([1.0, 0.0]));
        assert_eq!(grid.grad(VecD([2, 0])), VecD([1.0, 0.0]));
    }

    #[test]
    fn entropic_gradient_prefers_upwind_sides() {
        // V-shaped valley along x: u = |x|.
        let grid = grid_from_fn(3, |x, _| x.abs() as f32);

        // At the kink the two one-sided slopes cancel out of the clamps.
        assert_eq!(grid.grad_entropic(VecD([0, 0])), VecD([0.0, 0.0]));
        // On the positive flank both sides agree.
        assert_eq!(grid.grad_entropic(VecD([2, 0])), VecD([1.0, 0.0]));

        // Ramp u = max(x, 0): only the forward slope survives the clamps,
        // where a central difference would average to 0.5.
        let ramp = grid_from_fn(3, |x, _| x.max(0) as f32);
        assert_eq!(ramp.grad_entropic(VecD([0, 0])), VecD([1.0, 0.0]));
        assert_eq!(ramp.grad_central(VecD([0, 0])), VecD([0.5, 0.0]));
    }

    #[test]
    fn divergence_of_quadratic_field() {
        // u = x², so backward − forward difference per axis is −2·dx.
        let grid = grid_from_fn(3, |x, _| (x * x) as f32);
        assert_eq!(grid.divergence(VecD([0, 0])), -2.0);
    }

    #[test]
    fn curvature_flat_interface_is_zero() {
        // A straight vertical interface: u = x (signed distance to x = 0).
        let grid = grid_from_fn(3, |x, _| x as f32);
        assert_approx_eq!(f32, grid.curvature(VecD([0, 0])), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn curvature_sign_of_city_block_corner() {
        // City-block distance pyramid: convex at the axis-aligned apex of
        // the zero curve, flat along its diagonal faces.
        let grid = grid_from_fn(3, |x, y| (x.abs() + y.abs()) as f32 - 1.0);
        assert!(grid.curvature(VecD([1, 0])) > 0.5);
        assert_approx_eq!(f32, grid.curvature(VecD([1, 1])), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn interp_matches_bilinear() {
        let grid = grid_from_fn(2, |x, y| x as f32 + 2.0 * y as f32);

        // Exactly on a node.
        assert_approx_eq!(f32, grid.interp(VecD([1.0, 1.0])), 3.0, epsilon = 1e-6);
        // Halfway along x.
        assert_approx_eq!(f32, grid.interp(VecD([0.5, 0.0])), 0.5, epsilon = 1e-6);
        // A bilinear field is reproduced exactly everywhere.
        assert_approx_eq!(f32, grid.interp(VecD([0.25, -0.75])), -1.25, epsilon = 1e-6);
    }

    #[test]
    fn interp_crosses_partition_boundaries() {
        // Two 4-wide partitions along x; samples straddle the boundary.
        let grid = PartitionedGrid::<f32, 2, 5>::new(VecD([8, 8]), VecD([-4, -4]), VecD([4, 4]), 0.0);
        for x in -4..4 {
            for y in -4..4 {
                grid.track(x as f32, VecD([x, y]), 0);
            }
        }
        assert_approx_eq!(f32, grid.interp(VecD([-0.5, 0.0])), -0.5, epsilon = 1e-6);
        assert_approx_eq!(f32, grid.grad_central_at(VecD([0.0, 0.0]))[0], 1.0, epsilon = 1e-6);
    }
}
