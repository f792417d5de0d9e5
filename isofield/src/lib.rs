//! `isofield` is a dynamic sparse-field level-set engine.
//!
//! A surface is represented as the zero crossing of a signed-distance field
//! sampled on a regular grid. Only a narrow band of points around the
//! crossing is stored: spatial partitioning allocates memory lazily for the
//! regions the band touches, and evolution updates the band incrementally
//! with a layered distance transform. A per-partition polygoniser extracts
//! line or triangle meshes of the zero layer with change tracking.
//!
//! ```
//! use isofield::surface::Surface3;
//! use isofield::poly::Polys;
//! use isofield::vector::VecD;
//!
//! let mut surface = Surface3::new(VecD([16, 16, 16]));
//! surface.seed(VecD([0, 0, 0]));
//! // Expand the surface one grid unit along its normal.
//! surface.update(|_pos, _iso| -1.0);
//!
//! let mut polys = Polys::new(&surface);
//! polys.notify(&surface);
//! polys.march(&surface);
//!
//! let hit = surface.ray(VecD([-100.0, 0.0, 0.0]), VecD([1.0, 0.0, 0.0]));
//! assert!(hit[0].is_finite());
//! ```

pub mod error;
pub mod grid;
pub mod lookup;
mod numeric;
pub mod partition;
pub mod poly;
pub mod surface;
pub mod tables;
pub mod tracked;
pub mod vector;
