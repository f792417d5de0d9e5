//! Fixed-size `D`-dimensional vectors used for grid positions and distances.
//!
//! No general linear algebra lives here: the engine only needs componentwise
//! arithmetic, a dot product and a couple of norms, so [`VecD`] is a plain
//! newtype over `[T; D]`.

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Div, Index, IndexMut, Mul, Neg, Sub};

/// A `D`-dimensional vector with componentwise semantics.
///
/// Signed integer vectors (`VecD<i32, D>`) are grid positions, unsigned
/// vectors (`VecD<u32, D>`) are grid sizes and float vectors
/// (`VecD<f32, D>`) are real-valued sample positions or gradients.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct VecD<T, const D: usize>(pub [T; D]);

impl<T: Default + Copy, const D: usize> Default for VecD<T, D> {
    fn default() -> Self {
        Self(std::array::from_fn(|_| T::default()))
    }
}

impl<T: Copy, const D: usize> VecD<T, D> {
    /// Constructs a vector with every component equal to `value`.
    #[must_use]
    pub fn splat(value: T) -> Self {
        Self([value; D])
    }

    /// Constructs a vector by evaluating `f` for each axis.
    #[must_use]
    pub fn from_fn(f: impl FnMut(usize) -> T) -> Self {
        Self(std::array::from_fn(f))
    }

    /// Applies `f` to every component.
    #[must_use]
    pub fn map<U: Copy>(self, mut f: impl FnMut(T) -> U) -> VecD<U, D> {
        VecD(std::array::from_fn(|i| f(self.0[i])))
    }

    /// Returns an iterator over the components.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }
}

impl<T: Copy + Mul<Output = T>, const D: usize> VecD<T, D> {
    /// Product of all components.
    #[must_use]
    pub fn product(self) -> T {
        let mut acc = self.0[0];
        for i in 1..D {
            acc = acc * self.0[i];
        }
        acc
    }

    /// Componentwise product.
    #[must_use]
    pub fn cwise_mul(self, rhs: Self) -> Self {
        Self::from_fn(|i| self.0[i] * rhs.0[i])
    }
}

impl<T: Copy + Add<Output = T>, const D: usize> VecD<T, D> {
    /// Sum of all components.
    #[must_use]
    pub fn sum(self) -> T {
        let mut acc = self.0[0];
        for i in 1..D {
            acc = acc + self.0[i];
        }
        acc
    }
}

impl<T: Copy + Div<Output = T>, const D: usize> VecD<T, D> {
    /// Componentwise division.
    #[must_use]
    pub fn cwise_div(self, rhs: Self) -> Self {
        Self::from_fn(|i| self.0[i] / rhs.0[i])
    }
}

impl<T: Copy + Ord, const D: usize> VecD<T, D> {
    /// Componentwise minimum.
    #[must_use]
    pub fn cwise_min(self, rhs: Self) -> Self {
        Self::from_fn(|i| self.0[i].min(rhs.0[i]))
    }

    /// Componentwise maximum.
    #[must_use]
    pub fn cwise_max(self, rhs: Self) -> Self {
        Self::from_fn(|i| self.0[i].max(rhs.0[i]))
    }
}

impl<T: Copy + Add<Output = T> + Mul<Output = T>, const D: usize> VecD<T, D> {
    /// Dot product.
    #[must_use]
    pub fn dot(self, rhs: Self) -> T {
        let mut acc = self.0[0] * rhs.0[0];
        for i in 1..D {
            acc = acc + self.0[i] * rhs.0[i];
        }
        acc
    }
}

impl<const D: usize> VecD<i32, D> {
    /// Componentwise remainder.
    #[must_use]
    pub fn cwise_rem(self, rhs: Self) -> Self {
        Self::from_fn(|i| self.0[i] % rhs.0[i])
    }

    /// City-block (L1) norm.
    #[must_use]
    pub fn abs_sum(self) -> i32 {
        self.0.iter().map(|c| c.abs()).sum()
    }

    /// Casts each component to `f32`.
    #[must_use]
    pub fn to_f32(self) -> VecD<f32, D> {
        self.map(|c| c as f32)
    }

    /// Casts each component to `u32`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if any component is negative.
    #[must_use]
    pub fn to_u32(self) -> VecD<u32, D> {
        debug_assert!(self.0.iter().all(|&c| c >= 0), "negative size {self:?}");
        self.map(|c| c as u32)
    }
}

impl<const D: usize> VecD<u32, D> {
    /// Casts each component to `i32`.
    #[must_use]
    pub fn to_i32(self) -> VecD<i32, D> {
        self.map(|c| c as i32)
    }

    /// Product of all components as a `usize` buffer length.
    #[must_use]
    pub fn area(self) -> usize {
        self.0.iter().map(|&c| c as usize).product()
    }
}

impl<const D: usize> VecD<f32, D> {
    /// Componentwise floor, cast to integer coordinates.
    #[must_use]
    pub fn floor_i32(self) -> VecD<i32, D> {
        self.map(|c| c.floor() as i32)
    }

    /// Squared Euclidean norm.
    #[must_use]
    pub fn squared_norm(self) -> f32 {
        self.dot(self)
    }

    /// Euclidean norm.
    #[must_use]
    pub fn norm(self) -> f32 {
        self.squared_norm().sqrt()
    }

    /// Unit vector in the same direction. Not meaningful for a zero vector.
    #[must_use]
    pub fn normalized(self) -> Self {
        self / self.norm()
    }
}

impl<T, const D: usize> Index<usize> for VecD<T, D> {
    type Output = T;

    fn index(&self, axis: usize) -> &T {
        &self.0[axis]
    }
}

impl<T, const D: usize> IndexMut<usize> for VecD<T, D> {
    fn index_mut(&mut self, axis: usize) -> &mut T {
        &mut self.0[axis]
    }
}

impl<T: Copy + Add<Output = T>, const D: usize> Add for VecD<T, D> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::from_fn(|i| self.0[i] + rhs.0[i])
    }
}

impl<T: Copy + Add<Output = T>, const D: usize> AddAssign for VecD<T, D> {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<T: Copy + Sub<Output = T>, const D: usize> Sub for VecD<T, D> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::from_fn(|i| self.0[i] - rhs.0[i])
    }
}

impl<T: Copy + Mul<Output = T>, const D: usize> Mul<T> for VecD<T, D> {
    type Output = Self;

    fn mul(self, rhs: T) -> Self {
        Self::from_fn(|i| self.0[i] * rhs)
    }
}

impl<T: Copy + Div<Output = T>, const D: usize> Div<T> for VecD<T, D> {
    type Output = Self;

    fn div(self, rhs: T) -> Self {
        Self::from_fn(|i| self.0[i] / rhs)
    }
}

impl<T: Copy + Neg<Output = T>, const D: usize> Neg for VecD<T, D> {
    type Output = Self;

    fn neg(self) -> Self {
        self.map(|c| -c)
    }
}

// serde has no impls for generic `[T; D]`, so the tuple encoding is spelled
// out; the on-disk shape is exactly `D` consecutive values.
impl<T: Serialize, const D: usize> Serialize for VecD<T, D> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(D)?;
        for component in &self.0 {
            tuple.serialize_element(component)?;
        }
        tuple.end()
    }
}

impl<'de, T: Deserialize<'de> + Copy + Default, const D: usize> Deserialize<'de> for VecD<T, D> {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        struct TupleVisitor<T, const D: usize>(PhantomData<T>);

        impl<'de, T: Deserialize<'de> + Copy + Default, const D: usize> Visitor<'de>
            for TupleVisitor<T, D>
        {
            type Value = VecD<T, D>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a tuple of {D} components")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut result = VecD([T::default(); D]);
                for i in 0..D {
                    result.0[i] = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(result)
            }
        }

        deserializer.deserialize_tuple(D, TupleVisitor(PhantomData))
    }
}

/// Sign of a value as `-1`, `0` or `+1`.
#[must_use]
pub fn sgn(value: f32) -> i32 {
    i32::from(value > 0.0) - i32::from(value < 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn componentwise_arithmetic() {
        let a = VecD([1, 2, 3]);
        let b = VecD([4, 5, 6]);

        assert_eq!(a + b, VecD([5, 7, 9]));
        assert_eq!(b - a, VecD([3, 3, 3]));
        assert_eq!(a * 2, VecD([2, 4, 6]));
        assert_eq!(b / 2, VecD([2, 2, 3]));
        assert_eq!(-a, VecD([-1, -2, -3]));
        assert_eq!(a.cwise_mul(b), VecD([4, 10, 18]));
        assert_eq!(b.cwise_div(a), VecD([4, 2, 2]));
        assert_eq!(VecD([7, -3]).cwise_rem(VecD([4, 4])), VecD([3, -3]));
    }

    #[test]
    fn reductions() {
        assert_eq!(VecD([2, 3, 4]).product(), 24);
        assert_eq!(VecD([2, 3, 4]).sum(), 9);
        assert_eq!(VecD([-2, 3, -4]).abs_sum(), 9);
        assert_eq!(VecD([1, 2]).dot(VecD([3, 4])), 11);
        assert_eq!(VecD([2_u32, 3]).area(), 6);
    }

    #[test]
    fn float_norms() {
        let v = VecD([3.0_f32, 4.0]);
        assert_eq!(v.squared_norm(), 25.0);
        assert_eq!(v.norm(), 5.0);
        assert_eq!(v.normalized(), VecD([0.6, 0.8]));
        assert_eq!(VecD([1.7_f32, -0.3]).floor_i32(), VecD([1, -1]));
    }

    #[test]
    fn min_max() {
        let a = VecD([1, 5]);
        let b = VecD([3, 2]);
        assert_eq!(a.cwise_min(b), VecD([1, 2]));
        assert_eq!(a.cwise_max(b), VecD([3, 5]));
    }

    #[test]
    fn sign() {
        assert_eq!(sgn(2.5), 1);
        assert_eq!(sgn(-0.1), -1);
        assert_eq!(sgn(0.0), 0);
    }

    #[test]
    fn serde_round_trip() {
        let v = VecD([-3, 7]);
        let bytes = bincode::serialize(&v).unwrap();
        // Two i32 components, nothing else.
        assert_eq!(bytes.len(), 8);
        let back: VecD<i32, 2> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, v);
    }
}
