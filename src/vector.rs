use crate::{IndexType, Scalar};
use nalgebra::{ComplexField, DVector};
use std::fmt::Debug;
use std::ops::{Index, IndexMut};

/// Linear-algebra façade consumed by every other component. All operations
/// are dimension-preserving and side-effect-free except on `self`.
///
/// The integrator makes no assumption about storage; any backend providing
/// these kernels can carry the state vectors.
pub trait Vector:
    Clone + Debug + Index<IndexType, Output = Self::T> + IndexMut<IndexType, Output = Self::T>
{
    type T: Scalar;

    fn zeros(n: IndexType) -> Self;
    fn from_element(n: IndexType, value: Self::T) -> Self;
    fn from_vec(v: Vec<Self::T>) -> Self;
    fn len(&self) -> IndexType;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `self[i] = c` for all i.
    fn fill(&mut self, c: Self::T);
    fn copy_from(&mut self, other: &Self);

    /// `self = a * x + self`.
    fn axpy(&mut self, a: Self::T, x: &Self);
    /// `self = a * x + b * y`. Aliasing `self` with `x` or `y` is allowed.
    fn linear_sum(&mut self, a: Self::T, x: &Self, b: Self::T, y: &Self);
    /// `self = c * self`.
    fn scale_mut(&mut self, c: Self::T);
    /// `self[i] += c` for all i.
    fn add_scalar_mut(&mut self, c: Self::T);

    /// `self[i] = |self[i]|`.
    fn abs_mut(&mut self);
    /// `self[i] = 1 / self[i]`.
    fn recip_mut(&mut self);
    /// `self[i] *= x[i]`.
    fn component_mul_assign(&mut self, x: &Self);
    /// `self[i] /= x[i]`.
    fn component_div_assign(&mut self, x: &Self);

    fn dot(&self, other: &Self) -> Self::T;
    /// Weighted root-mean-square norm, `sqrt((1/N) Σ (v_i w_i)²)`.
    fn wrms_norm(&self, w: &Self) -> Self::T;
    /// `max_i |self[i]|`.
    fn max_norm(&self) -> Self::T;
    /// `min_i self[i]` (signed).
    fn min(&self) -> Self::T;

    fn assert_eq_st(&self, other: &Self, tol: Self::T) {
        assert_eq!(self.len(), other.len());
        for i in 0..self.len() {
            let d = (self[i] - other[i]).abs();
            assert!(
                d <= tol,
                "component {} differs: {} vs {} (tol {})",
                i,
                self[i],
                other[i],
                tol
            );
        }
    }
}

impl<T: Scalar> Vector for DVector<T> {
    type T = T;

    fn zeros(n: IndexType) -> Self {
        DVector::zeros(n)
    }
    fn from_element(n: IndexType, value: T) -> Self {
        DVector::from_element(n, value)
    }
    fn from_vec(v: Vec<T>) -> Self {
        DVector::from_vec(v)
    }
    fn len(&self) -> IndexType {
        self.nrows()
    }

    fn fill(&mut self, c: T) {
        nalgebra::Matrix::fill(self, c);
    }
    fn copy_from(&mut self, other: &Self) {
        nalgebra::Matrix::copy_from(self, other);
    }

    fn axpy(&mut self, a: T, x: &Self) {
        nalgebra::Matrix::axpy(self, a, x, T::one());
    }
    fn linear_sum(&mut self, a: T, x: &Self, b: T, y: &Self) {
        for i in 0..self.nrows() {
            self[i] = a * x[i] + b * y[i];
        }
    }
    fn scale_mut(&mut self, c: T) {
        *self *= c;
    }
    fn add_scalar_mut(&mut self, c: T) {
        self.apply(|e| *e += c);
    }

    fn abs_mut(&mut self) {
        self.apply(|e| *e = e.abs());
    }
    fn recip_mut(&mut self) {
        self.apply(|e| *e = T::one() / *e);
    }
    fn component_mul_assign(&mut self, x: &Self) {
        nalgebra::Matrix::component_mul_assign(self, x);
    }
    fn component_div_assign(&mut self, x: &Self) {
        nalgebra::Matrix::component_div_assign(self, x);
    }

    fn dot(&self, other: &Self) -> T {
        nalgebra::Matrix::dot(self, other)
    }
    fn wrms_norm(&self, w: &Self) -> T {
        let mut sum = T::zero();
        for i in 0..self.nrows() {
            let p = self[i] * w[i];
            sum += p * p;
        }
        (sum / T::from(self.nrows() as f64)).sqrt()
    }
    fn max_norm(&self) -> T {
        let mut m = T::zero();
        for i in 0..self.nrows() {
            let a = self[i].abs();
            if a > m {
                m = a;
            }
        }
        m
    }
    fn min(&self) -> T {
        let mut m = T::INFINITY;
        for i in 0..self.nrows() {
            if self[i] < m {
                m = self[i];
            }
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type V = DVector<f64>;

    #[test]
    fn linear_sum_aliases() {
        let x = V::from_vec(vec![1.0, 2.0]);
        let y = V::from_vec(vec![10.0, 20.0]);
        let mut z = x.clone();
        z.linear_sum(2.0, &x, -1.0, &y);
        z.assert_eq_st(&V::from_vec(vec![-8.0, -16.0]), 0.0);

        // self aliased with x
        let mut w = x.clone();
        let w2 = w.clone();
        w.linear_sum(3.0, &w2, 1.0, &y);
        w.assert_eq_st(&V::from_vec(vec![13.0, 26.0]), 0.0);
    }

    #[test]
    fn wrms_norm_matches_definition() {
        let v = V::from_vec(vec![3.0, 4.0]);
        let w = V::from_vec(vec![1.0, 0.5]);
        // sqrt((9 + 4) / 2)
        let expect = (13.0f64 / 2.0).sqrt();
        assert!((v.wrms_norm(&w) - expect).abs() < 1e-15);
    }

    #[test]
    fn component_ops() {
        let mut v = V::from_vec(vec![-2.0, 4.0]);
        v.abs_mut();
        v.recip_mut();
        v.assert_eq_st(&V::from_vec(vec![0.5, 0.25]), 1e-16);
        assert_eq!(v.max_norm(), 0.5);
        assert_eq!(v.min(), 0.25);
    }
}
