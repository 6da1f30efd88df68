use crate::{IndexType, Vector};
use num_traits::{One, Zero};

/// Nordsieck history array.
///
/// Column `j` holds `(h^j / j!) · y⁽ʲ⁾(tn)`, so column 0 is the current
/// solution and column 1 is `h·y'`. The columns up to the current order `q`
/// encode the interpolating polynomial in scaled-derivative form; the array is
/// sized for the order ceiling fixed at allocation time.
#[derive(Debug, Clone)]
pub(crate) struct Nordsieck<V: Vector> {
    cols: Vec<V>,
}

impl<V: Vector> Nordsieck<V> {
    /// Allocate `qmax + 1` columns of dimension `n`, all zero.
    pub fn new(qmax: IndexType, n: IndexType) -> Self {
        let cols = (0..=qmax).map(|_| V::zeros(n)).collect();
        Self { cols }
    }

    pub fn qmax(&self) -> IndexType {
        self.cols.len() - 1
    }

    pub fn col(&self, j: IndexType) -> &V {
        &self.cols[j]
    }

    pub fn col_mut(&mut self, j: IndexType) -> &mut V {
        &mut self.cols[j]
    }

    /// Distinct mutable borrows of columns `a` and `b` (`a != b`).
    pub fn two_cols_mut(&mut self, a: IndexType, b: IndexType) -> (&mut V, &mut V) {
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.cols.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.cols.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// Apply the triangular Pascal update in place, advancing the polynomial
    /// basis from `tn` to `tn + h` without new derivative information.
    pub fn predict(&mut self, q: IndexType) {
        for k in 1..=q {
            for j in (k..=q).rev() {
                let (lo, hi) = self.cols.split_at_mut(j);
                lo[j - 1].axpy(V::T::one(), &hi[0]);
            }
        }
    }

    /// Inverse of [`predict`](Self::predict): restore the array after a
    /// rejected attempt.
    pub fn restore(&mut self, q: IndexType) {
        for k in 1..=q {
            for j in (k..=q).rev() {
                let (lo, hi) = self.cols.split_at_mut(j);
                lo[j - 1].axpy(-V::T::one(), &hi[0]);
            }
        }
    }

    /// `Z[j] += l[j] · e` for `j = 0..=q`.
    pub fn correct(&mut self, q: IndexType, l: &[V::T], e: &V) {
        for j in 0..=q {
            self.cols[j].axpy(l[j], e);
        }
    }

    /// Multiply `Z[j]` by `eta^j` for `j = 1..=q`, re-expressing the history
    /// in terms of the new step size `eta · h`.
    pub fn rescale(&mut self, q: IndexType, eta: V::T) {
        let mut factor = eta;
        for j in 1..=q {
            self.cols[j].scale_mut(factor);
            factor *= eta;
        }
    }

    /// Install a fresh initial state: `Z[0] = y0`, `Z[1] = h·y'(t0)`, every
    /// higher column zero.
    pub fn reset_to(&mut self, y0: &V, hf0: &V) {
        self.cols[0].copy_from(y0);
        self.cols[1].copy_from(hf0);
        for col in self.cols.iter_mut().skip(2) {
            col.fill(V::T::zero());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    type V = DVector<f64>;

    fn sample(q: usize) -> Nordsieck<V> {
        let mut z = Nordsieck::<V>::new(5, 2);
        for j in 0..=q {
            *z.col_mut(j) = V::from_vec(vec![(j + 1) as f64, -(j as f64) - 0.5]);
        }
        z
    }

    #[test]
    fn predict_is_pascal_update() {
        // With q = 2 the update sends (z0, z1, z2) to
        // (z0 + 2 z1 + z2... ) via repeated adjacent sums; check against the
        // binomial form z0' = z0 + z1 + z2, z1' = z1 + 2 z2 directly.
        let mut z = sample(2);
        let z0 = z.col(0).clone();
        let z1 = z.col(1).clone();
        let z2 = z.col(2).clone();
        z.predict(2);

        let mut e0 = z0.clone();
        Vector::axpy(&mut e0, 1.0, &z1);
        Vector::axpy(&mut e0, 1.0, &z2);
        let mut e1 = z1.clone();
        Vector::axpy(&mut e1, 2.0, &z2);

        z.col(0).assert_eq_st(&e0, 1e-15);
        z.col(1).assert_eq_st(&e1, 1e-15);
        z.col(2).assert_eq_st(&z2, 0.0);
    }

    #[test]
    fn restore_undoes_predict() {
        let mut z = sample(4);
        let before: Vec<V> = (0..=4).map(|j| z.col(j).clone()).collect();
        z.predict(4);
        z.restore(4);
        for (j, b) in before.iter().enumerate() {
            z.col(j).assert_eq_st(b, 1e-14);
        }
    }

    #[test]
    fn rescale_roundtrip_is_exact_for_powers_of_two() {
        let mut z = sample(3);
        let before: Vec<V> = (0..=3).map(|j| z.col(j).clone()).collect();
        z.rescale(3, 2.0);
        z.rescale(3, 0.5);
        for (j, b) in before.iter().enumerate() {
            // powers of two scale without rounding
            z.col(j).assert_eq_st(b, 0.0);
        }
    }

    #[test]
    fn reset_to_installs_a_fresh_initial_state() {
        let mut z = sample(4);
        let y0 = V::from_vec(vec![7.0, -1.0]);
        let hf0 = V::from_vec(vec![0.25, 0.5]);
        z.reset_to(&y0, &hf0);
        z.col(0).assert_eq_st(&y0, 0.0);
        z.col(1).assert_eq_st(&hf0, 0.0);
        for j in 2..=5 {
            z.col(j).assert_eq_st(&V::zeros(2), 0.0);
        }
    }

    #[test]
    fn correct_applies_polynomial_coefficients() {
        let mut z = sample(2);
        let z1 = z.col(1).clone();
        let e = V::from_vec(vec![2.0, 4.0]);
        let l = [1.0, 0.5, 0.25];
        z.correct(2, &l, &e);
        let mut expect = z1;
        Vector::axpy(&mut expect, 0.5, &e);
        z.col(1).assert_eq_st(&expect, 0.0);
    }
}
