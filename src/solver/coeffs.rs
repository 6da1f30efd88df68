//! Per-step method coefficients.
//!
//! Produces the corrector polynomial `l[0..=q]` and the test quantities from
//! the current order, step size and the history of previous step sizes, for
//! both the Adams and the fixed-leading-coefficient BDF families. Also hosts
//! the history adjustments applied when the order changes between steps.

use super::{Mem, Method, OdeRhs, Options};
use crate::{Scalar, Vector};
use nalgebra::ComplexField;
use num_traits::{One, Zero};

/// `Σ_{i=0..=iend} (-1)^i a[i] / (i + k)`, the alternating sum used to
/// integrate the product polynomials of the Adams construction.
fn alt_sum<T: Scalar>(iend: usize, a: &[T], k: usize) -> T {
    let mut sum = T::zero();
    let mut sign = T::one();
    for (i, ai) in a.iter().enumerate().take(iend + 1) {
        sum += sign * *ai / T::from((i + k) as f64);
        sign = -sign;
    }
    sum
}

impl<V: Vector, R: OdeRhs<V>> Mem<V, R> {
    /// Compute `l`, the test quantities and the Newton scalars for the
    /// current `(q, h, tau)`.
    pub(crate) fn set_coeffs(&mut self, method: Method, opts: &Options<V::T>) {
        match method {
            Method::Adams => self.set_coeffs_adams(opts),
            Method::Bdf => self.set_coeffs_bdf(opts),
        }
        self.rl1 = V::T::one() / self.l[1];
        self.gamma = self.h * self.rl1;
        if self.nst == 0 {
            self.gammap = self.gamma;
        }
        self.gamrat = if self.nst > 0 {
            self.gamma / self.gammap
        } else {
            V::T::one()
        };
    }

    /// Adams: `l(x) = 1 + x·∫₀ ∏_{i=1}^{q-1}(1 + x/ξᵢ)`, with
    /// `ξᵢ = (tₙ − tₙ₋ᵢ)/h`.
    fn set_coeffs_adams(&mut self, opts: &Options<V::T>) {
        if self.q == 1 {
            self.l[0] = V::T::one();
            self.l[1] = V::T::one();
            self.tq.down = V::T::one();
            self.tq.stab = V::T::one();
            self.tq.cur = V::T::from(2.0);
            self.tq.up = V::T::from(12.0);
            self.tq.conv = opts.nlscoef * self.tq.cur;
            return;
        }
        let mut m = [V::T::zero(); super::L_MAX];
        let hsum = self.adams_start(&mut m);
        let m0 = alt_sum(self.q - 1, &m, 1);
        let m1 = alt_sum(self.q - 1, &m, 2);
        self.adams_finish(&mut m, m0, m1, hsum, opts);
    }

    /// Build the coefficients of `∏_{i=1}^{q-1}(1 + x/ξᵢ)` in `m`, returning
    /// the accumulated step-size sum.
    fn adams_start(&mut self, m: &mut [V::T]) -> V::T {
        let q = self.q;
        let mut hsum = self.h;
        m[0] = V::T::one();
        for mi in m.iter_mut().take(q + 1).skip(1) {
            *mi = V::T::zero();
        }
        for j in 1..q {
            if j == q - 1 && self.qwait == 1 {
                // Test quantity for a possible order reduction.
                let sum = alt_sum(q - 2, m, 2);
                self.tq.down = m[q - 2] / (V::T::from(q as f64) * sum);
            }
            let xi_inv = self.h / hsum;
            for i in (1..=j).rev() {
                m[i] += m[i - 1] * xi_inv;
            }
            hsum += self.tau[j - 1];
        }
        hsum
    }

    fn adams_finish(
        &mut self,
        m: &mut [V::T],
        m0: V::T,
        m1: V::T,
        hsum: V::T,
        opts: &Options<V::T>,
    ) {
        let q = self.q;
        let m0_inv = V::T::one() / m0;

        self.l[0] = V::T::one();
        for i in 1..=q {
            self.l[i] = m0_inv * m[i - 1] / V::T::from(i as f64);
        }
        let xi = hsum / self.h;
        let xi_inv = V::T::one() / xi;

        self.tq.cur = xi * m0 / m1;
        self.tq.stab = xi / self.l[q];

        if self.qwait == 1 {
            // Test quantity for a possible order increase.
            for i in (1..=q).rev() {
                m[i] += m[i - 1] * xi_inv;
            }
            let m2 = alt_sum(q, m, 2);
            self.tq.up = V::T::from((q + 1) as f64) * m0 / m2;
        }

        self.tq.conv = opts.nlscoef * self.tq.cur;
    }

    /// Fixed-leading-coefficient BDF:
    /// `l(x) = (1 + x/ξ₁*)·∏_{i=1}^{q-1}(1 + x/ξᵢ)`.
    fn set_coeffs_bdf(&mut self, opts: &Options<V::T>) {
        let q = self.q;
        self.l[0] = V::T::one();
        self.l[1] = V::T::one();
        let mut xi_inv = V::T::one();
        let mut xistar_inv = V::T::one();
        for i in 2..=q {
            self.l[i] = V::T::zero();
        }
        let mut alpha0 = -V::T::one();
        let mut alpha0_hat = -V::T::one();
        let mut hsum = self.h;
        if q > 1 {
            for j in 2..q {
                hsum += self.tau[j - 2];
                xi_inv = self.h / hsum;
                alpha0 -= V::T::one() / V::T::from(j as f64);
                for i in (1..=j).rev() {
                    self.l[i] += self.l[i - 1] * xi_inv;
                }
            }
            // j = q
            alpha0 -= V::T::one() / V::T::from(q as f64);
            xistar_inv = -self.l[1] - alpha0;
            hsum += self.tau[q - 2];
            xi_inv = self.h / hsum;
            alpha0_hat = -self.l[1] - xi_inv;
            for i in (1..=q).rev() {
                self.l[i] += self.l[i - 1] * xistar_inv;
            }
        }
        self.set_tq_bdf(hsum, alpha0, alpha0_hat, xi_inv, xistar_inv, opts);
    }

    fn set_tq_bdf(
        &mut self,
        mut hsum: V::T,
        alpha0: V::T,
        alpha0_hat: V::T,
        mut xi_inv: V::T,
        xistar_inv: V::T,
        opts: &Options<V::T>,
    ) {
        let q = self.q;
        let a1 = V::T::one() - alpha0_hat + alpha0;
        let a2 = V::T::one() + V::T::from(q as f64) * a1;
        self.tq.cur = (alpha0 * a2 / a1).abs();
        self.tq.stab = (a2 * xistar_inv / (self.l[q] * xi_inv)).abs();
        if self.qwait == 1 {
            if q > 1 {
                let c = xistar_inv / self.l[q];
                let a3 = alpha0 + V::T::one() / V::T::from(q as f64);
                let a4 = alpha0_hat + xi_inv;
                let cprime = a3 / (V::T::one() - a4 + a3);
                self.tq.down = (c * cprime).abs();
            } else {
                self.tq.down = V::T::one();
            }
            hsum += self.tau[q - 1];
            xi_inv = self.h / hsum;
            let a5 = alpha0 - V::T::one() / V::T::from((q + 1) as f64);
            let a6 = alpha0_hat - xi_inv;
            let cprimeprime = a2 / (V::T::one() - a6 + a5);
            self.tq.up = (cprimeprime * xi_inv * V::T::from((q + 2) as f64) * a5).abs();
        }
        self.tq.conv = opts.nlscoef * self.tq.cur;
    }

    /// Apply a pending order change and rescale the history; called at the
    /// start of a step when the previous step selected a new `(q, h)`.
    pub(crate) fn adjust_params(&mut self, method: Method) {
        if self.qprime != self.q {
            let increase = self.qprime > self.q;
            self.adjust_order(method, increase);
            self.q = self.qprime;
            self.qwait = self.q + 1;
        }
        self.rescale();
    }

    /// Fix up the Nordsieck columns for an order change of ±1.
    pub(crate) fn adjust_order(&mut self, method: Method, increase: bool) {
        // Decreasing from order 2 needs no history adjustment.
        if self.q == 2 && !increase {
            return;
        }
        match (method, increase) {
            (Method::Adams, true) => {
                self.zn.col_mut(self.q + 1).fill(V::T::zero());
            }
            (Method::Adams, false) => self.decrease_adams(),
            (Method::Bdf, true) => self.increase_bdf(),
            (Method::Bdf, false) => self.decrease_bdf(),
        }
    }

    /// On an Adams order decrease each `Z[j]` is adjusted by a multiple of
    /// `Z[q]`; the multiples are the coefficients of
    /// `q·∫₀ u·∏_{i=1}^{q-2}(u + ξᵢ) du`.
    fn decrease_adams(&mut self) {
        let q = self.q;
        for li in self.l.iter_mut() {
            *li = V::T::zero();
        }
        self.l[1] = V::T::one();
        let mut hsum = V::T::zero();
        for j in 1..=q - 2 {
            hsum += self.tau[j - 1];
            let xi = hsum / self.hscale;
            for i in (1..=j + 1).rev() {
                self.l[i] = self.l[i] * xi + self.l[i - 1];
            }
        }
        for j in 1..=q - 2 {
            self.l[j + 1] = V::T::from(q as f64) * self.l[j] / V::T::from((j + 1) as f64);
        }
        for j in 2..q {
            let lj = -self.l[j];
            let (zj, zq) = self.zn.two_cols_mut(j, q);
            zj.axpy(lj, zq);
        }
    }

    /// On a BDF order increase the saved correction column (kept in
    /// `Z[qmax]`) seeds the new highest column.
    fn increase_bdf(&mut self) {
        let q = self.q;
        for li in self.l.iter_mut() {
            *li = V::T::zero();
        }
        self.l[2] = V::T::one();
        let mut alpha0 = -V::T::one();
        let mut alpha1 = V::T::one();
        let mut prod = V::T::one();
        let mut xiold = V::T::one();
        let mut hsum = self.hscale;
        if q > 1 {
            for j in 1..q {
                hsum += self.tau[j];
                let xi = hsum / self.hscale;
                prod *= xi;
                alpha0 -= V::T::one() / V::T::from((j + 1) as f64);
                alpha1 += V::T::one() / xi;
                for i in (2..=j + 2).rev() {
                    self.l[i] = self.l[i] * xiold + self.l[i - 1];
                }
                xiold = xi;
            }
        }
        let a1 = (-alpha0 - alpha1) / prod;
        let lnew = q + 1;
        let qmax = self.zn.qmax();
        // The saved correction lives in Z[qmax]; when the new column is that
        // very slot, scale it in place.
        if lnew == qmax {
            self.zn.col_mut(lnew).scale_mut(a1);
        } else {
            let (zl, zsaved) = self.zn.two_cols_mut(lnew, qmax);
            zl.copy_from(zsaved);
            zl.scale_mut(a1);
        }
        for j in 2..=q {
            let lj = self.l[j];
            let (zj, zl) = self.zn.two_cols_mut(j, lnew);
            zj.axpy(lj, zl);
        }
    }

    fn decrease_bdf(&mut self) {
        let q = self.q;
        for li in self.l.iter_mut() {
            *li = V::T::zero();
        }
        self.l[2] = V::T::one();
        let mut hsum = V::T::zero();
        for j in 1..=q - 2 {
            hsum += self.tau[j - 1];
            let xi = hsum / self.hscale;
            for i in (2..=j + 2).rev() {
                self.l[i] = self.l[i] * xi + self.l[i - 1];
            }
        }
        for j in 2..q {
            let lj = -self.l[j];
            let (zj, zq) = self.zn.two_cols_mut(j, q);
            zj.axpy(lj, zq);
        }
    }

    /// Re-express the history for the step size `eta · h` and adopt it.
    pub(crate) fn rescale(&mut self) {
        self.zn.rescale(self.q, self.eta);
        self.h = self.hscale * self.eta;
        self.next_h = self.h;
        self.hscale = self.h;
        self.nscon = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::super::{IterKind, Method, Solver, Tolerances};
    use super::alt_sum;
    use nalgebra::DVector;

    type V = DVector<f64>;

    fn mem_at(
        method: Method,
        q: usize,
        h: f64,
        tau: &[f64],
    ) -> Solver<V, fn(f64, &V, &mut V)> {
        fn zero_rhs(_t: f64, _y: &V, ydot: &mut V) {
            ydot.fill(0.0);
        }
        let mut s = Solver::<V, fn(f64, &V, &mut V)>::new(method, IterKind::Functional);
        s.init(
            zero_rhs,
            0.0,
            &V::from_vec(vec![1.0]),
            Tolerances::ScalarScalar {
                rtol: 1e-6,
                atol: 1e-6,
            },
        )
        .unwrap();
        let mem = s.mem.as_mut().unwrap();
        mem.q = q;
        mem.h = h;
        mem.qwait = 2;
        for (i, t) in tau.iter().enumerate() {
            mem.tau[i] = *t;
        }
        s
    }

    #[test]
    fn alt_sum_alternates() {
        // 1/1 - 1/2 + 1/3 with a = [1, 1, 1], k = 1
        let a = [1.0, 1.0, 1.0];
        assert!((alt_sum(2, &a, 1) - (1.0 - 0.5 + 1.0 / 3.0)).abs() < 1e-15);
    }

    #[test]
    fn bdf_order_one_constants() {
        let mut s = mem_at(Method::Bdf, 1, 0.1, &[0.1]);
        let opts_nls = 0.1;
        let mem = s.mem.as_mut().unwrap();
        mem.set_coeffs(Method::Bdf, &super::super::Options::default());
        assert_eq!(mem.l[0], 1.0);
        assert_eq!(mem.l[1], 1.0);
        assert!((mem.tq.cur - 2.0).abs() < 1e-14);
        assert!((mem.tq.conv - opts_nls * 2.0).abs() < 1e-14);
        assert!((mem.rl1 - 1.0).abs() < 1e-14);
        assert!((mem.gamma - 0.1).abs() < 1e-15);
    }

    #[test]
    fn bdf_order_two_constant_steps() {
        let mut s = mem_at(Method::Bdf, 2, 0.1, &[0.1, 0.1]);
        let mem = s.mem.as_mut().unwrap();
        mem.set_coeffs(Method::Bdf, &super::super::Options::default());
        // l(x) = (1 + x)(1 + x/2) = 1 + 3/2 x + 1/2 x²
        assert!((mem.l[0] - 1.0).abs() < 1e-14);
        assert!((mem.l[1] - 1.5).abs() < 1e-14);
        assert!((mem.l[2] - 0.5).abs() < 1e-14);
        assert!((mem.tq.cur - 4.5).abs() < 1e-12);
        assert!((mem.rl1 - 2.0 / 3.0).abs() < 1e-14);
    }

    #[test]
    fn adams_order_one_constants() {
        let mut s = mem_at(Method::Adams, 1, 0.05, &[0.05]);
        let mem = s.mem.as_mut().unwrap();
        mem.set_coeffs(Method::Adams, &super::super::Options::default());
        assert_eq!(mem.l[1], 1.0);
        assert!((mem.tq.cur - 2.0).abs() < 1e-14);
        assert!((mem.tq.up - 12.0).abs() < 1e-14);
    }

    #[test]
    fn adams_order_two_constant_steps() {
        // Order-2 Adams-Moulton at constant step is the trapezoid rule:
        // l = [1, 2, 1], so gamma = h/l[1] = h/2.
        let mut s = mem_at(Method::Adams, 2, 0.1, &[0.1, 0.1]);
        let mem = s.mem.as_mut().unwrap();
        mem.set_coeffs(Method::Adams, &super::super::Options::default());
        assert!((mem.l[0] - 1.0).abs() < 1e-14);
        assert!((mem.l[1] - 2.0).abs() < 1e-14);
        assert!((mem.l[2] - 1.0).abs() < 1e-14);
        // xi = 2, M0 = 1/2, M1 = 1/6: tq.cur = 2·(1/2)/(1/6) = 6
        assert!((mem.tq.cur - 6.0).abs() < 1e-12);
        assert!((mem.gamma - 0.05).abs() < 1e-15);
    }
}
