//! BDF stability-limit detection.
//!
//! At orders 3 and above the BDF stability region does not contain the whole
//! left half-plane; on mildly stiff oscillatory problems the step size can
//! stall against the stability boundary instead of the accuracy requirement.
//! The detector watches ratios of successive scaled-derivative norms: a
//! common growth root `rr` of the quartics built from the last five samples
//! that lies above the cutoff indicates the boundary, and the order is
//! reduced to restore a larger stable region.

use super::{Mem, OdeRhs, Options, ETAMIN};
use crate::{Scalar, Vector};
use nalgebra::ComplexField;
use num_traits::{One, Zero};

const RRCUT: f64 = 0.98;
const VRRTOL: f64 = 1.0e-4;
const VRRT2: f64 = 5.0e-4;
const SQTOL: f64 = 1.0e-3;
const RRTOL: f64 = 1.0e-2;
const TINY: f64 = 1.0e-10;
const HUN: f64 = 100.0;

impl<V: Vector, R: OdeRhs<V>> Mem<V, R> {
    /// Push the scaled error samples of the step just accepted and, once
    /// enough constant-step history has accumulated, run the detector. A
    /// violation forces the order down by one.
    pub(crate) fn bdf_stability_check(&mut self, opts: &Options<V::T>) {
        let q = self.q;

        if q >= 3 {
            for k in 0..3 {
                for i in (1..5).rev() {
                    self.ssdat[i][k] = self.ssdat[i - 1][k];
                }
            }
            let mut factorial = V::T::one();
            for i in 1..q {
                factorial *= V::T::from(i as f64);
            }
            let qf = V::T::from(q as f64);
            let sq = factorial * qf * (qf + V::T::one()) * self.acnrm
                / self.tq.stab.max(V::T::from(TINY));
            let sqm1 = factorial * qf * self.zn.col(q).wrms_norm(&self.ewt);
            let sqm2 = factorial * self.zn.col(q - 1).wrms_norm(&self.ewt);
            self.ssdat[0][0] = sqm2 * sqm2;
            self.ssdat[0][1] = sqm1 * sqm1;
            self.ssdat[0][2] = sq * sq;
        }

        if self.qprime >= q {
            if q >= 3 && self.nscon >= q + 5 {
                let kflag = self.sldet();
                if kflag > 3 {
                    // Stability boundary found: force the order down.
                    self.qprime = q - 1;
                    self.eta = self.etaqm1.max(V::T::from(ETAMIN));
                    self.eta = self.eta.min(self.etamax);
                    self.eta /= V::T::one().max(self.h.abs() * opts.hmax_inv * self.eta);
                    self.hprime = self.h * self.eta;
                    self.next_h = self.hprime;
                    self.stats.number_of_stability_order_reductions += 1;
                }
            }
        } else {
            // The controller is raising the order anyway; restart the count.
            self.nscon = 0;
        }
    }

    /// Root-finding heuristic on the sample ring. Positive returns mean a
    /// characteristic root was found (4..=6: above the cutoff); negative
    /// returns mean the data gave no firm evidence.
    pub(crate) fn sldet(&mut self) -> i32 {
        let one = V::T::one();
        let zero = V::T::zero();
        let tiny = V::T::from(TINY);

        let mut rat = [[zero; 3]; 4];
        let mut rav = [zero; 3];
        let mut qkr = [zero; 3];
        let mut sigsq = [zero; 3];
        let mut smax = [zero; 3];
        let mut ssmax = [zero; 3];
        let mut drr = [zero; 3];
        let mut rrc = [zero; 3];
        let mut sqmx = [zero; 3];
        let mut qjk = [[zero; 3]; 3];
        let mut vrat = [zero; 3];
        let mut qc = [[zero; 3]; 5];
        let mut qco = [[zero; 3]; 5];

        let mut rr = zero;
        let mut kflag = 0i32;

        // Maxima, minima, variances, and the quartic coefficients of each
        // sample column.
        for k in 0..3 {
            let mut smink = self.ssdat[0][k];
            let mut smaxk = zero;
            for i in 0..5 {
                smink = smink.min(self.ssdat[i][k]);
                smaxk = smaxk.max(self.ssdat[i][k]);
            }
            if smink < tiny * smaxk {
                return -1;
            }
            smax[k] = smaxk;
            ssmax[k] = smaxk * smaxk;

            let mut sumrat = zero;
            let mut sumrsq = zero;
            for i in 0..4 {
                rat[i][k] = self.ssdat[i][k] / self.ssdat[i + 1][k];
                sumrat += rat[i][k];
                sumrsq += rat[i][k] * rat[i][k];
            }
            rav[k] = V::T::from(0.25) * sumrat;
            vrat[k] = (V::T::from(0.25) * sumrsq - rav[k] * rav[k]).abs();

            qc[4][k] = self.ssdat[0][k] * self.ssdat[2][k] - self.ssdat[1][k] * self.ssdat[1][k];
            qc[3][k] = self.ssdat[1][k] * self.ssdat[2][k] - self.ssdat[0][k] * self.ssdat[3][k];
            qc[2][k] = zero;
            qc[1][k] = self.ssdat[1][k] * self.ssdat[4][k] - self.ssdat[2][k] * self.ssdat[3][k];
            qc[0][k] = self.ssdat[3][k] * self.ssdat[3][k] - self.ssdat[2][k] * self.ssdat[4][k];

            for i in 0..5 {
                qco[i][k] = qc[i][k];
            }
        }

        // Near-normal case: the three columns share a common ratio.
        let vmin = vrat[0].min(vrat[1].min(vrat[2]));
        let vmax = vrat[0].max(vrat[1].max(vrat[2]));

        if vmin < V::T::from(VRRTOL * VRRTOL) {
            if vmax > V::T::from(VRRT2 * VRRT2) {
                return -2;
            }
            rr = (rav[0] + rav[1] + rav[2]) / V::T::from(3.0);
            let mut drrmax = zero;
            for k in 0..3 {
                drrmax = drrmax.max((rav[k] - rr).abs());
            }
            if drrmax > V::T::from(VRRT2) {
                return -3;
            }
            kflag = 1;
        } else {
            // Eliminate between the three quartics to isolate rr.
            if qco[0][0].abs() < tiny * ssmax[0] {
                return -4;
            }
            let tem = qco[0][1] / qco[0][0];
            for i in 1..5 {
                qco[i][1] -= tem * qco[i][0];
            }
            qco[0][1] = zero;
            let tem = qco[0][2] / qco[0][0];
            for i in 1..5 {
                qco[i][2] -= tem * qco[i][0];
            }
            qco[0][2] = zero;

            if qco[1][1].abs() < tiny * ssmax[1] {
                return -4;
            }
            let tem = qco[1][2] / qco[1][1];
            for i in 2..5 {
                qco[i][2] -= tem * qco[i][1];
            }

            if qco[3][2].abs() < tiny * ssmax[2] {
                return -4;
            }
            rr = -qco[4][2] / qco[3][2];

            if rr < tiny || rr > V::T::from(HUN) {
                return -5;
            }

            for k in 0..3 {
                qkr[k] = qc[4][k] + rr * (qc[3][k] + rr * rr * (qc[1][k] + rr * qc[0][k]));
            }

            let mut sqmax = zero;
            for k in 0..3 {
                let saqk = qkr[k].abs() / ssmax[k];
                sqmax = sqmax.max(saqk);
            }

            if sqmax < V::T::from(SQTOL) {
                kflag = 2;
            } else {
                // Newton corrections on rr.
                let mut sqmin = zero;
                for _ in 0..3 {
                    for k in 0..3 {
                        let qp = qc[3][k]
                            + rr * rr * (V::T::from(3.0) * qc[1][k] + rr * V::T::from(4.0) * qc[0][k]);
                        drr[k] = zero;
                        if qp.abs() > tiny * ssmax[k] {
                            drr[k] = -qkr[k] / qp;
                        }
                        rrc[k] = rr + drr[k];
                    }

                    for k in 0..3 {
                        let s = rrc[k];
                        let mut sqmaxk = zero;
                        for j in 0..3 {
                            qjk[j][k] =
                                qc[4][j] + s * (qc[3][j] + s * s * (qc[1][j] + s * qc[0][j]));
                            let saqj = qjk[j][k].abs() / ssmax[j];
                            sqmaxk = sqmaxk.max(saqj);
                        }
                        sqmx[k] = sqmaxk;
                    }

                    let mut kmin = 0;
                    sqmin = sqmx[0] + one;
                    for k in 0..3 {
                        if sqmx[k] < sqmin {
                            kmin = k;
                            sqmin = sqmx[k];
                        }
                    }
                    rr = rrc[kmin];

                    if sqmin < V::T::from(SQTOL) {
                        kflag = 3;
                        break;
                    }
                    for j in 0..3 {
                        qkr[j] = qjk[j][kmin];
                    }
                }

                if sqmin > V::T::from(SQTOL) {
                    return -6;
                }
            }
        }

        // With rr in hand, estimate the sigma-squared values and cross-check.
        for k in 0..3 {
            let rsa = self.ssdat[0][k];
            let rsb = self.ssdat[1][k] * rr;
            let rsc = self.ssdat[2][k] * rr * rr;
            let rsd = self.ssdat[3][k] * rr * rr * rr;
            let rd1a = rsa - rsb;
            let rd1b = rsb - rsc;
            let rd1c = rsc - rsd;
            let rd2a = rd1a - rd1b;
            let rd2b = rd1b - rd1c;
            let rd3a = rd2a - rd2b;

            if rd1b.abs() < tiny * smax[k] {
                return -7;
            }
            let cest1 = -rd3a / rd1b;
            if cest1 < tiny || cest1 > V::T::from(4.0) {
                return -7;
            }
            let corr1 = (rd2b / cest1) / (rr * rr);
            sigsq[k] = self.ssdat[2][k] + corr1;
        }

        if sigsq[1] < tiny {
            return -8;
        }

        let q = V::T::from(self.q as f64);
        let ratp = sigsq[2] / sigsq[1];
        let ratm = sigsq[0] / sigsq[1];
        let qfac1 = V::T::from(0.25) * (q * q - one);
        let qfac2 = V::T::from(2.0) / (q - one);
        let bb = ratp * ratm - one - qfac1 * ratp;
        let tem = one - qfac2 * bb;
        if tem.abs() < tiny {
            return -8;
        }
        let rrb = one / tem;
        if (rrb - rr).abs() > V::T::from(RRTOL) {
            return -9;
        }

        if rr > V::T::from(RRCUT) {
            if kflag == 1 {
                kflag = 4;
            } else if kflag == 2 {
                kflag = 5;
            } else if kflag == 3 {
                kflag = 6;
            }
        }

        kflag
    }
}

#[cfg(test)]
mod tests {
    use super::super::{IterKind, Method, Solver, Tolerances};
    use nalgebra::DVector;

    type V = DVector<f64>;

    fn solver_with_samples(ssdat: [[f64; 3]; 5]) -> Solver<V, fn(f64, &V, &mut V)> {
        fn zero_rhs(_t: f64, _y: &V, ydot: &mut V) {
            ydot.fill(0.0);
        }
        let mut s = Solver::<V, fn(f64, &V, &mut V)>::new(Method::Bdf, IterKind::Functional);
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
        mem.q = 3;
        mem.ssdat = ssdat;
        s
    }

    #[test]
    fn sldet_rejects_wildly_varying_samples() {
        // One column spans ten orders of magnitude: its minimum falls under
        // the tiny cutoff and the detector declines to conclude anything.
        let mut ssdat = [[1.0; 3]; 5];
        for (i, row) in ssdat.iter_mut().enumerate() {
            row[0] = 10f64.powi(-(3 * i as i32));
        }
        let mut s = solver_with_samples(ssdat);
        assert_eq!(s.mem.as_mut().unwrap().sldet(), -1);
    }

    #[test]
    fn sldet_terminates_on_irregular_samples() {
        let mut ssdat = [[0.0; 3]; 5];
        for (i, row) in ssdat.iter_mut().enumerate() {
            for (k, v) in row.iter_mut().enumerate() {
                *v = 0.3 + 0.17 * ((i * 3 + k) as f64).sin().abs();
            }
        }
        let mut s = solver_with_samples(ssdat);
        let kflag = s.mem.as_mut().unwrap().sldet();
        assert!((-9..=6).contains(&kflag));
    }
}
