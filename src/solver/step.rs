//! Step controller: one internal step with its error-test and convergence
//! retry ladders, completion bookkeeping, and the next order/step selection.

use super::nls::NlsOutcome;
use super::{
    IterKind, Mem, Method, OdeRhs, Options, PrevFlag, ADDON, BIAS1, BIAS2, BIAS3, ETACF, ETAMIN,
    ETAMX2, ETAMX3, ETAMXF, LONG_WAIT, MXNEF1, ONEPSM, SMALL_NEF, SMALL_NST, THRESH,
};
use crate::error::Error;
use crate::{Scalar, Vector};
use nalgebra::ComplexField;
use num_traits::{One, Zero};

/// Step-controller verdict on a corrector failure.
enum NflagVerdict {
    DoErrorTest,
    PredictAgain,
    Fatal(Error),
}

/// Verdict of the local error test.
enum ErrTestVerdict<T> {
    Passed(T),
    TryAgain,
    Fatal(Error),
}

impl<V: Vector, R: OdeRhs<V>> Mem<V, R> {
    /// Take one internal step: predict, correct, test, and on success select
    /// the next order and step size.
    pub(crate) fn take_step(
        &mut self,
        method: Method,
        iter: IterKind,
        opts: &Options<V::T>,
    ) -> Result<(), Error> {
        let saved_t = self.tn;
        let mut ncf = 0usize;
        let mut nef = 0usize;
        let mut nflag = PrevFlag::FirstCall;

        if self.nst > 0 && self.hprime != self.h {
            self.adjust_params(method);
        }

        let dsm = loop {
            self.predict(opts);
            self.set_coeffs(method, opts);

            let outcome = self.nls(iter, opts, nflag);
            match self.handle_nflag(outcome, opts, saved_t, &mut ncf, &mut nflag) {
                NflagVerdict::DoErrorTest => {}
                NflagVerdict::PredictAgain => continue,
                NflagVerdict::Fatal(e) => return Err(e),
            }

            match self.do_error_test(method, opts, saved_t, &mut nef, &mut nflag) {
                ErrTestVerdict::Passed(dsm) => break dsm,
                ErrTestVerdict::TryAgain => continue,
                ErrTestVerdict::Fatal(e) => return Err(e),
            }
        };

        self.complete_step();
        self.prepare_next_step(method, dsm, opts);

        if opts.sldet && method == Method::Bdf {
            self.bdf_stability_check(opts);
        }

        self.etamax = if self.nst <= SMALL_NST {
            V::T::from(ETAMX2)
        } else {
            V::T::from(ETAMX3)
        };

        // Leave acor holding the estimated local error vector.
        self.acor.scale_mut(V::T::one() / self.tq.cur);
        Ok(())
    }

    /// Advance `tn` and apply the Pascal update to the history.
    fn predict(&mut self, opts: &Options<V::T>) {
        self.tn += self.h;
        if let Some(tstop) = opts.tstop {
            if (self.tn - tstop) * self.h > V::T::zero() {
                self.tn = tstop;
            }
        }
        self.zn.predict(self.q);
    }

    /// Undo a failed attempt: roll back `tn` and the history.
    fn restore(&mut self, saved_t: V::T) {
        self.tn = saved_t;
        self.zn.restore(self.q);
    }

    /// Fold a corrector outcome into the retry logic.
    fn handle_nflag(
        &mut self,
        outcome: NlsOutcome,
        opts: &Options<V::T>,
        saved_t: V::T,
        ncf: &mut usize,
        nflag: &mut PrevFlag,
    ) -> NflagVerdict {
        if outcome == NlsOutcome::Converged {
            return NflagVerdict::DoErrorTest;
        }

        self.stats.number_of_nonlinear_solver_fails += 1;
        self.restore(saved_t);

        match outcome {
            NlsOutcome::SetupFail => {
                return NflagVerdict::Fatal(Error::SetupFailure {
                    t: self.tn.into(),
                })
            }
            NlsOutcome::SolveFail => {
                return NflagVerdict::Fatal(Error::SolveFailure {
                    t: self.tn.into(),
                })
            }
            _ => {}
        }

        // Recoverable convergence failure.
        *ncf += 1;
        self.etamax = V::T::one();
        if self.h.abs() <= opts.hmin * V::T::from(ONEPSM) || *ncf == opts.maxncf {
            return NflagVerdict::Fatal(Error::ConvergenceFailures {
                t: self.tn.into(),
                h: self.h.into(),
            });
        }
        self.eta = V::T::from(ETACF).max(opts.hmin / self.h.abs());
        *nflag = PrevFlag::PrevConvFail;
        self.rescale();
        NflagVerdict::PredictAgain
    }

    /// Local error test with its three-stage retry ladder: shrink the step,
    /// then drop the order, then rebuild the history from scratch at order 1.
    fn do_error_test(
        &mut self,
        method: Method,
        opts: &Options<V::T>,
        saved_t: V::T,
        nef: &mut usize,
        nflag: &mut PrevFlag,
    ) -> ErrTestVerdict<V::T> {
        let dsm = self.acnrm / self.tq.cur;
        if dsm <= V::T::one() {
            return ErrTestVerdict::Passed(dsm);
        }

        *nef += 1;
        self.stats.number_of_error_test_failures += 1;
        *nflag = PrevFlag::PrevErrFail;
        self.restore(saved_t);

        if self.h.abs() <= opts.hmin * V::T::from(ONEPSM) || *nef == opts.maxnef {
            return ErrTestVerdict::Fatal(Error::ErrorTestFailures {
                t: self.tn.into(),
                h: self.h.into(),
            });
        }

        self.etamax = V::T::one();

        if *nef <= MXNEF1 {
            let l = self.q + 1;
            let exponent = V::T::one() / V::T::from(l as f64);
            self.eta =
                V::T::one() / ((V::T::from(BIAS2) * dsm).powf(exponent) + V::T::from(ADDON));
            self.eta = V::T::from(ETAMIN).max(self.eta.max(opts.hmin / self.h.abs()));
            if *nef >= SMALL_NEF {
                self.eta = self.eta.min(V::T::from(ETAMXF));
            }
            self.rescale();
            return ErrTestVerdict::TryAgain;
        }

        if self.q > 1 {
            self.eta = V::T::from(ETAMIN).max(opts.hmin / self.h.abs());
            self.adjust_order(method, false);
            self.q -= 1;
            self.qwait = self.q + 1;
            self.rescale();
            return ErrTestVerdict::TryAgain;
        }

        // Already at order 1: restart the history from scratch.
        self.eta = V::T::from(ETAMIN).max(opts.hmin / self.h.abs());
        self.h *= self.eta;
        self.next_h = self.h;
        self.hscale = self.h;
        self.qwait = LONG_WAIT;
        self.nscon = 0;
        self.rhs.rhs(self.tn, self.zn.col(0), &mut self.tempv);
        self.stats.number_of_rhs_evals += 1;
        self.tempv.scale_mut(self.h);
        self.zn.col_mut(1).copy_from(&self.tempv);
        ErrTestVerdict::TryAgain
    }

    /// Accept the attempt: counters, step-size ring, history correction, and
    /// the bookkeeping feeding a possible order increase.
    fn complete_step(&mut self) {
        self.nst += 1;
        self.stats.number_of_steps += 1;
        self.nscon += 1;
        self.hu = self.h;
        self.qu = self.q;

        for i in (1..self.q).rev() {
            self.tau[i] = self.tau[i - 1];
        }
        if self.q == 1 && self.nst > 1 {
            self.tau[1] = self.tau[0];
        }
        self.tau[0] = self.h;

        self.zn.correct(self.q, &self.l, &self.acor);
        self.qwait = self.qwait.saturating_sub(1);
        if self.qwait == 1 && self.q != self.qmax {
            let qmax = self.zn.qmax();
            let (saved, acor) = (qmax, &self.acor);
            self.zn.col_mut(saved).copy_from(acor);
            self.saved_tq5 = self.tq.stab;
        }
    }

    /// Choose the order and step size of the next step from the error
    /// estimates at orders `q-1`, `q`, `q+1`.
    fn prepare_next_step(&mut self, method: Method, dsm: V::T, opts: &Options<V::T>) {
        // A failure earlier in the step defers any growth to the next one.
        if self.etamax == V::T::one() {
            self.qwait = self.qwait.max(2);
            self.qprime = self.q;
            self.hprime = self.h;
            self.eta = V::T::one();
            return;
        }

        let l = self.q + 1;
        let exponent = V::T::one() / V::T::from(l as f64);
        self.etaq = V::T::one() / ((V::T::from(BIAS2) * dsm).powf(exponent) + V::T::from(ADDON));

        if self.qwait != 0 {
            self.eta = self.etaq;
            self.qprime = self.q;
            self.set_eta(opts);
            return;
        }

        self.qwait = 2;
        self.etaqm1 = self.compute_etaqm1();
        self.etaqp1 = self.compute_etaqp1();
        self.choose_eta(method);
        self.set_eta(opts);
    }

    fn compute_etaqm1(&mut self) -> V::T {
        if self.q == 1 {
            return V::T::zero();
        }
        let ddn = self.zn.col(self.q).wrms_norm(&self.ewt) / self.tq.down;
        let exponent = V::T::one() / V::T::from(self.q as f64);
        V::T::one() / ((V::T::from(BIAS1) * ddn).powf(exponent) + V::T::from(ADDON))
    }

    fn compute_etaqp1(&mut self) -> V::T {
        if self.q == self.qmax {
            return V::T::zero();
        }
        let l = self.q + 1;
        let cquot = (self.tq.stab / self.saved_tq5)
            * (self.h / self.tau[1]).powi(l as i32);
        self.tempv.linear_sum(
            -cquot,
            self.zn.col(self.zn.qmax()),
            V::T::one(),
            &self.acor,
        );
        let dup = self.tempv.wrms_norm(&self.ewt) / self.tq.up;
        let exponent = V::T::one() / V::T::from((l + 1) as f64);
        V::T::one() / ((V::T::from(BIAS3) * dup).powf(exponent) + V::T::from(ADDON))
    }

    /// Pick the largest candidate factor, keeping the order unless the win
    /// clears the threshold.
    fn choose_eta(&mut self, method: Method) {
        let etam = self.etaqm1.max(self.etaq.max(self.etaqp1));
        if etam < V::T::from(THRESH) {
            self.eta = V::T::one();
            self.qprime = self.q;
            return;
        }
        if etam == self.etaq {
            self.eta = self.etaq;
            self.qprime = self.q;
        } else if etam == self.etaqm1 {
            self.eta = self.etaqm1;
            self.qprime = self.q - 1;
        } else {
            self.eta = self.etaqp1;
            self.qprime = self.q + 1;
            if method == Method::Bdf {
                // Save the correction for the order-increase history update.
                let qmax = self.zn.qmax();
                let (saved, acor) = (qmax, &self.acor);
                self.zn.col_mut(saved).copy_from(acor);
            }
        }
    }

    /// Apply the threshold and the global bounds to the chosen factor and fix
    /// the proposed step.
    fn set_eta(&mut self, opts: &Options<V::T>) {
        if self.eta < V::T::from(THRESH) {
            self.eta = V::T::one();
            self.hprime = self.h;
        } else {
            self.eta = self.eta.min(self.etamax);
            self.eta /= V::T::one().max(self.h.abs() * opts.hmax_inv * self.eta);
            self.hprime = self.h * self.eta;
            if self.qprime < self.q {
                self.nscon = 0;
            }
        }
        self.next_h = self.hprime;
    }
}
