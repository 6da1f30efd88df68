//! Nonlinear corrector: solves `y − γ·f(t, y) − a = 0` at each step, where
//! `a` is the predicted part accumulated from the history, by functional
//! iteration or by a modified Newton iteration backed by the attached linear
//! solver.

use super::{IterKind, Mem, OdeRhs, Options, PrevFlag, CRDOWN, DGMAX, MSBP, RDIV};
use crate::error::LinearSolverFailure;
use crate::linear::ConvFail;
use crate::{Scalar, Vector};
use nalgebra::ComplexField;
use num_traits::{One, Zero};

/// Corrector outcome, folded into the step controller's retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NlsOutcome {
    Converged,
    /// Recoverable: retry the step with a reduced size.
    ConvFail,
    SetupFail,
    SolveFail,
}

/// Inner result of one Newton sweep.
enum NewtonSweep {
    Done(NlsOutcome),
    /// Convergence failed with stale Jacobian data; redo the sweep after a
    /// forced setup.
    TryAgain,
}

impl<V: Vector, R: OdeRhs<V>> Mem<V, R> {
    pub(crate) fn nls(
        &mut self,
        iter: IterKind,
        opts: &Options<V::T>,
        nflag: PrevFlag,
    ) -> NlsOutcome {
        match iter {
            IterKind::Functional => self.nls_functional(opts),
            IterKind::Newton => self.nls_newton(opts, nflag),
        }
    }

    /// Fixed-point iteration `y ← a + γ·f(t, y)`, corrections accumulated in
    /// `acor`.
    fn nls_functional(&mut self, opts: &Options<V::T>) -> NlsOutcome {
        self.conv_rate = V::T::one();
        let mut m = 0usize;

        self.rhs.rhs(self.tn, self.zn.col(0), &mut self.tempv);
        self.stats.number_of_rhs_evals += 1;
        self.acor.fill(V::T::zero());

        let mut delp = V::T::zero();
        loop {
            self.stats.number_of_nonlinear_solver_iterations += 1;
            // tempv = rl1·(h·f − Z[1]); y = Z[0] + tempv
            self.tempv.scale_mut(self.h);
            self.tempv.axpy(-V::T::one(), self.zn.col(1));
            self.tempv.scale_mut(self.rl1);
            self.y.copy_from(self.zn.col(0));
            self.y.axpy(V::T::one(), &self.tempv);

            // The correction of this iteration is tempv − acor.
            self.acor.scale_mut(-V::T::one());
            self.acor.axpy(V::T::one(), &self.tempv);
            let del = self.acor.wrms_norm(&self.ewt);
            self.acor.copy_from(&self.tempv);

            if m > 0 {
                self.conv_rate = (V::T::from(CRDOWN) * self.conv_rate).max(del / delp);
            }
            let dcon = del * V::T::one().min(self.conv_rate) / self.tq.conv;
            if dcon <= V::T::one() {
                self.acnrm = if m == 0 {
                    del
                } else {
                    self.acor.wrms_norm(&self.ewt)
                };
                return NlsOutcome::Converged;
            }

            m += 1;
            if m == opts.maxcor || (m >= 2 && del > V::T::from(RDIV) * delp) {
                return NlsOutcome::ConvFail;
            }
            delp = del;
            self.rhs.rhs(self.tn, &self.y, &mut self.tempv);
            self.stats.number_of_rhs_evals += 1;
        }
    }

    /// Modified Newton iteration with lazy setup of `I − γJ`.
    fn nls_newton(&mut self, opts: &Options<V::T>, nflag: PrevFlag) -> NlsOutcome {
        let mut convfail = if matches!(nflag, PrevFlag::FirstCall | PrevFlag::PrevErrFail) {
            ConvFail::NoFailures
        } else {
            ConvFail::Other
        };

        let mut call_setup = self.force_setup
            || matches!(nflag, PrevFlag::PrevConvFail | PrevFlag::PrevErrFail)
            || self.nst == 0
            || self.nst >= self.nstlp + MSBP
            || (self.gamrat - V::T::one()).abs() > V::T::from(DGMAX);
        let mut forced_refresh = false;

        loop {
            self.rhs.rhs(self.tn, self.zn.col(0), &mut self.ftemp);
            self.stats.number_of_rhs_evals += 1;

            if call_setup {
                let setup_result = match self.lsolver.as_mut() {
                    Some(ls) => {
                        ls.setup(self.gamma, self.tn, self.zn.col(0), &self.ftemp, convfail)
                    }
                    None => return NlsOutcome::SetupFail,
                };
                self.stats.number_of_linear_solver_setups += 1;
                call_setup = false;
                self.force_setup = false;
                self.gamrat = V::T::one();
                self.gammap = self.gamma;
                self.conv_rate = V::T::one();
                self.nstlp = self.nst;
                match setup_result {
                    Ok(jcur) => {
                        self.jcur = jcur;
                        // A solver that keeps reporting stale data after a
                        // forced refresh would loop forever; treat the second
                        // consecutive stale report as fatal.
                        if forced_refresh && !jcur {
                            return NlsOutcome::SetupFail;
                        }
                    }
                    Err(LinearSolverFailure::Recoverable) => return NlsOutcome::ConvFail,
                    Err(LinearSolverFailure::Unrecoverable) => return NlsOutcome::SetupFail,
                }
            }

            self.acor.fill(V::T::zero());
            self.y.copy_from(self.zn.col(0));

            match self.newton_iteration(opts) {
                NewtonSweep::Done(outcome) => return outcome,
                NewtonSweep::TryAgain => {
                    call_setup = true;
                    convfail = ConvFail::BadJacobian;
                    forced_refresh = true;
                }
            }
        }
    }

    fn newton_iteration(&mut self, opts: &Options<V::T>) -> NewtonSweep {
        self.mnewt = 0;
        let mut delp = V::T::zero();

        loop {
            // Residual of the nonlinear system at the current iterate:
            // b = γ·f(t, y) − (rl1·Z[1] + acor).
            self.tempv
                .linear_sum(self.rl1, self.zn.col(1), V::T::one(), &self.acor);
            self.tempv.scale_mut(-V::T::one());
            self.tempv.axpy(self.gamma, &self.ftemp);

            let solve_result = match self.lsolver.as_mut() {
                Some(ls) => ls.solve(
                    &mut self.tempv,
                    self.gamma,
                    self.tn,
                    &self.y,
                    &self.ftemp,
                    &self.ewt,
                ),
                None => return NewtonSweep::Done(NlsOutcome::SolveFail),
            };
            self.stats.number_of_nonlinear_solver_iterations += 1;

            match solve_result {
                Ok(()) => {}
                Err(LinearSolverFailure::Unrecoverable) => {
                    return NewtonSweep::Done(NlsOutcome::SolveFail)
                }
                Err(LinearSolverFailure::Recoverable) => {
                    if !self.jcur {
                        return NewtonSweep::TryAgain;
                    }
                    return NewtonSweep::Done(NlsOutcome::ConvFail);
                }
            }

            let del = self.tempv.wrms_norm(&self.ewt);
            self.acor.axpy(V::T::one(), &self.tempv);
            self.y.copy_from(self.zn.col(0));
            self.y.axpy(V::T::one(), &self.acor);

            if self.mnewt > 0 {
                self.conv_rate = (V::T::from(CRDOWN) * self.conv_rate).max(del / delp);
            }
            let dcon = del * V::T::one().min(self.conv_rate) / self.tq.conv;
            if dcon <= V::T::one() {
                self.acnrm = if self.mnewt == 0 {
                    del
                } else {
                    self.acor.wrms_norm(&self.ewt)
                };
                self.jcur = false;
                return NewtonSweep::Done(NlsOutcome::Converged);
            }

            self.mnewt += 1;
            if self.mnewt == opts.maxcor
                || (self.mnewt >= 2 && del > V::T::from(RDIV) * delp)
            {
                if !self.jcur {
                    return NewtonSweep::TryAgain;
                }
                return NewtonSweep::Done(NlsOutcome::ConvFail);
            }

            delp = del;
            self.rhs.rhs(self.tn, &self.y, &mut self.ftemp);
            self.stats.number_of_rhs_evals += 1;
        }
    }
}
