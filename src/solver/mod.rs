//! The integrator: lifecycle, tunables, the `step` driver and dense output.
//!
//! The step controller, corrector, coefficient engine and stability detector
//! live in the submodules; everything operates on the [`Mem`] state block that
//! `init` allocates.

mod coeffs;
mod nls;
mod stab;
mod step;

#[cfg(test)]
pub(crate) mod test_models;

use crate::error::Error;
use nalgebra::ComplexField;
use num_traits::{One, Zero};
use crate::history::Nordsieck;
use crate::linear::LinearSolver;
use crate::{IndexType, Scalar, Vector};
use serde::Serialize;

/// Linear multistep family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Adams-Moulton, orders 1..=12, for nonstiff problems.
    Adams,
    /// Backward differentiation formulas, orders 1..=5, for stiff problems.
    Bdf,
}

/// Corrector kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterKind {
    Functional,
    Newton,
}

/// Task mode of [`Solver::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Itask {
    /// Advance internal steps until `tout` is passed, then interpolate there.
    Normal,
    /// Take exactly one successful internal step and return the state at `tn`.
    OneStep,
    /// [`Itask::Normal`], additionally never stepping past the stopping time.
    NormalTstop,
    /// [`Itask::OneStep`], additionally never stepping past the stopping time.
    OneStepTstop,
}

/// Successful outcomes of [`Solver::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    /// The stopping time was reached exactly.
    TstopReturn,
}

/// Error-weight specification: `w_i = 1 / (rtol·|y_i| + atol_i)`.
pub enum Tolerances<V: Vector> {
    /// Scalar relative and absolute tolerances.
    ScalarScalar { rtol: V::T, atol: V::T },
    /// Scalar relative, per-component absolute tolerances.
    ScalarVector { rtol: V::T, atol: V },
    /// User weight generator writing `w` from `y`; all components must be
    /// strictly positive.
    Weights(Box<dyn FnMut(&V, &mut V)>),
}

/// Right-hand side `f(t, y)` of the problem `y' = f(t, y)`.
pub trait OdeRhs<V: Vector> {
    fn rhs(&mut self, t: V::T, y: &V, ydot: &mut V);
}

impl<V: Vector, F> OdeRhs<V> for F
where
    F: FnMut(V::T, &V, &mut V),
{
    fn rhs(&mut self, t: V::T, y: &V, ydot: &mut V) {
        self(t, y, ydot)
    }
}

/// Work counters, cumulative over the life of the problem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub number_of_steps: usize,
    pub number_of_rhs_evals: usize,
    pub number_of_error_test_failures: usize,
    pub number_of_nonlinear_solver_iterations: usize,
    pub number_of_nonlinear_solver_fails: usize,
    pub number_of_linear_solver_setups: usize,
    pub number_of_stability_order_reductions: usize,
    pub number_of_step_size_warnings: usize,
}

// Order ceilings and array capacities.
pub const ADAMS_Q_MAX: IndexType = 12;
pub const BDF_Q_MAX: IndexType = 5;
pub(crate) const L_MAX: IndexType = ADAMS_Q_MAX + 1;

// Step-size heuristics.
pub(crate) const ETAMIN: f64 = 0.1;
pub(crate) const ETAMX1: f64 = 10_000.0;
pub(crate) const ETAMX2: f64 = 10.0;
pub(crate) const ETAMX3: f64 = 10.0;
pub(crate) const ETAMXF: f64 = 0.2;
pub(crate) const ETACF: f64 = 0.25;
pub(crate) const ADDON: f64 = 0.000001;
pub(crate) const BIAS1: f64 = 6.0;
pub(crate) const BIAS2: f64 = 6.0;
pub(crate) const BIAS3: f64 = 10.0;
pub(crate) const THRESH: f64 = 1.5;
pub(crate) const ONEPSM: f64 = 1.000001;
pub(crate) const SMALL_NST: usize = 10;
pub(crate) const LONG_WAIT: IndexType = 10;

// Error-test retry ladder.
pub(crate) const MXNEF1: usize = 3;
pub(crate) const SMALL_NEF: usize = 2;

// Corrector heuristics.
pub(crate) const CRDOWN: f64 = 0.3;
pub(crate) const RDIV: f64 = 2.0;
pub(crate) const DGMAX: f64 = 0.3;
pub(crate) const MSBP: usize = 20;

// Initial-step search.
pub(crate) const HLB_FACTOR: f64 = 100.0;
pub(crate) const HUB_FACTOR: f64 = 0.1;
pub(crate) const H_BIAS: f64 = 0.5;
pub(crate) const H0_ITERS: usize = 4;

// Dense-output time window slack.
pub(crate) const FUZZ_FACTOR: f64 = 100.0;

/// Tunables; every field has the documented default and is validated by its
/// setter.
struct Options<T: Scalar> {
    maxord: Option<IndexType>,
    mxstep: usize,
    mxhnil: usize,
    sldet: bool,
    hin: T,
    hmin: T,
    hmax_inv: T,
    tstop: Option<T>,
    maxnef: usize,
    maxcor: usize,
    maxncf: usize,
    nlscoef: T,
}

impl<T: Scalar> Default for Options<T> {
    fn default() -> Self {
        Self {
            maxord: None,
            mxstep: 500,
            mxhnil: 10,
            sldet: false,
            hin: T::zero(),
            hmin: T::zero(),
            hmax_inv: T::zero(),
            tstop: None,
            maxnef: 7,
            maxcor: 3,
            maxncf: 10,
            nlscoef: T::from(0.1),
        }
    }
}

/// Test quantities produced by the coefficient engine each step (the `tq`
/// array of the classic formulation, division convention: estimates are
/// compared as `norm / quantity <= 1`).
#[derive(Debug, Clone, Copy)]
pub(crate) struct TestQuantities<T> {
    /// Divisor of the order `q-1` error estimate.
    pub down: T,
    /// Divisor of the local error test at the current order.
    pub cur: T,
    /// Divisor of the order `q+1` error estimate.
    pub up: T,
    /// Corrector convergence tolerance ε.
    pub conv: T,
    /// Scale used by the stability-limit detector; saved across the step.
    pub stab: T,
}

impl<T: Scalar> TestQuantities<T> {
    fn ones() -> Self {
        Self {
            down: T::one(),
            cur: T::one(),
            up: T::one(),
            conv: T::one(),
            stab: T::one(),
        }
    }
}

/// Outcome flag of the previous corrector attempt within the current step,
/// steering the Newton setup policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrevFlag {
    FirstCall,
    PrevConvFail,
    PrevErrFail,
}

/// Everything allocated by `init`.
pub(crate) struct Mem<V: Vector, R: OdeRhs<V>> {
    rhs: R,
    tol: Tolerances<V>,
    lsolver: Option<Box<dyn LinearSolver<V>>>,

    n: IndexType,
    /// Order ceiling the Nordsieck array was sized for; never widened.
    qmax_alloc: IndexType,
    qmax: IndexType,

    zn: Nordsieck<V>,
    ewt: V,
    y: V,
    acor: V,
    tempv: V,
    ftemp: V,

    q: IndexType,
    qprime: IndexType,
    qwait: IndexType,
    h: V::T,
    hprime: V::T,
    next_h: V::T,
    eta: V::T,
    etamax: V::T,
    hscale: V::T,
    tn: V::T,
    uround: V::T,

    /// `tau[i]` is the size of the step taken `i + 1` steps ago.
    tau: [V::T; L_MAX],
    /// Corrector polynomial coefficients `l[0..=q]`.
    l: [V::T; L_MAX],
    tq: TestQuantities<V::T>,

    rl1: V::T,
    gamma: V::T,
    gammap: V::T,
    gamrat: V::T,
    conv_rate: V::T,
    mnewt: usize,
    acnrm: V::T,
    jcur: bool,
    force_setup: bool,
    nstlp: usize,

    stats: Statistics,
    nst: usize,

    qu: IndexType,
    hu: V::T,
    h0u: V::T,
    saved_tq5: V::T,
    tolsf: V::T,

    // Trial step factors of the last order selection.
    etaq: V::T,
    etaqm1: V::T,
    etaqp1: V::T,

    // Stability-limit detector state.
    ssdat: [[V::T; 3]; 5],
    nscon: usize,

    started: bool,
}

/// A variable-order, variable-step Adams/BDF integrator for `y' = f(t, y)`.
///
/// Create with [`Solver::new`], install a problem with [`Solver::init`], then
/// drive with [`Solver::step`]. Between steps the state is observable through
/// [`Solver::interpolate`] and the getters but must only be mutated through
/// the setters.
pub struct Solver<V: Vector, R: OdeRhs<V>> {
    method: Method,
    iter: IterKind,
    opts: Options<V::T>,
    mem: Option<Mem<V, R>>,
}

impl<V: Vector, R: OdeRhs<V>> Solver<V, R> {
    pub fn new(method: Method, iter: IterKind) -> Self {
        Self {
            method,
            iter,
            opts: Options::default(),
            mem: None,
        }
    }

    fn method_qmax(&self) -> IndexType {
        match self.method {
            Method::Adams => ADAMS_Q_MAX,
            Method::Bdf => BDF_Q_MAX,
        }
    }

    /// Install the problem. Allocates the Nordsieck history and scratch
    /// vectors; a failure leaves the handle in the pre-`init` state.
    pub fn init(&mut self, rhs: R, t0: V::T, y0: &V, tol: Tolerances<V>) -> Result<(), Error> {
        let n = y0.len();
        if n == 0 {
            return Err(Error::IllegalInput {
                op: "init",
                what: "the problem dimension is zero".into(),
            });
        }
        check_tolerances("init", &tol, n)?;
        let qmax = self.opts.maxord.unwrap_or_else(|| self.method_qmax());

        let mut zn = Nordsieck::new(qmax, n);
        zn.reset_to(y0, &V::zeros(n));

        self.mem = Some(Mem {
            rhs,
            tol,
            lsolver: None,
            n,
            qmax_alloc: qmax,
            qmax,
            zn,
            ewt: V::zeros(n),
            y: V::zeros(n),
            acor: V::zeros(n),
            tempv: V::zeros(n),
            ftemp: V::zeros(n),
            q: 1,
            qprime: 1,
            qwait: 3, // L + 1 at order 1
            h: V::T::zero(),
            hprime: V::T::zero(),
            next_h: V::T::zero(),
            eta: V::T::one(),
            etamax: V::T::from(ETAMX1),
            hscale: V::T::zero(),
            tn: t0,
            uround: V::T::EPSILON,
            tau: [V::T::zero(); L_MAX],
            l: [V::T::zero(); L_MAX],
            tq: TestQuantities::ones(),
            rl1: V::T::one(),
            gamma: V::T::zero(),
            gammap: V::T::zero(),
            gamrat: V::T::one(),
            conv_rate: V::T::one(),
            mnewt: 0,
            acnrm: V::T::zero(),
            jcur: false,
            force_setup: true,
            nstlp: 0,
            stats: Statistics::default(),
            nst: 0,
            qu: 0,
            hu: V::T::zero(),
            h0u: V::T::zero(),
            saved_tq5: V::T::one(),
            tolsf: V::T::one(),
            etaq: V::T::one(),
            etaqm1: V::T::zero(),
            etaqp1: V::T::zero(),
            ssdat: [[V::T::zero(); 3]; 5],
            nscon: 0,
            started: false,
        });
        Ok(())
    }

    /// Re-install the problem on the existing allocations, zeroing all
    /// counters. The order ceiling may shrink (via [`Solver::set_max_order`])
    /// but never grows past the value fixed at `init`.
    pub fn reinit(&mut self, t0: V::T, y0: &V) -> Result<(), Error> {
        let maxord = self.opts.maxord;
        let method_qmax = self.method_qmax();
        let mem = self.mem.as_mut().ok_or(Error::NotInitialized { op: "reinit" })?;
        if y0.len() != mem.n {
            return Err(Error::IllegalInput {
                op: "reinit",
                what: format!(
                    "y0 has dimension {} but the problem was allocated for {}",
                    y0.len(),
                    mem.n
                ),
            });
        }
        let qmax = maxord
            .unwrap_or(method_qmax)
            .min(mem.qmax_alloc);

        mem.qmax = qmax;
        mem.zn.reset_to(y0, &V::zeros(mem.n));
        mem.q = 1;
        mem.qprime = 1;
        mem.qwait = 3;
        mem.h = V::T::zero();
        mem.hprime = V::T::zero();
        mem.next_h = V::T::zero();
        mem.eta = V::T::one();
        mem.etamax = V::T::from(ETAMX1);
        mem.hscale = V::T::zero();
        mem.tn = t0;
        mem.tau = [V::T::zero(); L_MAX];
        mem.l = [V::T::zero(); L_MAX];
        mem.tq = TestQuantities::ones();
        mem.gamrat = V::T::one();
        mem.conv_rate = V::T::one();
        mem.acnrm = V::T::zero();
        mem.jcur = false;
        mem.force_setup = true;
        mem.nstlp = 0;
        mem.stats = Statistics::default();
        mem.nst = 0;
        mem.qu = 0;
        mem.hu = V::T::zero();
        mem.h0u = V::T::zero();
        mem.saved_tq5 = V::T::one();
        mem.tolsf = V::T::one();
        mem.ssdat = [[V::T::zero(); 3]; 5];
        mem.nscon = 0;
        mem.started = false;
        Ok(())
    }

    /// Replace the tolerances of an installed problem.
    pub fn set_tolerances(&mut self, tol: Tolerances<V>) -> Result<(), Error> {
        let mem = self
            .mem
            .as_mut()
            .ok_or(Error::NotInitialized { op: "set_tolerances" })?;
        check_tolerances("set_tolerances", &tol, mem.n)?;
        mem.tol = tol;
        Ok(())
    }

    /// Attach the Newton back end. Calls the solver's `init` for the current
    /// problem dimension and makes the next setup mandatory.
    pub fn set_linear_solver(&mut self, mut ls: Box<dyn LinearSolver<V>>) -> Result<(), Error> {
        let mem = self
            .mem
            .as_mut()
            .ok_or(Error::NotInitialized { op: "set_linear_solver" })?;
        if ls.init(mem.n).is_err() {
            return Err(Error::IllegalInput {
                op: "set_linear_solver",
                what: "the linear solver failed to initialize".into(),
            });
        }
        mem.lsolver = Some(ls);
        mem.force_setup = true;
        Ok(())
    }

    /// Switch the corrector between calls. Switching away from Newton drops
    /// the attached linear solver; switching to Newton requires a fresh
    /// [`Solver::set_linear_solver`] before the next step.
    pub fn reset_iter_type(&mut self, iter: IterKind) -> Result<(), Error> {
        let mem = self
            .mem
            .as_mut()
            .ok_or(Error::NotInitialized { op: "reset_iter_type" })?;
        if iter == IterKind::Functional {
            mem.lsolver = None;
        }
        mem.force_setup = true;
        self.iter = iter;
        Ok(())
    }

    /// Maximum method order. May be lowered at any time; once `init` has
    /// sized the history it can no longer be raised above that bound.
    pub fn set_max_order(&mut self, maxord: IndexType) -> Result<(), Error> {
        if maxord < 1 || maxord > self.method_qmax() {
            return Err(Error::IllegalInput {
                op: "set_max_order",
                what: format!("maxord = {maxord} is outside [1, {}]", self.method_qmax()),
            });
        }
        if let Some(mem) = &self.mem {
            if maxord > mem.qmax_alloc {
                return Err(Error::IllegalInput {
                    op: "set_max_order",
                    what: format!(
                        "maxord = {maxord} exceeds the allocated bound {}",
                        mem.qmax_alloc
                    ),
                });
            }
        }
        self.opts.maxord = Some(maxord);
        if let Some(mem) = self.mem.as_mut() {
            mem.qmax = maxord;
        }
        Ok(())
    }

    /// Maximum number of internal steps per `step` call (default 500).
    pub fn set_max_steps(&mut self, mxstep: usize) {
        self.opts.mxstep = mxstep;
    }

    /// Maximum number of `t + h == t` warnings (default 10).
    pub fn set_max_step_warnings(&mut self, mxhnil: usize) {
        self.opts.mxhnil = mxhnil;
    }

    /// Enable the BDF stability-limit detector (default off).
    pub fn set_stability_limit_detection(&mut self, on: bool) -> Result<(), Error> {
        if on && self.method != Method::Bdf {
            return Err(Error::IllegalInput {
                op: "set_stability_limit_detection",
                what: "stability-limit detection applies to BDF only".into(),
            });
        }
        self.opts.sldet = on;
        Ok(())
    }

    /// Initial step size; zero requests the built-in estimate (default).
    pub fn set_init_step(&mut self, hin: V::T) {
        self.opts.hin = hin;
    }

    /// Minimum step magnitude (default 0).
    pub fn set_min_step(&mut self, hmin: V::T) -> Result<(), Error> {
        if hmin < V::T::zero() {
            return Err(Error::IllegalInput {
                op: "set_min_step",
                what: "hmin must be non-negative".into(),
            });
        }
        if hmin > V::T::zero() && self.opts.hmax_inv > V::T::zero()
            && hmin * self.opts.hmax_inv > V::T::one()
        {
            return Err(Error::IllegalInput {
                op: "set_min_step",
                what: "hmin must not exceed hmax".into(),
            });
        }
        self.opts.hmin = hmin;
        Ok(())
    }

    /// Maximum step magnitude (default unbounded).
    pub fn set_max_step(&mut self, hmax: V::T) -> Result<(), Error> {
        if hmax <= V::T::zero() {
            return Err(Error::IllegalInput {
                op: "set_max_step",
                what: "hmax must be positive".into(),
            });
        }
        let hmax_inv = V::T::one() / hmax;
        if self.opts.hmin * hmax_inv > V::T::one() {
            return Err(Error::IllegalInput {
                op: "set_max_step",
                what: "hmax must not be below hmin".into(),
            });
        }
        self.opts.hmax_inv = hmax_inv;
        Ok(())
    }

    /// Install the stopping time used by the `*Tstop` task modes. Cleared
    /// automatically when it is reached.
    pub fn set_tstop(&mut self, tstop: V::T) {
        self.opts.tstop = Some(tstop);
    }

    pub fn clear_tstop(&mut self) {
        self.opts.tstop = None;
    }

    /// Maximum error-test failures per step (default 7).
    pub fn set_max_err_test_fails(&mut self, maxnef: usize) {
        self.opts.maxnef = maxnef.max(1);
    }

    /// Maximum corrector iterations per attempt (default 3).
    pub fn set_max_nonlin_iters(&mut self, maxcor: usize) {
        self.opts.maxcor = maxcor.max(1);
    }

    /// Maximum corrector convergence failures per step (default 10).
    pub fn set_max_conv_fails(&mut self, maxncf: usize) {
        self.opts.maxncf = maxncf.max(1);
    }

    /// Safety coefficient of the corrector convergence test (default 0.1).
    pub fn set_nonlin_conv_coef(&mut self, nlscoef: V::T) -> Result<(), Error> {
        if nlscoef <= V::T::zero() {
            return Err(Error::IllegalInput {
                op: "set_nonlin_conv_coef",
                what: "nlscoef must be positive".into(),
            });
        }
        self.opts.nlscoef = nlscoef;
        Ok(())
    }

    /// Advance the solution toward `tout` under the given task mode, copying
    /// the returned state into the caller-owned `yout`.
    pub fn step(
        &mut self,
        tout: V::T,
        yout: &mut V,
        itask: Itask,
    ) -> Result<(V::T, StepStatus), Error> {
        let method = self.method;
        let iter = self.iter;
        let mem = self.mem.as_mut().ok_or(Error::NotInitialized { op: "step" })?;
        if yout.len() != mem.n {
            return Err(Error::IllegalInput {
                op: "step",
                what: "yout has the wrong dimension".into(),
            });
        }
        mem.advance(method, iter, &mut self.opts, tout, yout, itask)
    }

    /// `k`-th derivative of the interpolating polynomial at `t`, legal for
    /// `t` in the last step interval and `k` up to the last order used.
    pub fn interpolate(&self, t: V::T, k: IndexType, dky: &mut V) -> Result<(), Error> {
        let mem = self
            .mem
            .as_ref()
            .ok_or(Error::NotInitialized { op: "interpolate" })?;
        mem.get_dky(t, k, dky)
    }

    pub fn statistics(&self) -> Statistics {
        self.mem.as_ref().map(|m| m.stats).unwrap_or_default()
    }

    /// Order used for the last internal step.
    pub fn last_order(&self) -> Option<IndexType> {
        self.mem.as_ref().filter(|m| m.nst > 0).map(|m| m.qu)
    }

    /// Order to be attempted on the next internal step.
    pub fn current_order(&self) -> Option<IndexType> {
        self.mem.as_ref().map(|m| m.q)
    }

    /// Step size of the last internal step.
    pub fn last_step(&self) -> Option<V::T> {
        self.mem.as_ref().filter(|m| m.nst > 0).map(|m| m.hu)
    }

    /// Step size to be attempted on the next internal step.
    pub fn current_step(&self) -> Option<V::T> {
        self.mem.as_ref().map(|m| m.next_h)
    }

    /// Step size actually used on the first step.
    pub fn initial_step(&self) -> Option<V::T> {
        self.mem.as_ref().filter(|m| m.started).map(|m| m.h0u)
    }

    /// Current internal time.
    pub fn current_time(&self) -> Option<V::T> {
        self.mem.as_ref().map(|m| m.tn)
    }

    /// Suggested factor by which to scale the tolerances when the requested
    /// accuracy was not obtainable.
    pub fn tolerance_scale_factor(&self) -> Option<V::T> {
        self.mem.as_ref().map(|m| m.tolsf)
    }

    /// Current error-weight vector.
    pub fn error_weights(&self) -> Option<&V> {
        self.mem.as_ref().map(|m| &m.ewt)
    }
}

fn check_tolerances<V: Vector>(
    op: &'static str,
    tol: &Tolerances<V>,
    n: IndexType,
) -> Result<(), Error> {
    match tol {
        Tolerances::ScalarScalar { rtol, atol } => {
            if *rtol < V::T::zero() || *atol < V::T::zero() {
                return Err(Error::IllegalInput {
                    op,
                    what: "tolerances must be non-negative".into(),
                });
            }
        }
        Tolerances::ScalarVector { rtol, atol } => {
            if *rtol < V::T::zero() {
                return Err(Error::IllegalInput {
                    op,
                    what: "rtol must be non-negative".into(),
                });
            }
            if atol.len() != n {
                return Err(Error::IllegalInput {
                    op,
                    what: "atol must have the same dimension as y0".into(),
                });
            }
            if atol.min() < V::T::zero() {
                return Err(Error::IllegalInput {
                    op,
                    what: "atol components must be non-negative".into(),
                });
            }
        }
        Tolerances::Weights(_) => {}
    }
    Ok(())
}

impl<V: Vector, R: OdeRhs<V>> Mem<V, R> {
    /// Driver loop behind [`Solver::step`].
    fn advance(
        &mut self,
        method: Method,
        iter: IterKind,
        opts: &mut Options<V::T>,
        tout: V::T,
        yout: &mut V,
        itask: Itask,
    ) -> Result<(V::T, StepStatus), Error> {
        let tstop_task = matches!(itask, Itask::NormalTstop | Itask::OneStepTstop);
        if tstop_task && opts.tstop.is_none() {
            return Err(Error::IllegalInput {
                op: "step",
                what: "a *Tstop task requires set_tstop".into(),
            });
        }
        if iter == IterKind::Newton && self.lsolver.is_none() {
            return Err(Error::IllegalInput {
                op: "step",
                what: "the Newton corrector needs an attached linear solver".into(),
            });
        }

        if !self.started {
            // A request for the initial state needs no machinery (and no
            // initial step size): hand back y0.
            if matches!(itask, Itask::Normal | Itask::NormalTstop) && tout == self.tn {
                yout.copy_from(self.zn.col(0));
                return Ok((self.tn, StepStatus::Success));
            }
            self.begin_integration(method, opts, tout)?;
        } else {
            // Re-entry sanity checks and the no-step fast path.
            if tstop_task {
                let tstop = opts.tstop.unwrap_or(self.tn);
                if (tstop - self.tn) * self.h < V::T::zero() {
                    return Err(Error::TstopBehindCurrentTime {
                        tstop: tstop.into(),
                        t: self.tn.into(),
                    });
                }
            }
            if matches!(itask, Itask::Normal | Itask::NormalTstop)
                && (self.tn - tout) * self.h >= V::T::zero()
            {
                self.get_dky(tout, 0, yout).map_err(|_| Error::IllegalInput {
                    op: "step",
                    what: format!(
                        "tout = {} is behind the current time and outside the last step",
                        Into::<f64>::into(tout)
                    ),
                })?;
                return Ok((tout, StepStatus::Success));
            }
        }

        let mut nstloc = 0usize;
        loop {
            // Refresh weights against the current solution.
            if self.nst > 0 {
                if let Err(index) = self.set_ewt() {
                    yout.copy_from(self.zn.col(0));
                    let err = Error::NonPositiveWeight {
                        t: self.tn.into(),
                        index,
                    };
                    tracing::error!("{err}");
                    return Err(err);
                }
            }

            if nstloc >= opts.mxstep {
                yout.copy_from(self.zn.col(0));
                let err = Error::TooMuchWork {
                    mxstep: opts.mxstep,
                    t: self.tn.into(),
                };
                tracing::error!("{err}");
                return Err(err);
            }

            // Requested accuracy vs machine precision.
            let nrm = self.zn.col(0).wrms_norm(&self.ewt);
            self.tolsf = self.uround * nrm;
            if self.tolsf > V::T::one() {
                self.tolsf *= V::T::from(2.0);
                yout.copy_from(self.zn.col(0));
                let err = Error::TooMuchAccuracy {
                    t: self.tn.into(),
                    tolsf: self.tolsf.into(),
                };
                tracing::error!("{err}");
                return Err(err);
            }
            self.tolsf = V::T::one();

            if self.tn + self.h == self.tn {
                self.stats.number_of_step_size_warnings += 1;
                if self.stats.number_of_step_size_warnings <= opts.mxhnil {
                    tracing::warn!(
                        "step: internal t = {} and h = {} are such that t + h == t on the next step",
                        Into::<f64>::into(self.tn),
                        Into::<f64>::into(self.h)
                    );
                    if self.stats.number_of_step_size_warnings == opts.mxhnil {
                        tracing::warn!("step: the above warning will not be issued again");
                    }
                }
            }

            if let Err(err) = self.take_step(method, iter, opts) {
                yout.copy_from(self.zn.col(0));
                tracing::error!("{err}");
                return Err(err);
            }
            nstloc += 1;

            // In Normal modes, stop once tout has been passed.
            if matches!(itask, Itask::Normal | Itask::NormalTstop)
                && (self.tn - tout) * self.h >= V::T::zero()
            {
                // tout lies inside the step just taken; the window check
                // cannot fail.
                let _ = self.get_dky(tout, 0, yout);
                return Ok((tout, StepStatus::Success));
            }

            if tstop_task {
                if let Some(tstop) = opts.tstop {
                    let troundoff =
                        V::T::from(FUZZ_FACTOR) * self.uround * (self.tn.abs() + self.h.abs());
                    if (self.tn - tstop).abs() <= troundoff {
                        self.tn = tstop;
                        yout.copy_from(self.zn.col(0));
                        opts.tstop = None;
                        return Ok((tstop, StepStatus::TstopReturn));
                    }
                    if (self.tn + self.hprime - tstop) * self.h > V::T::zero() {
                        self.hprime =
                            (tstop - self.tn) * (V::T::one() - V::T::from(4.0) * self.uround);
                        self.eta = self.hprime / self.h;
                        self.next_h = self.hprime;
                    }
                }
            }

            if matches!(itask, Itask::OneStep | Itask::OneStepTstop) {
                yout.copy_from(self.zn.col(0));
                return Ok((self.tn, StepStatus::Success));
            }
        }
    }

    /// First-call work: weights, `Z[1] = h·f(t0, y0)`, the initial step size
    /// and its bounds.
    fn begin_integration(
        &mut self,
        _method: Method,
        opts: &Options<V::T>,
        tout: V::T,
    ) -> Result<(), Error> {
        if let Err(index) = self.set_ewt() {
            return Err(Error::IllegalInput {
                op: "step",
                what: format!("the initial error weight component {index} is non-positive"),
            });
        }

        // y0' = f(t0, y0) stays in ftemp for the step-size estimate and is
        // scaled into the history once h is fixed.
        self.rhs.rhs(self.tn, self.zn.col(0), &mut self.ftemp);
        self.stats.number_of_rhs_evals += 1;

        let mut h = opts.hin;
        if (tout - self.tn) * h < V::T::zero() {
            return Err(Error::IllegalInput {
                op: "step",
                what: "hin and tout - t0 have opposite signs".into(),
            });
        }
        if h == V::T::zero() {
            h = self.estimate_h0(tout, opts)?;
        }
        // Bound by hmax and hmin.
        let rh = h.abs() * opts.hmax_inv;
        if rh > V::T::one() {
            h /= rh;
        }
        if h.abs() < opts.hmin {
            h *= opts.hmin / h.abs();
        }
        if let Some(tstop) = opts.tstop {
            if (tstop - self.tn) * h <= V::T::zero() {
                return Err(Error::TstopBehindCurrentTime {
                    tstop: tstop.into(),
                    t: self.tn.into(),
                });
            }
            if (self.tn + h - tstop) * h > V::T::zero() {
                h = (tstop - self.tn) * (V::T::one() - V::T::from(4.0) * self.uround);
            }
        }

        self.h = h;
        self.hprime = h;
        self.next_h = h;
        self.hscale = h;
        self.h0u = h;
        self.y.copy_from(self.zn.col(0));
        self.tempv.copy_from(&self.ftemp);
        self.tempv.scale_mut(h);
        self.zn.reset_to(&self.y, &self.tempv);
        self.started = true;
        Ok(())
    }

    /// Error weights from the tolerances and `Z[0]`; on failure returns the
    /// offending component.
    pub(crate) fn set_ewt(&mut self) -> Result<(), usize> {
        match &mut self.tol {
            Tolerances::ScalarScalar { rtol, atol } => {
                self.tempv.copy_from(self.zn.col(0));
                self.tempv.abs_mut();
                self.tempv.scale_mut(*rtol);
                self.tempv.add_scalar_mut(*atol);
            }
            Tolerances::ScalarVector { rtol, atol } => {
                self.tempv.copy_from(self.zn.col(0));
                self.tempv.abs_mut();
                self.tempv.scale_mut(*rtol);
                self.tempv.axpy(V::T::one(), atol);
            }
            Tolerances::Weights(f) => {
                f(self.zn.col(0), &mut self.ewt);
                if self.ewt.min() <= V::T::zero() {
                    return Err(first_nonpositive(&self.ewt));
                }
                return Ok(());
            }
        }
        if self.tempv.min() <= V::T::zero() {
            return Err(first_nonpositive(&self.tempv));
        }
        self.ewt.copy_from(&self.tempv);
        self.ewt.recip_mut();
        Ok(())
    }

    /// Geometric-mean search for the initial step: pick `h` so that
    /// `h²·‖ÿ‖/2` is about one in the weighted norm, bounded below by
    /// roundoff and above by a fraction of the output interval.
    fn estimate_h0(&mut self, tout: V::T, opts: &Options<V::T>) -> Result<V::T, Error> {
        let tdiff = tout - self.tn;
        let sign_neg = tdiff < V::T::zero();
        let tdist = tdiff.abs();
        let tround = self.uround * self.tn.abs().max(tout.abs());
        if tdist < V::T::from(2.0) * tround {
            return Err(Error::IllegalInput {
                op: "step",
                what: "tout is too close to t0 to start the integration".into(),
            });
        }

        let hlb = V::T::from(HLB_FACTOR) * tround;
        let hub = self.upper_bound_h0(tdist);
        let mut hg = (hlb * hub).sqrt();
        if hub < hlb {
            if sign_neg {
                hg = -hg;
            }
            return Ok(hg);
        }

        let mut hnew_ok = false;
        let mut hnew = hg;
        for count in 1..=H0_ITERS {
            let hgs = if sign_neg { -hg } else { hg };
            let yddnrm = self.ydd_norm(hgs);
            if hnew_ok || count == H0_ITERS {
                hnew = hg;
                break;
            }
            hnew = if yddnrm * hub * hub > V::T::from(2.0) {
                (V::T::from(2.0) / yddnrm).sqrt()
            } else {
                (hg * hub).sqrt()
            };
            let hrat = hnew / hg;
            if hrat > V::T::from(0.5) && hrat < V::T::from(2.0) {
                hnew_ok = true;
            }
            if count > 1 && hrat > V::T::from(2.0) {
                hnew = hg;
                hnew_ok = true;
            }
            hg = hnew;
        }

        let mut h0 = V::T::from(H_BIAS) * hnew;
        if h0 < hlb {
            h0 = hlb;
        }
        if h0 > hub {
            h0 = hub;
        }
        if sign_neg {
            h0 = -h0;
        }
        Ok(h0)
    }

    /// Upper bound on the initial step: allow at most a `HUB_FACTOR` change
    /// in `y0` over a forward Euler step, and at most a `HUB_FACTOR` fraction
    /// of the output interval.
    fn upper_bound_h0(&mut self, tdist: V::T) -> V::T {
        // tempv = HUB_FACTOR·|y0| + 1/ewt; acor = |y0'| / tempv
        self.tempv.copy_from(self.zn.col(0));
        self.tempv.abs_mut();
        self.tempv.scale_mut(V::T::from(HUB_FACTOR));
        self.acor.copy_from(&self.ewt);
        self.acor.recip_mut();
        self.tempv.axpy(V::T::one(), &self.acor);

        self.acor.copy_from(&self.ftemp);
        self.acor.abs_mut();
        self.acor.component_div_assign(&self.tempv);
        let hub_inv = self.acor.max_norm();

        let hub = V::T::from(HUB_FACTOR) * tdist;
        if hub * hub_inv > V::T::one() {
            V::T::one() / hub_inv
        } else {
            hub
        }
    }

    /// Weighted norm of a difference-quotient estimate of `y''` using the
    /// trial step `hg`. Reads `y0'` from `ftemp`.
    fn ydd_norm(&mut self, hg: V::T) -> V::T {
        self.y.copy_from(self.zn.col(0));
        self.y.axpy(hg, &self.ftemp);
        self.rhs.rhs(self.tn + hg, &self.y, &mut self.tempv);
        self.stats.number_of_rhs_evals += 1;
        self.tempv.axpy(-V::T::one(), &self.ftemp);
        self.tempv.scale_mut(V::T::one() / hg);
        self.tempv.wrms_norm(&self.ewt)
    }

    /// Dense output: `k`-th derivative at `t` by Horner evaluation over the
    /// Nordsieck columns.
    fn get_dky(&self, t: V::T, k: IndexType, dky: &mut V) -> Result<(), Error> {
        if k > self.q {
            return Err(Error::BadK { k, qu: self.q });
        }
        if self.h == V::T::zero() {
            // No step has been taken; only the initial state is available.
            if t != self.tn || k > 0 {
                return Err(Error::BadT {
                    t: t.into(),
                    tstart: self.tn.into(),
                    tend: self.tn.into(),
                });
            }
            dky.copy_from(self.zn.col(0));
            return Ok(());
        }

        let mut tfuzz = V::T::from(FUZZ_FACTOR) * self.uround * (self.tn.abs() + self.hu.abs());
        if self.hu < V::T::zero() {
            tfuzz = -tfuzz;
        }
        let tp = self.tn - self.hu - tfuzz;
        let tn1 = self.tn + tfuzz;
        if (t - tp) * (t - tn1) > V::T::zero() {
            let (a, b) = ((self.tn - self.hu).into(), self.tn.into());
            return Err(Error::BadT {
                t: t.into(),
                tstart: if self.hu >= V::T::zero() { a } else { b },
                tend: if self.hu >= V::T::zero() { b } else { a },
            });
        }

        let s = (t - self.tn) / self.h;
        for j in (k..=self.q).rev() {
            let mut c = V::T::one();
            for i in (j + 1 - k)..=j {
                c *= V::T::from(i as f64);
            }
            if j == self.q {
                dky.copy_from(self.zn.col(j));
                dky.scale_mut(c);
            } else {
                dky.scale_mut(s);
                dky.axpy(c, self.zn.col(j));
            }
        }
        if k > 0 {
            dky.scale_mut(self.h.powi(-(k as i32)));
        }
        Ok(())
    }
}

fn first_nonpositive<V: Vector>(v: &V) -> usize {
    for i in 0..v.len() {
        if v[i] <= V::T::zero() {
            return i;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::test_models::{
        cosine_rhs, decay_jac, decay_rhs, oscillator_rhs, van_der_pol_jac, van_der_pol_rhs, V,
    };
    use super::{Itask, IterKind, Method, Solver, StepStatus, Tolerances};
    use crate::error::{Error, LinearSolverFailure};
    use crate::linear::dense::Dense;
    use crate::linear::{ConvFail, LinearSolver};
    use approx::assert_abs_diff_eq;

    fn scalar_tol(rtol: f64, atol: f64) -> Tolerances<V> {
        Tolerances::ScalarScalar { rtol, atol }
    }

    #[test]
    fn bdf_newton_exponential_decay() {
        let mut s = Solver::new(Method::Bdf, IterKind::Newton);
        s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(1e-8, 1e-10))
            .unwrap();
        s.set_linear_solver(Box::new(Dense::new(decay_jac))).unwrap();
        s.set_max_steps(5000);

        let mut y = V::zeros(1);
        let (tret, status) = s.step(10.0, &mut y, Itask::Normal).unwrap();
        assert_eq!(status, StepStatus::Success);
        assert_eq!(tret, 10.0);
        assert_abs_diff_eq!(y[0], (-10.0f64).exp(), epsilon = 1e-6);

        let stats = s.statistics();
        assert!(stats.number_of_steps >= 10);
        assert!(stats.number_of_rhs_evals < 200);
        assert!(stats.number_of_linear_solver_setups > 0);

        // The estimated first step is positive and at most a tenth of the
        // output interval.
        let h0 = s.initial_step().unwrap();
        assert!(h0 > 0.0 && h0 <= 1.0, "h0 = {h0}");
    }

    #[test]
    fn vector_tolerances_are_honoured() {
        let mut s = Solver::new(Method::Adams, IterKind::Functional);
        s.init(
            oscillator_rhs,
            0.0,
            &V::from_vec(vec![1.0, 0.0]),
            Tolerances::ScalarVector {
                rtol: 1e-6,
                atol: V::from_vec(vec![1e-8, 1e-8]),
            },
        )
        .unwrap();
        s.set_max_steps(10_000);
        let mut y = V::zeros(2);
        s.step(1.0, &mut y, Itask::Normal).unwrap();
        assert_abs_diff_eq!(y[0], 1.0f64.cos(), epsilon = 1e-4);
        assert_abs_diff_eq!(y[1], -(1.0f64.sin()), epsilon = 1e-4);
    }

    #[test]
    fn custom_weight_function_drives_the_error_test() {
        let mut s = Solver::new(Method::Adams, IterKind::Functional);
        s.init(
            oscillator_rhs,
            0.0,
            &V::from_vec(vec![1.0, 0.0]),
            Tolerances::Weights(Box::new(|y: &V, w: &mut V| {
                for i in 0..2 {
                    w[i] = 1.0 / (1e-6 * y[i].abs() + 1e-8);
                }
            })),
        )
        .unwrap();
        s.set_max_steps(10_000);
        let mut y = V::zeros(2);
        s.step(1.0, &mut y, Itask::Normal).unwrap();
        assert_abs_diff_eq!(y[0], 1.0f64.cos(), epsilon = 1e-4);
    }

    #[test]
    fn adams_functional_oscillator_full_period() {
        let mut s = Solver::new(Method::Adams, IterKind::Functional);
        s.init(
            oscillator_rhs,
            0.0,
            &V::from_vec(vec![1.0, 0.0]),
            scalar_tol(1e-6, 1e-8),
        )
        .unwrap();
        s.set_max_steps(10_000);

        let mut y = V::zeros(2);
        let two_pi = 2.0 * std::f64::consts::PI;
        s.step(two_pi, &mut y, Itask::Normal).unwrap();
        assert_abs_diff_eq!(y[0], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(y[1], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn bdf_newton_van_der_pol_stiff() {
        let mu = 1000.0;
        let mut s = Solver::new(Method::Bdf, IterKind::Newton);
        s.init(
            van_der_pol_rhs(mu),
            0.0,
            &V::from_vec(vec![2.0, 0.0]),
            scalar_tol(1e-4, 1e-8),
        )
        .unwrap();
        s.set_linear_solver(Box::new(Dense::new(van_der_pol_jac(mu))))
            .unwrap();
        s.set_max_steps(5000);

        let mut y = V::zeros(2);
        let mut max_order = 0;
        loop {
            let (t, _) = s.step(3000.0, &mut y, Itask::OneStep).unwrap();
            max_order = max_order.max(s.last_order().unwrap());
            if t >= 3000.0 {
                break;
            }
        }
        let stats = s.statistics();
        assert!(stats.number_of_steps < 1500, "nst = {}", stats.number_of_steps);
        // The order climbs during the smooth phases of the relaxation orbit.
        assert!(max_order >= 4, "max order seen = {max_order}");
        assert!(y[0].abs() < 3.0);
    }

    #[test]
    fn van_der_pol_with_stability_limit_detection() {
        let mu = 1000.0;
        let mut s = Solver::new(Method::Bdf, IterKind::Newton);
        s.init(
            van_der_pol_rhs(mu),
            0.0,
            &V::from_vec(vec![2.0, 0.0]),
            scalar_tol(1e-4, 1e-8),
        )
        .unwrap();
        s.set_linear_solver(Box::new(Dense::new(van_der_pol_jac(mu))))
            .unwrap();
        s.set_max_steps(5000);
        s.set_stability_limit_detection(true).unwrap();

        let mut y = V::zeros(2);
        s.step(3000.0, &mut y, Itask::Normal).unwrap();
        let stats = s.statistics();
        assert!(stats.number_of_steps < 2000);
        assert!(stats.number_of_stability_order_reductions < 50);
    }

    #[test]
    fn adams_order_climbs_on_smooth_forcing() {
        let mut s = Solver::new(Method::Adams, IterKind::Functional);
        s.init(cosine_rhs, 0.0, &V::from_vec(vec![0.0]), scalar_tol(1e-6, 1e-10))
            .unwrap();
        s.set_max_steps(1000);

        let mut y = V::zeros(1);
        let mut max_order = 0;
        for _ in 0..30 {
            s.step(100.0, &mut y, Itask::OneStep).unwrap();
            max_order = max_order.max(s.last_order().unwrap());
        }
        assert!(max_order >= 5, "order only reached {max_order} in 30 steps");
    }

    #[test]
    fn tstop_is_hit_bit_exactly() {
        let mut s = Solver::new(Method::Adams, IterKind::Functional);
        s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(1e-6, 1e-10))
            .unwrap();
        s.set_max_steps(10_000);
        s.set_tstop(1.0);

        let mut y = V::zeros(1);
        loop {
            let (tret, status) = s.step(2.0, &mut y, Itask::NormalTstop).unwrap();
            if status == StepStatus::TstopReturn {
                assert_eq!(tret, 1.0);
                assert_eq!(s.current_time().unwrap(), 1.0);
                break;
            }
            assert!(tret < 1.0);
        }
        assert_abs_diff_eq!(y[0], (-1.0f64).exp(), epsilon = 1e-5);
    }

    /// Linear solver double for the convergence-failure retry path: the
    /// first `fails` solve calls report a recoverable failure, after which it
    /// solves the 1-D decay system exactly.
    struct FlakyDecaySolver {
        fails: usize,
    }

    impl LinearSolver<V> for FlakyDecaySolver {
        fn init(&mut self, _n: usize) -> Result<(), LinearSolverFailure> {
            Ok(())
        }
        fn setup(
            &mut self,
            _gamma: f64,
            _t: f64,
            _ypred: &V,
            _fpred: &V,
            _convfail: ConvFail,
        ) -> Result<bool, LinearSolverFailure> {
            Ok(true)
        }
        fn solve(
            &mut self,
            b: &mut V,
            gamma: f64,
            _t: f64,
            _ycur: &V,
            _fcur: &V,
            _ewt: &V,
        ) -> Result<(), LinearSolverFailure> {
            if self.fails > 0 {
                self.fails -= 1;
                return Err(LinearSolverFailure::Recoverable);
            }
            // (I - gamma·J) x = b with J = -1
            b[0] /= 1.0 + gamma;
            Ok(())
        }
    }

    #[test]
    fn convergence_failures_shrink_the_step_and_recover() {
        let mut s = Solver::new(Method::Bdf, IterKind::Newton);
        s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(1e-6, 1e-8))
            .unwrap();
        s.set_linear_solver(Box::new(FlakyDecaySolver { fails: 2 }))
            .unwrap();
        s.set_init_step(0.01);

        let mut y = V::zeros(1);
        let (_t, status) = s.step(1.0, &mut y, Itask::OneStep).unwrap();
        assert_eq!(status, StepStatus::Success);

        // Each recoverable failure cuts h by 0.25; the third attempt sticks.
        assert_eq!(s.statistics().number_of_nonlinear_solver_fails, 2);
        assert_eq!(s.last_step(), Some(0.01 * 0.25 * 0.25));
    }

    #[test]
    fn interpolate_reproduces_the_current_state() {
        let mut s = Solver::new(Method::Bdf, IterKind::Newton);
        s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(1e-8, 1e-10))
            .unwrap();
        s.set_linear_solver(Box::new(Dense::new(decay_jac))).unwrap();

        let mut y = V::zeros(1);
        for _ in 0..5 {
            s.step(10.0, &mut y, Itask::OneStep).unwrap();
        }
        let tn = s.current_time().unwrap();
        let qu = s.last_order().unwrap();

        let mut dky = V::zeros(1);
        s.interpolate(tn, 0, &mut dky).unwrap();
        assert_eq!(dky[0], y[0]);

        // First derivative at tn matches f(tn, y).
        s.interpolate(tn, 1, &mut dky).unwrap();
        assert_abs_diff_eq!(dky[0], -y[0], epsilon = 1e-6);

        assert!(matches!(
            s.interpolate(tn, qu + 1, &mut dky),
            Err(Error::BadK { .. })
        ));
        let hu = s.last_step().unwrap();
        assert!(matches!(
            s.interpolate(tn - 10.0 * hu, 0, &mut dky),
            Err(Error::BadT { .. })
        ));
    }

    #[test]
    fn replay_is_deterministic() {
        let run = || {
            let mut s = Solver::new(Method::Bdf, IterKind::Newton);
            s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(1e-8, 1e-10))
                .unwrap();
            s.set_linear_solver(Box::new(Dense::new(decay_jac))).unwrap();
            s.set_max_steps(5000);
            let mut y = V::zeros(1);
            s.step(5.0, &mut y, Itask::Normal).unwrap();
            (y[0], s.current_time().unwrap(), s.statistics())
        };
        let (y1, t1, st1) = run();
        let (y2, t2, st2) = run();
        assert_eq!(y1, y2);
        assert_eq!(t1, t2);
        assert_eq!(st1, st2);
    }

    #[test]
    fn reinit_restarts_from_the_new_state() {
        let mut s = Solver::new(Method::Adams, IterKind::Functional);
        s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(1e-6, 1e-10))
            .unwrap();
        s.set_max_steps(5000);
        let mut y = V::zeros(1);
        s.step(2.0, &mut y, Itask::Normal).unwrap();

        let y0 = V::from_vec(vec![0.5]);
        s.reinit(0.0, &y0).unwrap();
        assert_eq!(s.statistics().number_of_steps, 0);

        // A Normal call with tout = t0 hands back y0 without stepping.
        let (tret, status) = s.step(0.0, &mut y, Itask::Normal).unwrap();
        assert_eq!(status, StepStatus::Success);
        assert_eq!(tret, 0.0);
        assert_eq!(y[0], 0.5);
        assert_eq!(s.statistics().number_of_steps, 0);
    }

    #[test]
    fn integrates_backwards_in_time() {
        let mut s = Solver::new(Method::Adams, IterKind::Functional);
        s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(1e-6, 1e-10))
            .unwrap();
        s.set_max_steps(5000);
        let mut y = V::zeros(1);
        let (tret, _) = s.step(-1.0, &mut y, Itask::Normal).unwrap();
        assert_eq!(tret, -1.0);
        assert!(s.initial_step().unwrap() < 0.0);
        assert_abs_diff_eq!(y[0], 1.0f64.exp(), epsilon = 1e-3);
    }

    #[test]
    fn step_budget_is_enforced() {
        let mut s = Solver::new(Method::Adams, IterKind::Functional);
        s.init(
            oscillator_rhs,
            0.0,
            &V::from_vec(vec![1.0, 0.0]),
            scalar_tol(1e-10, 1e-12),
        )
        .unwrap();
        s.set_max_steps(5);
        let mut y = V::zeros(2);
        let err = s.step(100.0, &mut y, Itask::Normal).unwrap_err();
        assert!(matches!(err, Error::TooMuchWork { mxstep: 5, .. }));
        // The state at the budget stop is still observable.
        assert!(s.current_time().unwrap() > 0.0);
    }

    #[test]
    fn nonpositive_weights_are_an_input_fault() {
        let mut s = Solver::new(Method::Adams, IterKind::Functional);
        s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(0.0, 0.0))
            .unwrap();
        let mut y = V::zeros(1);
        let err = s.step(1.0, &mut y, Itask::Normal).unwrap_err();
        assert!(matches!(err, Error::IllegalInput { op: "step", .. }));
    }

    #[test]
    fn newton_without_linear_solver_is_rejected() {
        let mut s = Solver::new(Method::Bdf, IterKind::Newton);
        s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(1e-6, 1e-8))
            .unwrap();
        let mut y = V::zeros(1);
        let err = s.step(1.0, &mut y, Itask::OneStep).unwrap_err();
        assert!(matches!(err, Error::IllegalInput { op: "step", .. }));
    }

    #[test]
    fn reset_iter_type_drops_the_newton_backend() {
        let mut s = Solver::new(Method::Bdf, IterKind::Newton);
        s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(1e-6, 1e-8))
            .unwrap();
        s.set_linear_solver(Box::new(Dense::new(decay_jac))).unwrap();
        let mut y = V::zeros(1);
        s.step(0.5, &mut y, Itask::OneStep).unwrap();

        s.reset_iter_type(IterKind::Functional).unwrap();
        s.step(0.5, &mut y, Itask::OneStep).unwrap();

        // Back to Newton: the back end is gone and must be re-attached.
        s.reset_iter_type(IterKind::Newton).unwrap();
        let err = s.step(1.0, &mut y, Itask::OneStep).unwrap_err();
        assert!(matches!(err, Error::IllegalInput { op: "step", .. }));
    }

    #[test]
    fn max_order_cannot_widen_after_init() {
        let mut s: Solver<V, fn(f64, &V, &mut V)> = Solver::new(Method::Bdf, IterKind::Functional);
        s.set_max_order(3).unwrap();
        s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(1e-6, 1e-8))
            .unwrap();
        assert!(s.set_max_order(5).is_err());
        s.set_max_order(2).unwrap();
    }

    #[test]
    fn tstop_task_requires_a_tstop() {
        let mut s = Solver::new(Method::Adams, IterKind::Functional);
        s.init(decay_rhs, 0.0, &V::from_vec(vec![1.0]), scalar_tol(1e-6, 1e-8))
            .unwrap();
        let mut y = V::zeros(1);
        assert!(s.step(1.0, &mut y, Itask::NormalTstop).is_err());
    }
}
