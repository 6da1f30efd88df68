use thiserror::Error;

/// Fatal conditions surfaced by the integrator.
///
/// Recoverable corrector and linear-solver failures are absorbed by the step
/// controller through step/order reduction; what reaches the caller is either
/// an input fault, an exhausted retry budget, or an unrecoverable collaborator
/// failure.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{op}: the solver was used before init")]
    NotInitialized { op: &'static str },

    #[error("{op}: illegal input: {what}")]
    IllegalInput { op: &'static str, what: String },

    #[error("step: tstop ({tstop}) is behind the current time {t} in the direction of integration")]
    TstopBehindCurrentTime { tstop: f64, t: f64 },

    #[error("step: at t = {t}, the error weight component {index} is non-positive")]
    NonPositiveWeight { t: f64, index: usize },

    #[error("step: took mxstep = {mxstep} internal steps without reaching tout, stopped at t = {t}")]
    TooMuchWork { mxstep: usize, t: f64 },

    #[error("step: at t = {t}, the requested accuracy is unobtainable; scale tolerances by at least {tolsf}")]
    TooMuchAccuracy { t: f64, tolsf: f64 },

    #[error("step: at t = {t} and h = {h}, the error test failed repeatedly or with |h| = hmin")]
    ErrorTestFailures { t: f64, h: f64 },

    #[error("step: at t = {t} and h = {h}, the corrector failed to converge repeatedly or with |h| = hmin")]
    ConvergenceFailures { t: f64, h: f64 },

    #[error("step: at t = {t}, the linear solver setup failed unrecoverably")]
    SetupFailure { t: f64 },

    #[error("step: at t = {t}, the linear solver solve failed unrecoverably")]
    SolveFailure { t: f64 },

    #[error("interpolate: derivative order {k} is outside [0, {qu}]")]
    BadK { k: usize, qu: usize },

    #[error("interpolate: t = {t} is outside the last step interval [{tstart}, {tend}]")]
    BadT { t: f64, tstart: f64, tend: f64 },
}

/// Failure channel of the linear-solver capability.
///
/// Recoverable failures make the corrector retry, possibly after a forced
/// Jacobian refresh; unrecoverable ones abort the step with
/// [`Error::SetupFailure`] or [`Error::SolveFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverFailure {
    Recoverable,
    Unrecoverable,
}
