pub mod dense;

use crate::error::LinearSolverFailure;
use crate::{IndexType, Vector};

/// Why the corrector is asking for a fresh setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvFail {
    /// First setup of the step, or the previous step ended in an error-test
    /// failure; Jacobian data may still be reusable.
    NoFailures,
    /// The Newton iteration failed with data known to be stale.
    BadJacobian,
    /// The Newton iteration failed for some other reason (e.g. after a step
    /// size reduction); a refresh is advisable but not mandated.
    Other,
}

/// Capability record a Newton back end must supply.
///
/// The solver prepares and applies `P ≈ I − γJ` where `J = ∂f/∂y`. All data
/// the original C design read back through the integrator handle (`gamma`,
/// `tn`, weights) is passed explicitly, so implementations hold no reference
/// to the integrator.
pub trait LinearSolver<V: Vector> {
    /// One-time preparation for problems of dimension `n`. Called when the
    /// solver is attached and again from `reinit` if the dimension changed.
    fn init(&mut self, n: IndexType) -> Result<(), LinearSolverFailure>;

    /// Prepare data for `I − γJ` at `(t, ypred)`. `fpred` is `f(t, ypred)`.
    ///
    /// Returns `Ok(true)` when Jacobian data was refreshed, `Ok(false)` when
    /// saved data was reused. Reporting stale data twice in a row after a
    /// [`ConvFail::BadJacobian`] request is treated as fatal by the caller.
    fn setup(
        &mut self,
        gamma: V::T,
        t: V::T,
        ypred: &V,
        fpred: &V,
        convfail: ConvFail,
    ) -> Result<bool, LinearSolverFailure>;

    /// Solve `P x = b` in place. `ycur`/`fcur` are the current iterate and its
    /// derivative, `ewt` the error weights, for solvers that scale residuals.
    fn solve(
        &mut self,
        b: &mut V,
        gamma: V::T,
        t: V::T,
        ycur: &V,
        fcur: &V,
        ewt: &V,
    ) -> Result<(), LinearSolverFailure>;
}
