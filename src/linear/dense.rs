use super::{ConvFail, LinearSolver};
use crate::error::LinearSolverFailure;
use crate::{IndexType, Scalar};
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};

/// How many setups a saved Jacobian may be reused for before a refresh.
const MSBJ: usize = 50;

/// Dense direct back end: forms `I − γJ` from a user Jacobian closure and
/// factors it with LU.
///
/// The Jacobian is refreshed when the corrector signals stale data and
/// otherwise reused for up to [`MSBJ`] setups; re-forming the iteration
/// matrix for a new `γ` does not require a refresh.
pub struct Dense<T: Scalar, J> {
    jac: J,
    saved_j: DMatrix<T>,
    factors: Option<LU<T, Dyn, Dyn>>,
    nsetups_since_jac: usize,
    have_jac: bool,
    n: IndexType,
}

impl<T: Scalar, J> Dense<T, J>
where
    J: FnMut(T, &DVector<T>, &mut DMatrix<T>),
{
    /// `jac(t, y, out)` writes `∂f/∂y (t, y)` into `out`.
    pub fn new(jac: J) -> Self {
        Self {
            jac,
            saved_j: DMatrix::zeros(0, 0),
            factors: None,
            nsetups_since_jac: 0,
            have_jac: false,
            n: 0,
        }
    }
}

impl<T: Scalar, J> LinearSolver<DVector<T>> for Dense<T, J>
where
    J: FnMut(T, &DVector<T>, &mut DMatrix<T>),
{
    fn init(&mut self, n: IndexType) -> Result<(), LinearSolverFailure> {
        self.saved_j = DMatrix::zeros(n, n);
        self.factors = None;
        self.have_jac = false;
        self.nsetups_since_jac = 0;
        self.n = n;
        Ok(())
    }

    fn setup(
        &mut self,
        gamma: T,
        t: T,
        ypred: &DVector<T>,
        _fpred: &DVector<T>,
        convfail: ConvFail,
    ) -> Result<bool, LinearSolverFailure> {
        let reuse = self.have_jac
            && convfail == ConvFail::NoFailures
            && self.nsetups_since_jac < MSBJ;
        if !reuse {
            (self.jac)(t, ypred, &mut self.saved_j);
            self.have_jac = true;
            self.nsetups_since_jac = 0;
        }
        self.nsetups_since_jac += 1;

        let mut m = self.saved_j.clone() * (-gamma);
        for i in 0..self.n {
            m[(i, i)] += T::one();
        }
        let lu = m.lu();
        if !lu.is_invertible() {
            self.factors = None;
            return Err(LinearSolverFailure::Recoverable);
        }
        self.factors = Some(lu);
        Ok(!reuse)
    }

    fn solve(
        &mut self,
        b: &mut DVector<T>,
        _gamma: T,
        _t: T,
        _ycur: &DVector<T>,
        _fcur: &DVector<T>,
        _ewt: &DVector<T>,
    ) -> Result<(), LinearSolverFailure> {
        match &self.factors {
            Some(lu) => {
                if lu.solve_mut(b) {
                    Ok(())
                } else {
                    Err(LinearSolverFailure::Recoverable)
                }
            }
            None => Err(LinearSolverFailure::Unrecoverable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_shifted_system() {
        // J = [[0, 1], [-1, 0]], gamma = 0.5:
        // (I - gamma J) = [[1, -0.5], [0.5, 1]]
        let mut ls = Dense::new(|_t, _y: &DVector<f64>, out: &mut DMatrix<f64>| {
            out[(0, 0)] = 0.0;
            out[(0, 1)] = 1.0;
            out[(1, 0)] = -1.0;
            out[(1, 1)] = 0.0;
        });
        ls.init(2).unwrap();
        let y = DVector::from_vec(vec![0.0, 0.0]);
        let f = y.clone();
        let jcur = ls.setup(0.5, 0.0, &y, &f, ConvFail::NoFailures).unwrap();
        assert!(jcur);

        let mut b = DVector::from_vec(vec![1.0, 2.0]);
        ls.solve(&mut b, 0.5, 0.0, &y, &f, &y).unwrap();
        // solution of [[1,-0.5],[0.5,1]] x = (1,2): x = (1.6, 1.2)
        assert!((b[0] - 1.6).abs() < 1e-14);
        assert!((b[1] - 1.2).abs() < 1e-14);

        // second setup with no failures reuses the saved Jacobian
        let jcur = ls.setup(0.25, 0.0, &y, &f, ConvFail::NoFailures).unwrap();
        assert!(!jcur);
        // a stale-data request forces a refresh
        let jcur = ls.setup(0.25, 0.0, &y, &f, ConvFail::BadJacobian).unwrap();
        assert!(jcur);
    }
}
