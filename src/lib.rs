//! A variable-order, variable-step Adams/BDF multistep integrator for stiff
//! and nonstiff ordinary differential equations `y' = f(t, y)`.
//!
//! The integrator advances an initial value problem while controlling the
//! local truncation error, adapting both the step size and the method order,
//! and solving the implicit algebraic system of each step by functional
//! iteration or by a modified Newton iteration backed by a pluggable
//! [`LinearSolver`].
//!
//! The solution history is carried in Nordsieck (scaled-derivative) form,
//! which makes step-size changes a cheap column rescale and gives dense
//! output at any point of the last step interval via [`Solver::interpolate`].
//!
//! ```
//! use multistep::{Itask, IterKind, Method, Solver, Tolerances};
//! use nalgebra::DVector;
//!
//! let mut solver = Solver::new(Method::Adams, IterKind::Functional);
//! solver
//!     .init(
//!         |_t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>| ydot[0] = -y[0],
//!         0.0,
//!         &DVector::from_vec(vec![1.0]),
//!         Tolerances::ScalarScalar { rtol: 1e-6, atol: 1e-8 },
//!     )
//!     .unwrap();
//!
//! let mut y = DVector::zeros(1);
//! let (t, _status) = solver.step(1.0, &mut y, Itask::Normal).unwrap();
//! assert!((y[0] - (-t).exp()).abs() < 1e-5);
//! ```

pub mod error;
mod history;
pub mod linear;
mod scalar;
pub mod solver;
mod vector;

pub use error::{Error, LinearSolverFailure};
pub use linear::dense::Dense;
pub use linear::{ConvFail, LinearSolver};
pub use scalar::{IndexType, Scalar};
pub use solver::{
    Itask, IterKind, Method, OdeRhs, Solver, Statistics, StepStatus, Tolerances, ADAMS_Q_MAX,
    BDF_Q_MAX,
};
pub use vector::Vector;
