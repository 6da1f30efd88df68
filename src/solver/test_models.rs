//! Shared problem fixtures for the solver tests.

use nalgebra::{DMatrix, DVector};

pub type V = DVector<f64>;
pub type M = DMatrix<f64>;

/// `y' = -y`, `y(t) = e^{-t}·y0`.
pub fn decay_rhs(_t: f64, y: &V, ydot: &mut V) {
    ydot[0] = -y[0];
}

pub fn decay_jac(_t: f64, _y: &V, jac: &mut M) {
    jac[(0, 0)] = -1.0;
}

/// `y1' = y2`, `y2' = -y1`; with `y(0) = (1, 0)` the orbit is
/// `(cos t, -sin t)`, returning to `(1, 0)` at `t = 2π`.
pub fn oscillator_rhs(_t: f64, y: &V, ydot: &mut V) {
    ydot[0] = y[1];
    ydot[1] = -y[0];
}

/// `y' = cos t`, `y(t) = sin t`; smooth forcing that rewards high orders.
pub fn cosine_rhs(t: f64, _y: &V, ydot: &mut V) {
    ydot[0] = t.cos();
}

/// Van der Pol oscillator `y1' = y2`, `y2' = μ(1 − y1²)y2 − y1`; stiff for
/// large `μ`.
pub fn van_der_pol_rhs(mu: f64) -> impl FnMut(f64, &V, &mut V) {
    move |_t, y: &V, ydot: &mut V| {
        ydot[0] = y[1];
        ydot[1] = mu * (1.0 - y[0] * y[0]) * y[1] - y[0];
    }
}

pub fn van_der_pol_jac(mu: f64) -> impl FnMut(f64, &V, &mut M) {
    move |_t, y: &V, jac: &mut M| {
        jac[(0, 0)] = 0.0;
        jac[(0, 1)] = 1.0;
        jac[(1, 0)] = -2.0 * mu * y[0] * y[1] - 1.0;
        jac[(1, 1)] = mu * (1.0 - y[0] * y[0]);
    }
}
