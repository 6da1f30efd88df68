use nalgebra::RealField;
use num_traits::{One, Zero};
use std::fmt::{Debug, Display};

pub type IndexType = usize;

/// Real scalar type of the integrator. `f64` is the shipped instance; the
/// bound exists so that vector backends with their own element types can be
/// plugged in underneath the [`Vector`](crate::Vector) façade.
pub trait Scalar:
    RealField + Zero + One + Copy + From<f64> + Into<f64> + Debug + Display
{
    /// Unit roundoff of the type.
    const EPSILON: Self;
    const INFINITY: Self;

    fn is_finite(self) -> bool;

    fn max(self, other: Self) -> Self {
        if self > other {
            self
        } else {
            other
        }
    }

    fn min(self, other: Self) -> Self {
        if self < other {
            self
        } else {
            other
        }
    }
}

impl Scalar for f64 {
    const EPSILON: Self = f64::EPSILON;
    const INFINITY: Self = f64::INFINITY;

    fn is_finite(self) -> bool {
        f64::is_finite(self)
    }
}
