//! Forward-mode dual numbers.
//!
//! A [`Dual`] carries a value together with its directional derivative along
//! one fixed tangent direction. Code written over `Dual` is differentiated in
//! forward mode by evaluating it once; primitives with their own derivative
//! rule take part through [`crate::CustomJvp::call_dual`].

use std::{
    iter::Sum,
    ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign},
};

use itertools::izip;
use ndarray::ArrayView1;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Dual {
    pub value: f64,
    pub tangent: f64,
}

impl Dual {
    pub fn new(value: f64, tangent: f64) -> Self {
        Self { value, tangent }
    }

    /// A value that does not depend on the differentiation direction.
    pub fn constant(value: f64) -> Self {
        Self::new(value, 0.)
    }

    pub fn exp(self) -> Self {
        let value = self.value.exp();
        Self::new(value, value * self.tangent)
    }

    pub fn ln(self) -> Self {
        Self::new(self.value.ln(), self.tangent / self.value)
    }

    pub fn sqrt(self) -> Self {
        let value = self.value.sqrt();
        Self::new(value, self.tangent / (2. * value))
    }

    pub fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::constant(1.);
        }
        Self::new(
            self.value.powi(n),
            n as f64 * self.value.powi(n - 1) * self.tangent,
        )
    }
}

/// Pair each coordinate of `x` with the matching coordinate of `direction`.
///
/// # Panics
///
/// If the two vectors differ in length.
pub fn seed(x: ArrayView1<f64>, direction: ArrayView1<f64>) -> Vec<Dual> {
    assert_eq!(x.len(), direction.len());
    izip!(x.iter(), direction.iter())
        .map(|(&value, &tangent)| Dual::new(value, tangent))
        .collect()
}

/// Split duals into their values and tangents.
pub fn unzip(x: &[Dual]) -> (Vec<f64>, Vec<f64>) {
    x.iter().map(|d| (d.value, d.tangent)).unzip()
}

impl From<f64> for Dual {
    fn from(value: f64) -> Self {
        Self::constant(value)
    }
}

impl Neg for Dual {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.value, -self.tangent)
    }
}

impl Add for Dual {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.value + rhs.value, self.tangent + rhs.tangent)
    }
}

impl Sub for Dual {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.value - rhs.value, self.tangent - rhs.tangent)
    }
}

impl Mul for Dual {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.value * rhs.value,
            self.tangent * rhs.value + self.value * rhs.tangent,
        )
    }
}

impl Div for Dual {
    type Output = Self;

    fn div(self, rhs: Self) -> Self {
        Self::new(
            self.value / rhs.value,
            (self.tangent * rhs.value - self.value * rhs.tangent) / (rhs.value * rhs.value),
        )
    }
}

impl Add<f64> for Dual {
    type Output = Self;

    fn add(self, rhs: f64) -> Self {
        Self::new(self.value + rhs, self.tangent)
    }
}

impl Sub<f64> for Dual {
    type Output = Self;

    fn sub(self, rhs: f64) -> Self {
        Self::new(self.value - rhs, self.tangent)
    }
}

impl Mul<f64> for Dual {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        Self::new(self.value * rhs, self.tangent * rhs)
    }
}

impl Div<f64> for Dual {
    type Output = Self;

    fn div(self, rhs: f64) -> Self {
        Self::new(self.value / rhs, self.tangent / rhs)
    }
}

impl Mul<Dual> for f64 {
    type Output = Dual;

    fn mul(self, rhs: Dual) -> Dual {
        rhs * self
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl SubAssign for Dual {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl MulAssign for Dual {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl Sum for Dual {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Dual::default(), Add::add)
    }
}
