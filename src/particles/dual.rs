//! Forward-mode dual numbers. Propagating (value, derivative) pairs
//! through the plasma momentum function yields the Jacobian terms the
//! substepped pusher needs for its second-order Taylor update, without a
//! hand-written derivative of the force law.

use std::ops::{Add, Div, Mul, Neg, Sub};

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct DualNumber {
    pub value: f64,
    pub epsilon: f64,
}

impl DualNumber {
    pub fn new(value: f64, epsilon: f64) -> DualNumber {
        DualNumber { value, epsilon }
    }

    pub fn constant(value: f64) -> DualNumber {
        DualNumber { value, epsilon: 0.0 }
    }
}

impl Add for DualNumber {
    type Output = DualNumber;
    fn add(self, rhs: DualNumber) -> DualNumber {
        DualNumber::new(self.value + rhs.value, self.epsilon + rhs.epsilon)
    }
}

impl Sub for DualNumber {
    type Output = DualNumber;
    fn sub(self, rhs: DualNumber) -> DualNumber {
        DualNumber::new(self.value - rhs.value, self.epsilon - rhs.epsilon)
    }
}

impl Mul for DualNumber {
    type Output = DualNumber;
    fn mul(self, rhs: DualNumber) -> DualNumber {
        DualNumber::new(
            self.value * rhs.value,
            self.value * rhs.epsilon + self.epsilon * rhs.value,
        )
    }
}

impl Div for DualNumber {
    type Output = DualNumber;
    fn div(self, rhs: DualNumber) -> DualNumber {
        let inv = 1.0 / rhs.value;
        DualNumber::new(
            self.value * inv,
            (self.epsilon - self.value * rhs.epsilon * inv) * inv,
        )
    }
}

impl Neg for DualNumber {
    type Output = DualNumber;
    fn neg(self) -> DualNumber {
        DualNumber::new(-self.value, -self.epsilon)
    }
}

impl Add<f64> for DualNumber {
    type Output = DualNumber;
    fn add(self, rhs: f64) -> DualNumber {
        DualNumber::new(self.value + rhs, self.epsilon)
    }
}

impl Sub<f64> for DualNumber {
    type Output = DualNumber;
    fn sub(self, rhs: f64) -> DualNumber {
        DualNumber::new(self.value - rhs, self.epsilon)
    }
}

impl Mul<f64> for DualNumber {
    type Output = DualNumber;
    fn mul(self, rhs: f64) -> DualNumber {
        DualNumber::new(self.value * rhs, self.epsilon * rhs)
    }
}

impl Mul<DualNumber> for f64 {
    type Output = DualNumber;
    fn mul(self, rhs: DualNumber) -> DualNumber {
        DualNumber::new(self * rhs.value, self * rhs.epsilon)
    }
}

impl Add<DualNumber> for f64 {
    type Output = DualNumber;
    fn add(self, rhs: DualNumber) -> DualNumber {
        DualNumber::new(self + rhs.value, rhs.epsilon)
    }
}

/// The scalar interface the momentum function is generic over: plain
/// reals for the value pass, dual numbers for the derivative pass.
pub trait PushScalar:
    Copy
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Mul<f64, Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
{
    fn from_real(v: f64) -> Self;
    fn scale(self, f: f64) -> Self;
}

impl PushScalar for f64 {
    fn from_real(v: f64) -> f64 {
        v
    }
    fn scale(self, f: f64) -> f64 {
        self * f
    }
}

impl PushScalar for DualNumber {
    fn from_real(v: f64) -> DualNumber {
        DualNumber::constant(v)
    }
    fn scale(self, f: f64) -> DualNumber {
        self * f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_rule() {
        // f(x) = x^2 at x = 3: f' = 6
        let x = DualNumber::new(3.0, 1.0);
        let f = x * x;
        assert!((f.value - 9.0).abs() < 1.0e-14);
        assert!((f.epsilon - 6.0).abs() < 1.0e-14);
    }

    #[test]
    fn quotient_rule() {
        // f(x) = 1/x at x = 2: f' = -1/4
        let x = DualNumber::new(2.0, 1.0);
        let f = DualNumber::constant(1.0) / x;
        assert!((f.value - 0.5).abs() < 1.0e-14);
        assert!((f.epsilon + 0.25).abs() < 1.0e-14);
    }

    #[test]
    fn chain_through_rational_function() {
        // f(x) = (x + 2) / (x * x - 1) at x = 2, f = 4/3
        // f' = [ (x^2-1) - (x+2) 2x ] / (x^2-1)^2 = (3 - 16)/9
        let x = DualNumber::new(2.0, 1.0);
        let f = (x + 2.0) / (x * x - 1.0);
        assert!((f.value - 4.0 / 3.0).abs() < 1.0e-14);
        assert!((f.epsilon + 13.0 / 9.0).abs() < 1.0e-14);
    }
}
