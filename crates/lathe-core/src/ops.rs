//! Tensor kernels: elementwise arithmetic and broadcasting reductions.
//!
//! Every elementwise kernel comes in three strategies:
//! - value-producing (`unary`, `binary`) allocates a fresh result
//! - in-place variants are suffixed with `_` and overwrite `self`
//! - `_into` variants write into a caller-supplied buffer of the right layout

pub mod elementwise;
pub mod reduction;

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Float element types the host kernels are generic over.
pub trait Real:
    Copy
    + Send
    + Sync
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    fn zero() -> Self;
    fn one() -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn ln_1p(self) -> Self;
    fn exp_m1(self) -> Self;
    fn sqrt(self) -> Self;
}

macro_rules! impl_real {
    ($($t:ty),*) => {
        $(
            impl Real for $t {
                fn zero() -> Self { 0.0 }
                fn one() -> Self { 1.0 }
                fn exp(self) -> Self { <$t>::exp(self) }
                fn ln(self) -> Self { <$t>::ln(self) }
                fn ln_1p(self) -> Self { <$t>::ln_1p(self) }
                fn exp_m1(self) -> Self { <$t>::exp_m1(self) }
                fn sqrt(self) -> Self { <$t>::sqrt(self) }
            }
        )*
    };
}

impl_real!(f32, f64);

/// Element types the binary and reduction kernels accept.
///
/// Integer arithmetic wraps on overflow. Division by zero is rejected by the
/// kernels before any element is computed.
pub trait Arith: Copy + Send + Sync + PartialEq + 'static {
    const ZERO: Self;

    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn div(self, rhs: Self) -> Self;

    /// Whether dividing by this value is an error rather than a value.
    fn is_zero_divisor(self) -> bool;
}

macro_rules! impl_arith_float {
    ($($t:ty),*) => {
        $(
            impl Arith for $t {
                const ZERO: Self = 0.0;
                fn add(self, rhs: Self) -> Self { self + rhs }
                fn sub(self, rhs: Self) -> Self { self - rhs }
                fn mul(self, rhs: Self) -> Self { self * rhs }
                fn div(self, rhs: Self) -> Self { self / rhs }
                fn is_zero_divisor(self) -> bool { false }
            }
        )*
    };
}

macro_rules! impl_arith_int {
    ($($t:ty),*) => {
        $(
            impl Arith for $t {
                const ZERO: Self = 0;
                fn add(self, rhs: Self) -> Self { self.wrapping_add(rhs) }
                fn sub(self, rhs: Self) -> Self { self.wrapping_sub(rhs) }
                fn mul(self, rhs: Self) -> Self { self.wrapping_mul(rhs) }
                fn div(self, rhs: Self) -> Self {
                    if rhs == 0 { 0 } else { self.wrapping_div(rhs) }
                }
                fn is_zero_divisor(self) -> bool { self == 0 }
            }
        )*
    };
}

impl_arith_float!(f32, f64);
impl_arith_int!(i32, i64);

/// Elementwise unary kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryKind {
    Neg,
    Exp,
    Log,
    Log1p,
    Expm1,
    Sqrt,
    Square,
    Recip,
}

impl UnaryKind {
    pub fn name(&self) -> &'static str {
        match self {
            UnaryKind::Neg => "neg",
            UnaryKind::Exp => "exp",
            UnaryKind::Log => "log",
            UnaryKind::Log1p => "log1p",
            UnaryKind::Expm1 => "expm1",
            UnaryKind::Sqrt => "sqrt",
            UnaryKind::Square => "square",
            UnaryKind::Recip => "recip",
        }
    }

    #[inline]
    pub fn apply<T: Real>(self, x: T) -> T {
        match self {
            UnaryKind::Neg => -x,
            UnaryKind::Exp => x.exp(),
            UnaryKind::Log => x.ln(),
            UnaryKind::Log1p => x.ln_1p(),
            UnaryKind::Expm1 => x.exp_m1(),
            UnaryKind::Sqrt => x.sqrt(),
            UnaryKind::Square => x * x,
            UnaryKind::Recip => T::one() / x,
        }
    }
}

impl fmt::Display for UnaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Elementwise binary kernels (broadcasting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryKind {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryKind::Add => "add",
            BinaryKind::Sub => "sub",
            BinaryKind::Mul => "mul",
            BinaryKind::Div => "div",
        }
    }

    /// Infix symbol used in graph listings.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryKind::Add => "+",
            BinaryKind::Sub => "-",
            BinaryKind::Mul => "*",
            BinaryKind::Div => "/",
        }
    }

    #[inline]
    pub fn apply<T: Arith>(self, a: T, b: T) -> T {
        match self {
            BinaryKind::Add => Arith::add(a, b),
            BinaryKind::Sub => Arith::sub(a, b),
            BinaryKind::Mul => Arith::mul(a, b),
            BinaryKind::Div => Arith::div(a, b),
        }
    }
}

impl fmt::Display for BinaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unary_apply() {
        assert_eq!(UnaryKind::Neg.apply(2.0f64), -2.0);
        assert_eq!(UnaryKind::Square.apply(3.0f32), 9.0);
        assert_eq!(UnaryKind::Recip.apply(4.0f64), 0.25);
        assert_eq!(UnaryKind::Log1p.apply(0.0f64), 0.0);
    }

    #[test]
    fn test_binary_apply() {
        assert_eq!(BinaryKind::Sub.apply(5.0f64, 3.0), 2.0);
        assert_eq!(BinaryKind::Div.apply(1.0f32, 4.0), 0.25);
        assert_eq!(BinaryKind::Mul.symbol(), "*");
    }

    #[test]
    fn test_integer_apply_wraps() {
        assert_eq!(BinaryKind::Div.apply(7i32, 2), 3);
        assert_eq!(BinaryKind::Div.apply(-7i64, 2), -3);
        assert_eq!(BinaryKind::Add.apply(i32::MAX, 1), i32::MIN);
        assert_eq!(BinaryKind::Div.apply(i32::MIN, -1), i32::MIN);
        assert!(0i64.is_zero_divisor());
        assert!(!0.0f32.is_zero_divisor());
    }
}
