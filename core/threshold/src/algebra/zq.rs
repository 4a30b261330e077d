use std::ops::{Add, AddAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::structure_traits::{Invert, One, Sample, Zero};
use crate::error::error_handler::anyhow_error_and_log;

/// The Mersenne prime 2^61 - 1.
pub const MODULUS: u64 = (1 << 61) - 1;

/// Element of the prime field of order [MODULUS].
///
/// Values are always kept in canonical form `[0, MODULUS)`, except for values obtained through
/// deserialization, which must be checked with [Zq::is_canonical].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Zq(u64);

impl Zq {
    pub fn new(value: u64) -> Self {
        Zq(value % MODULUS)
    }

    /// Maps a signed integer to its residue.
    pub fn from_i64(value: i64) -> Self {
        Zq(value.rem_euclid(MODULUS as i64) as u64)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_canonical(&self) -> bool {
        self.0 < MODULUS
    }

    /// Representative in `(-MODULUS/2, MODULUS/2]`.
    pub fn centered(&self) -> i64 {
        if self.0 > MODULUS / 2 {
            self.0 as i64 - MODULUS as i64
        } else {
            self.0 as i64
        }
    }

    pub fn pow(self, mut exponent: u64) -> Self {
        let mut base = self;
        let mut acc = Zq::ONE;
        while exponent > 0 {
            if exponent & 1 == 1 {
                acc *= base;
            }
            base *= base;
            exponent >>= 1;
        }
        acc
    }
}

impl Zero for Zq {
    const ZERO: Self = Zq(0);
}

impl One for Zq {
    const ONE: Self = Zq(1);
}

impl Sample for Zq {
    fn sample<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        Zq(rng.gen_range(0..MODULUS))
    }
}

impl Invert for Zq {
    fn invert(self) -> anyhow::Result<Self> {
        if self == Zq::ZERO {
            return Err(anyhow_error_and_log("Cannot invert zero"));
        }
        // Fermat: a^(p-2) = a^-1 mod p
        Ok(self.pow(MODULUS - 2))
    }
}

impl From<u64> for Zq {
    fn from(value: u64) -> Self {
        Zq::new(value)
    }
}

impl Zeroize for Zq {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Display for Zq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Zq {
    type Output = Zq;
    fn add(self, rhs: Zq) -> Zq {
        let sum = self.0 + rhs.0;
        if sum >= MODULUS {
            Zq(sum - MODULUS)
        } else {
            Zq(sum)
        }
    }
}

impl AddAssign for Zq {
    fn add_assign(&mut self, rhs: Zq) {
        *self = *self + rhs;
    }
}

impl Sub for Zq {
    type Output = Zq;
    fn sub(self, rhs: Zq) -> Zq {
        self + (-rhs)
    }
}

impl SubAssign for Zq {
    fn sub_assign(&mut self, rhs: Zq) {
        *self = *self - rhs;
    }
}

impl Neg for Zq {
    type Output = Zq;
    fn neg(self) -> Zq {
        if self.0 == 0 {
            self
        } else {
            Zq(MODULUS - self.0)
        }
    }
}

impl Mul for Zq {
    type Output = Zq;
    fn mul(self, rhs: Zq) -> Zq {
        Zq(((self.0 as u128 * rhs.0 as u128) % MODULUS as u128) as u64)
    }
}

impl MulAssign for Zq {
    fn mul_assign(&mut self, rhs: Zq) {
        *self = *self * rhs;
    }
}

impl std::iter::Sum for Zq {
    fn sum<I: Iterator<Item = Zq>>(iter: I) -> Zq {
        iter.fold(Zq::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Zq> for Zq {
    fn sum<I: Iterator<Item = &'a Zq>>(iter: I) -> Zq {
        iter.fold(Zq::ZERO, |acc, x| acc + *x)
    }
}
