use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};

use super::structure_traits::{Sample, Zero};
use super::zq::Zq;

/// Polynomial over [Zq] with coefficients in ascending degree order.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poly {
    pub coefs: Vec<Zq>,
}

impl Poly {
    pub fn from_coefs(coefs: Vec<Zq>) -> Self {
        Poly { coefs }
    }

    /// Random polynomial of the given degree whose constant term is `zero_coef`.
    pub fn sample_random_with_fixed_constant<R: Rng + CryptoRng>(
        rng: &mut R,
        zero_coef: Zq,
        degree: usize,
    ) -> Self {
        let mut coefs = Vec::with_capacity(degree + 1);
        coefs.push(zero_coef);
        coefs.extend((0..degree).map(|_| Zq::sample(rng)));
        Poly { coefs }
    }

    pub fn deg(&self) -> usize {
        self.coefs.len().saturating_sub(1)
    }

    /// Horner evaluation.
    pub fn eval(&self, point: &Zq) -> Zq {
        self.coefs
            .iter()
            .rev()
            .fold(Zq::ZERO, |acc, coef| acc * *point + *coef)
    }
}
