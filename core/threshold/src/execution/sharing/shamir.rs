use rand::{CryptoRng, Rng};

use crate::algebra::poly::Poly;
use crate::algebra::structure_traits::{Invert, One, Zero};
use crate::algebra::zq::Zq;
use crate::error::error_handler::{anyhow_error_and_log, anyhow_error_and_warn_log};

/// A single Shamir share: the evaluation of the sharing polynomial at a public point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Share {
    point: Zq,
    value: Zq,
}

impl Share {
    pub fn new(point: Zq, value: Zq) -> Self {
        Share { point, value }
    }

    pub fn point(&self) -> Zq {
        self.point
    }

    pub fn value(&self) -> Zq {
        self.value
    }
}

/// This data structure holds a collection of Shamir shares, sorted by public point
#[derive(Clone, Default, PartialEq, Debug)]
pub struct ShamirSharings {
    pub shares: Vec<Share>,
}

impl ShamirSharings {
    pub fn new() -> Self {
        ShamirSharings { shares: Vec::new() }
    }

    //Create from shares
    pub fn create(mut shares: Vec<Share>) -> Self {
        shares.sort_by_key(|share| share.point());
        ShamirSharings { shares }
    }

    /// Deal shares of `secret` at the given public points, with a polynomial of degree `threshold - 1`,
    /// so that any `threshold` shares reconstruct the secret.
    pub fn share<R: Rng + CryptoRng>(
        rng: &mut R,
        secret: Zq,
        threshold: usize,
        points: &[Zq],
    ) -> anyhow::Result<Self> {
        if threshold == 0 || threshold > points.len() {
            return Err(anyhow_error_and_log(format!(
                "Cannot share with threshold {threshold} among {} points",
                points.len()
            )));
        }
        let poly = Poly::sample_random_with_fixed_constant(rng, secret, threshold - 1);
        Ok(ShamirSharings::create(
            points
                .iter()
                .map(|point| Share::new(*point, poly.eval(point)))
                .collect(),
        ))
    }

    /// Add a single share in the correct spot to keep ordering
    /// If a share for the same point already exists, we replace it.
    pub fn add_share(&mut self, share: Share) {
        match self
            .shares
            .binary_search_by_key(&share.point(), |s| s.point())
        {
            Ok(pos) => {
                tracing::warn!("Replacing a share for point {}", share.point());
                self.shares[pos] = share
            }
            Err(pos) => self.shares.insert(pos, share),
        }
    }

    pub fn points(&self) -> Vec<Zq> {
        self.shares.iter().map(Share::point).collect()
    }

    /// Interpolate the shared value at zero from all held shares.
    pub fn reconstruct(&self) -> anyhow::Result<Zq> {
        let points = self.points();
        self.shares.iter().try_fold(Zq::ZERO, |acc, share| {
            Ok(acc + lagrange_at_zero(share.point(), &points)? * share.value())
        })
    }
}

/// Lagrange coefficient of `own` at zero for the interpolation set `points`.
///
/// Multiplying a share by its coefficient turns a Shamir share into an additive share
/// of the secret among exactly the nodes of `points`.
pub fn lagrange_at_zero(own: Zq, points: &[Zq]) -> anyhow::Result<Zq> {
    if !points.contains(&own) {
        return Err(anyhow_error_and_warn_log(format!(
            "Point {own} is not part of the interpolation set"
        )));
    }
    let mut numerator = Zq::ONE;
    let mut denominator = Zq::ONE;
    for (idx, point) in points.iter().enumerate() {
        if *point == own {
            continue;
        }
        if points[..idx].contains(point) {
            return Err(anyhow_error_and_warn_log(format!(
                "Duplicate point {point} in the interpolation set"
            )));
        }
        numerator *= *point;
        denominator *= *point - own;
    }
    Ok(numerator * denominator.invert()?)
}
