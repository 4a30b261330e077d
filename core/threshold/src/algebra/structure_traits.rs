use rand::CryptoRng;
use rand::Rng;

pub trait Zero {
    const ZERO: Self;
}

pub trait One {
    const ONE: Self;
}

/// Sample random element(s)
pub trait Sample {
    fn sample<R: Rng + CryptoRng>(rng: &mut R) -> Self;
}

pub trait Invert: Sized {
    /// Returns the multiplicative inverse, or an error for non-invertible elements.
    fn invert(self) -> anyhow::Result<Self>;
}
