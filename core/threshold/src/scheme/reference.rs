//! Slot-wise reference instance of the scheme interfaces.
//!
//! Ciphertexts are vectors of field elements that decrypt linearly with the collective secret
//! `s`: `c0 + c1*s (+ c2*s^2)` equals the encoded plaintext, slot by slot. There is no lattice
//! noise, which makes the scheme **insecure**: it exists to exercise the threshold protocols and
//! the circuit runtime end-to-end with exact, checkable results. The only noise is the smudging
//! noise of partial decryptions, a multiple of the plaintext modulus that disappears on decoding.

use std::collections::BTreeMap;

use aes_prng::AesRng;
use rand::{CryptoRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{AggregatedResult, Evaluator, GaloisElement, MheScheme, ShareInput};
use crate::algebra::poly::Poly;
use crate::algebra::structure_traits::{One, Sample, Zero};
use crate::algebra::zq::{Zq, MODULUS};
use crate::error::error_handler::{anyhow_error_and_log, anyhow_error_and_warn_log};
use crate::execution::sharing::shamir::lagrange_at_zero;
use crate::hashing::{hash_list_w_size, DomainSep};

const DSEP_CRS_CPK: DomainSep = *b"CRS_CPK_";
const DSEP_CRS_GAL: DomainSep = *b"CRS_GAL_";

/// Largest `log_slots` accepted by [ReferenceScheme::new].
pub const MAX_LOG_SLOTS: u32 = 16;
/// Plaintext moduli must stay below this bound so that products of two plaintexts fit the field.
pub const MAX_PLAINTEXT_MODULUS: u64 = 1 << 24;
/// Smudging samples are cut at this many standard deviations.
pub const SMUDGING_TAIL: f64 = 6.0;
/// Upper bound on the smudging noise contributed by a single partial decryption.
pub const MAX_SHARE_NOISE: u128 = 1 << 44;
/// Ciphertexts whose magnitude bound reaches this value can no longer be decrypted.
pub const DECRYPTION_BOUND: u128 = (MODULUS / 2) as u128;

type Slots = Vec<Zq>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceParameters {
    pub log_slots: u32,
    pub plaintext_modulus: u64,
}

impl Default for ReferenceParameters {
    fn default() -> Self {
        ReferenceParameters {
            log_slots: 4,
            plaintext_modulus: 65537,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretShare {
    pub point: Zq,
    pub values: Slots,
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AdditiveSecret(Slots);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plaintext {
    pub values: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    parts: Vec<Slots>,
    /// Upper bound on the absolute value of the integer this ciphertext decrypts to.
    bound: u128,
}

impl Ciphertext {
    pub fn degree(&self) -> usize {
        self.parts.len().saturating_sub(1)
    }

    pub fn bound(&self) -> u128 {
        self.bound
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    b: Slots,
    a: Slots,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelinKey {
    k0: Slots,
    k1: Slots,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaloisKey {
    element: GaloisElement,
    g0: Slots,
    g1: Slots,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceShare {
    Single(Slots),
    Pair(Slots, Slots),
}

#[derive(Clone, Debug)]
pub struct ReferenceScheme {
    parameters: ReferenceParameters,
    slots: usize,
}

fn add(lhs: &[Zq], rhs: &[Zq]) -> Slots {
    lhs.iter().zip(rhs).map(|(a, b)| *a + *b).collect()
}

fn sub(lhs: &[Zq], rhs: &[Zq]) -> Slots {
    lhs.iter().zip(rhs).map(|(a, b)| *a - *b).collect()
}

fn hadamard(lhs: &[Zq], rhs: &[Zq]) -> Slots {
    lhs.iter().zip(rhs).map(|(a, b)| *a * *b).collect()
}

fn rotate(values: &[Zq], steps: usize) -> Slots {
    let n = values.len();
    (0..n).map(|i| values[(i + steps) % n]).collect()
}

fn sum_slots<'a>(slots: usize, vectors: impl Iterator<Item = &'a Slots>) -> Slots {
    vectors.fold(vec![Zq::ZERO; slots], |acc, v| add(&acc, v))
}

impl ReferenceScheme {
    fn check_slots(&self, values: &[Zq], what: &str) -> anyhow::Result<()> {
        if values.len() != self.slots {
            return Err(anyhow_error_and_warn_log(format!(
                "{what} has {} slots, expected {}",
                values.len(),
                self.slots
            )));
        }
        if values.iter().any(|v| !v.is_canonical()) {
            return Err(anyhow_error_and_warn_log(format!(
                "{what} contains non-canonical field elements"
            )));
        }
        Ok(())
    }

    fn check_ciphertext(&self, ciphertext: &Ciphertext, max_degree: usize) -> anyhow::Result<()> {
        if ciphertext.parts.len() < 2 || ciphertext.degree() > max_degree {
            return Err(anyhow_error_and_warn_log(format!(
                "Ciphertext of degree {} is not supported here (max {max_degree})",
                ciphertext.degree()
            )));
        }
        for part in &ciphertext.parts {
            self.check_slots(part, "Ciphertext")?;
        }
        Ok(())
    }

    fn check_budget(&self, bound: u128) -> anyhow::Result<()> {
        if bound >= DECRYPTION_BOUND {
            return Err(anyhow_error_and_log(format!(
                "Noise budget exhausted: magnitude bound {bound} exceeds {DECRYPTION_BOUND}"
            )));
        }
        Ok(())
    }

    /// Common reference vector derived from the session's public seed.
    fn common_random(&self, dsep: &DomainSep, seed: &[u8], tag: u64) -> Slots {
        let tag_bytes = tag.to_le_bytes();
        let parts: [&[u8]; 2] = [seed, &tag_bytes];
        let mut rng_seed = <AesRng as SeedableRng>::Seed::default();
        let seed_len = rng_seed.as_mut().len();
        let digest = hash_list_w_size(dsep, &parts[..], seed_len);
        rng_seed.as_mut().copy_from_slice(&digest);
        let mut rng = AesRng::from_seed(rng_seed);
        (0..self.slots).map(|_| Zq::sample(&mut rng)).collect()
    }

    fn share_noise_bound(&self, smudging: f64) -> anyhow::Result<u128> {
        if !smudging.is_finite() || smudging < 0.0 {
            return Err(anyhow_error_and_warn_log(format!(
                "Invalid smudging deviation {smudging}"
            )));
        }
        let bound = (smudging * SMUDGING_TAIL).ceil() as u128 * self.parameters.plaintext_modulus as u128;
        if bound > MAX_SHARE_NOISE {
            return Err(anyhow_error_and_warn_log(format!(
                "Smudging deviation {smudging} exceeds the supported noise bound"
            )));
        }
        Ok(bound)
    }

    fn smudging_noise<R: Rng + CryptoRng>(&self, smudging: f64, rng: &mut R) -> anyhow::Result<Slots> {
        self.share_noise_bound(smudging)?;
        if smudging == 0.0 {
            return Ok(vec![Zq::ZERO; self.slots]);
        }
        let normal = Normal::new(0.0, smudging)
            .map_err(|e| anyhow_error_and_log(format!("Smudging distribution: {e}")))?;
        let tail = (smudging * SMUDGING_TAIL).ceil();
        let modulus = self.parameters.plaintext_modulus as i64;
        Ok((0..self.slots)
            .map(|_| {
                let e = rng.sample(normal).round().clamp(-tail, tail) as i64;
                Zq::from_i64(e * modulus)
            })
            .collect())
    }

    fn decode_slots(&self, values: &[Zq]) -> Plaintext {
        let modulus = self.parameters.plaintext_modulus as i64;
        Plaintext {
            values: values
                .iter()
                .map(|v| v.centered().rem_euclid(modulus) as u64)
                .collect(),
        }
    }

    fn single<'a>(&self, share: &'a ReferenceShare) -> anyhow::Result<&'a Slots> {
        match share {
            ReferenceShare::Single(v) => Ok(v),
            ReferenceShare::Pair(..) => Err(anyhow_error_and_warn_log(
                "Expected a single-vector share, got a pair",
            )),
        }
    }
}

impl MheScheme for ReferenceScheme {
    type Parameters = ReferenceParameters;
    type SecretShare = SecretShare;
    type AdditiveSecret = AdditiveSecret;
    type Plaintext = Plaintext;
    type Ciphertext = Ciphertext;
    type PublicKey = PublicKey;
    type RelinKey = RelinKey;
    type GaloisKey = GaloisKey;
    type Share = ReferenceShare;
    type Evaluator = ReferenceEvaluator;

    fn new(parameters: ReferenceParameters) -> anyhow::Result<Self> {
        if parameters.log_slots == 0 || parameters.log_slots > MAX_LOG_SLOTS {
            return Err(anyhow_error_and_log(format!(
                "log_slots must be in 1..={MAX_LOG_SLOTS}, got {}",
                parameters.log_slots
            )));
        }
        if parameters.plaintext_modulus < 2 || parameters.plaintext_modulus >= MAX_PLAINTEXT_MODULUS {
            return Err(anyhow_error_and_log(format!(
                "plaintext modulus must be in 2..{MAX_PLAINTEXT_MODULUS}, got {}",
                parameters.plaintext_modulus
            )));
        }
        let slots = 1 << parameters.log_slots;
        Ok(ReferenceScheme { parameters, slots })
    }

    fn parameters(&self) -> &ReferenceParameters {
        &self.parameters
    }

    fn slots(&self) -> usize {
        self.slots
    }

    fn plaintext_modulus(&self) -> u64 {
        self.parameters.plaintext_modulus
    }

    fn galois_element(&self, steps: usize) -> GaloisElement {
        GaloisElement((steps % self.slots) as u64)
    }

    fn validate_secret_share(&self, share: &SecretShare, point: Zq) -> anyhow::Result<()> {
        if share.point != point {
            return Err(anyhow_error_and_warn_log(format!(
                "Secret share is for point {}, expected {point}",
                share.point
            )));
        }
        self.check_slots(&share.values, "Secret share")
    }

    fn to_additive(
        &self,
        share: &SecretShare,
        point: Zq,
        participants: &[Zq],
    ) -> anyhow::Result<AdditiveSecret> {
        self.validate_secret_share(share, point)?;
        let lambda = lagrange_at_zero(point, participants)?;
        Ok(AdditiveSecret(
            share.values.iter().map(|v| *v * lambda).collect(),
        ))
    }

    fn gen_test_secret_shares<R: Rng + CryptoRng>(
        &self,
        threshold: usize,
        points: &[Zq],
        rng: &mut R,
    ) -> anyhow::Result<Vec<SecretShare>> {
        if threshold == 0 || threshold > points.len() {
            return Err(anyhow_error_and_log(format!(
                "Cannot deal secret shares with threshold {threshold} among {} nodes",
                points.len()
            )));
        }
        let mut shares: Vec<SecretShare> = points
            .iter()
            .map(|point| SecretShare {
                point: *point,
                values: Vec::with_capacity(self.slots),
            })
            .collect();
        for _ in 0..self.slots {
            let secret = Zq::sample(rng);
            let poly = Poly::sample_random_with_fixed_constant(rng, secret, threshold - 1);
            for share in shares.iter_mut() {
                share.values.push(poly.eval(&share.point));
            }
        }
        Ok(shares)
    }

    fn gen_share<R: Rng + CryptoRng>(
        &self,
        input: &ShareInput<'_, Self>,
        secret: &AdditiveSecret,
        rng: &mut R,
    ) -> anyhow::Result<ReferenceShare> {
        let s = &secret.0;
        self.check_slots(s, "Additive secret")?;
        match input {
            ShareInput::PublicKey { seed } => {
                let a = self.common_random(&DSEP_CRS_CPK, seed, 0);
                let neg_a: Slots = a.iter().map(|v| -*v).collect();
                Ok(ReferenceShare::Single(hadamard(&neg_a, s)))
            }
            ShareInput::RelinKey { public_key, .. } => {
                // encryption of s under the collective key, scaled by the own share of s
                let shifted: Slots = public_key.a.iter().map(|v| *v + Zq::ONE).collect();
                Ok(ReferenceShare::Pair(
                    hadamard(s, &public_key.b),
                    hadamard(s, &shifted),
                ))
            }
            ShareInput::GaloisKey { seed, element } => {
                let g1 = self.common_random(&DSEP_CRS_GAL, seed, element.0);
                Ok(ReferenceShare::Single(sub(
                    &rotate(s, element.0 as usize),
                    &hadamard(&g1, s),
                )))
            }
            ShareInput::Decrypt {
                ciphertext,
                smudging,
                ..
            } => {
                self.check_ciphertext(ciphertext, 1)?;
                let noise = self.smudging_noise(*smudging, rng)?;
                Ok(ReferenceShare::Single(add(
                    &hadamard(&ciphertext.parts[1], s),
                    &noise,
                )))
            }
        }
    }

    fn check_share(&self, input: &ShareInput<'_, Self>, share: &ReferenceShare) -> anyhow::Result<()> {
        match (input, share) {
            (ShareInput::RelinKey { .. }, ReferenceShare::Pair(k0, k1)) => {
                self.check_slots(k0, "Share")?;
                self.check_slots(k1, "Share")
            }
            (ShareInput::RelinKey { .. }, ReferenceShare::Single(_)) => Err(
                anyhow_error_and_warn_log("Relinearization key share must be a pair"),
            ),
            (_, share) => self.check_slots(self.single(share)?, "Share"),
        }
    }

    fn aggregate(
        &self,
        input: &ShareInput<'_, Self>,
        shares: &[ReferenceShare],
    ) -> anyhow::Result<AggregatedResult<Self>> {
        for share in shares {
            self.check_share(input, share)?;
        }
        if shares.is_empty() && !matches!(input, ShareInput::Decrypt { .. }) {
            return Err(anyhow_error_and_log("Cannot aggregate an empty set of shares"));
        }
        match input {
            ShareInput::PublicKey { seed } => {
                let singles = shares.iter().map(|s| self.single(s)).collect::<anyhow::Result<Vec<_>>>()?;
                Ok(AggregatedResult::PublicKey(PublicKey {
                    b: sum_slots(self.slots, singles.into_iter()),
                    a: self.common_random(&DSEP_CRS_CPK, seed, 0),
                }))
            }
            ShareInput::RelinKey { .. } => {
                let mut k0 = vec![Zq::ZERO; self.slots];
                let mut k1 = vec![Zq::ZERO; self.slots];
                for share in shares {
                    if let ReferenceShare::Pair(s0, s1) = share {
                        k0 = add(&k0, s0);
                        k1 = add(&k1, s1);
                    }
                }
                Ok(AggregatedResult::RelinKey(RelinKey { k0, k1 }))
            }
            ShareInput::GaloisKey { seed, element } => {
                let singles = shares.iter().map(|s| self.single(s)).collect::<anyhow::Result<Vec<_>>>()?;
                Ok(AggregatedResult::GaloisKey(GaloisKey {
                    element: *element,
                    g0: sum_slots(self.slots, singles.into_iter()),
                    g1: self.common_random(&DSEP_CRS_GAL, seed, element.0),
                }))
            }
            ShareInput::Decrypt {
                ciphertext,
                smudging,
                receiver_local,
            } => {
                self.check_ciphertext(ciphertext, 1)?;
                let noise = self.share_noise_bound(*smudging)? * shares.len() as u128;
                let bound = ciphertext.bound.saturating_add(noise);
                self.check_budget(bound)?;
                let singles = shares.iter().map(|s| self.single(s)).collect::<anyhow::Result<Vec<_>>>()?;
                let c0 = add(&ciphertext.parts[0], &sum_slots(self.slots, singles.into_iter()));
                if *receiver_local {
                    Ok(AggregatedResult::Switched(Ciphertext {
                        parts: vec![c0, ciphertext.parts[1].clone()],
                        bound,
                    }))
                } else {
                    Ok(AggregatedResult::Plaintext(self.decode_slots(&c0)))
                }
            }
        }
    }

    fn finish_decryption(
        &self,
        switched: &Ciphertext,
        secret: &AdditiveSecret,
    ) -> anyhow::Result<Plaintext> {
        self.check_ciphertext(switched, 1)?;
        self.check_budget(switched.bound)?;
        let values = add(&switched.parts[0], &hadamard(&switched.parts[1], &secret.0));
        Ok(self.decode_slots(&values))
    }

    fn encode(&self, values: &[u64]) -> anyhow::Result<Plaintext> {
        if values.len() > self.slots {
            return Err(anyhow_error_and_warn_log(format!(
                "Cannot encode {} values into {} slots",
                values.len(),
                self.slots
            )));
        }
        let mut encoded: Vec<u64> = values
            .iter()
            .map(|v| v % self.parameters.plaintext_modulus)
            .collect();
        encoded.resize(self.slots, 0);
        Ok(Plaintext { values: encoded })
    }

    fn decode(&self, plaintext: &Plaintext) -> Vec<u64> {
        plaintext.values.clone()
    }

    fn encrypt<R: Rng + CryptoRng>(
        &self,
        public_key: &PublicKey,
        plaintext: &Plaintext,
        rng: &mut R,
    ) -> anyhow::Result<Ciphertext> {
        self.check_slots(&public_key.a, "Public key")?;
        self.check_slots(&public_key.b, "Public key")?;
        if plaintext.values.len() != self.slots {
            return Err(anyhow_error_and_warn_log("Plaintext is not fully encoded"));
        }
        let u: Slots = (0..self.slots).map(|_| Zq::sample(rng)).collect();
        let m: Slots = plaintext.values.iter().map(|v| Zq::new(*v)).collect();
        Ok(Ciphertext {
            parts: vec![add(&m, &hadamard(&u, &public_key.b)), hadamard(&u, &public_key.a)],
            bound: self.parameters.plaintext_modulus as u128 - 1,
        })
    }

    fn evaluator(
        &self,
        relin_key: Option<RelinKey>,
        galois_keys: BTreeMap<GaloisElement, GaloisKey>,
    ) -> ReferenceEvaluator {
        ReferenceEvaluator {
            scheme: self.clone(),
            relin_key,
            galois_keys,
        }
    }
}

pub struct ReferenceEvaluator {
    scheme: ReferenceScheme,
    relin_key: Option<RelinKey>,
    galois_keys: BTreeMap<GaloisElement, GaloisKey>,
}

impl Evaluator for ReferenceEvaluator {
    type Ciphertext = Ciphertext;

    fn add(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> anyhow::Result<Ciphertext> {
        self.scheme.check_ciphertext(lhs, 2)?;
        self.scheme.check_ciphertext(rhs, 2)?;
        let (long, short) = if lhs.parts.len() >= rhs.parts.len() {
            (lhs, rhs)
        } else {
            (rhs, lhs)
        };
        let mut parts = long.parts.clone();
        for (part, other) in parts.iter_mut().zip(&short.parts) {
            *part = add(part, other);
        }
        let bound = lhs.bound.saturating_add(rhs.bound);
        self.scheme.check_budget(bound)?;
        Ok(Ciphertext { parts, bound })
    }

    fn mul(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> anyhow::Result<Ciphertext> {
        self.scheme.check_ciphertext(lhs, 1)?;
        self.scheme.check_ciphertext(rhs, 1)?;
        let bound = lhs.bound.saturating_mul(rhs.bound);
        self.scheme.check_budget(bound)?;
        let (c0, c1) = (&lhs.parts[0], &lhs.parts[1]);
        let (d0, d1) = (&rhs.parts[0], &rhs.parts[1]);
        Ok(Ciphertext {
            parts: vec![
                hadamard(c0, d0),
                add(&hadamard(c0, d1), &hadamard(c1, d0)),
                hadamard(c1, d1),
            ],
            bound,
        })
    }

    fn mul_then_add(
        &self,
        lhs: &Ciphertext,
        rhs: &Ciphertext,
        acc: &mut Ciphertext,
    ) -> anyhow::Result<()> {
        let product = self.mul(lhs, rhs)?;
        *acc = self.add(acc, &product)?;
        Ok(())
    }

    fn relinearize(&self, ciphertext: &Ciphertext) -> anyhow::Result<Ciphertext> {
        self.scheme.check_ciphertext(ciphertext, 2)?;
        if ciphertext.degree() == 1 {
            return Ok(ciphertext.clone());
        }
        let rlk = self
            .relin_key
            .as_ref()
            .ok_or_else(|| anyhow_error_and_log("Relinearization key is not available"))?;
        let c2 = &ciphertext.parts[2];
        Ok(Ciphertext {
            parts: vec![
                add(&ciphertext.parts[0], &hadamard(c2, &rlk.k0)),
                add(&ciphertext.parts[1], &hadamard(c2, &rlk.k1)),
            ],
            bound: ciphertext.bound,
        })
    }

    fn rotate(&self, ciphertext: &Ciphertext, steps: usize) -> anyhow::Result<Ciphertext> {
        self.scheme.check_ciphertext(ciphertext, 1)?;
        let element = self.scheme.galois_element(steps);
        if element.0 == 0 {
            return Ok(ciphertext.clone());
        }
        let gk = self.galois_keys.get(&element).ok_or_else(|| {
            anyhow_error_and_log(format!("Rotation key for element {element} is not available"))
        })?;
        let k = element.0 as usize;
        let rc0 = rotate(&ciphertext.parts[0], k);
        let rc1 = rotate(&ciphertext.parts[1], k);
        Ok(Ciphertext {
            parts: vec![add(&rc0, &hadamard(&rc1, &gk.g0)), hadamard(&rc1, &gk.g1)],
            bound: ciphertext.bound,
        })
    }
}
