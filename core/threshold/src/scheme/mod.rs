//! Capability interfaces of the threshold homomorphic-encryption scheme.
//!
//! The node runtime never looks into ciphertexts, keys or shares: everything it needs from the
//! scheme goes through [MheScheme] (key material, shares, encryption) and [Evaluator]
//! (non-interactive homomorphic operations). A node is parameterized by its scheme once, at
//! construction.

use std::collections::BTreeMap;
use std::fmt::Debug;

use rand::{CryptoRng, Rng};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::algebra::zq::Zq;

pub mod reference;

/// Identifier of a Galois automorphism, i.e. of one slot rotation.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
pub struct GaloisElement(pub u64);

/// Public inputs of one share-generation round.
///
/// The same value is used to generate a share, to check a received share and to aggregate,
/// so all three operations agree on the instance they belong to.
pub enum ShareInput<'a, S: MheScheme> {
    PublicKey {
        seed: &'a [u8],
    },
    RelinKey {
        seed: &'a [u8],
        public_key: &'a S::PublicKey,
    },
    GaloisKey {
        seed: &'a [u8],
        element: GaloisElement,
    },
    /// Partial decryption of `ciphertext` with smudging noise of standard deviation `smudging`.
    /// When `receiver_local` is set, the receiver holds a secret share and completes the
    /// decryption itself, so aggregation stops at a ciphertext switched to its share.
    Decrypt {
        ciphertext: &'a S::Ciphertext,
        smudging: f64,
        receiver_local: bool,
    },
}

/// Result of a protocol instance, as observed by one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum AggregatedResult<S: MheScheme> {
    PublicKey(S::PublicKey),
    RelinKey(S::RelinKey),
    GaloisKey(S::GaloisKey),
    /// Ciphertext that only the decryption receiver can open.
    Switched(S::Ciphertext),
    Plaintext(S::Plaintext),
    /// The instance completed but its result is intended for another node.
    Withheld,
}

impl<S: MheScheme> AggregatedResult<S> {
    pub fn kind_name(&self) -> &'static str {
        match self {
            AggregatedResult::PublicKey(_) => "PublicKey",
            AggregatedResult::RelinKey(_) => "RelinKey",
            AggregatedResult::GaloisKey(_) => "GaloisKey",
            AggregatedResult::Switched(_) => "Switched",
            AggregatedResult::Plaintext(_) => "Plaintext",
            AggregatedResult::Withheld => "Withheld",
        }
    }
}

pub trait SchemeValue: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> SchemeValue for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{}

pub trait MheScheme: Clone + Debug + Send + Sync + Sized + 'static {
    type Parameters: SchemeValue;
    /// Shamir share of the collective secret held by one session node.
    type SecretShare: SchemeValue;
    /// Additive share of the collective secret for one fixed participant set.
    type AdditiveSecret: Send + Sync;
    type Plaintext: SchemeValue;
    type Ciphertext: SchemeValue;
    type PublicKey: SchemeValue;
    type RelinKey: SchemeValue;
    type GaloisKey: SchemeValue;
    /// Contribution of one participant to one protocol round.
    type Share: SchemeValue;
    type Evaluator: Evaluator<Ciphertext = Self::Ciphertext>;

    fn new(parameters: Self::Parameters) -> anyhow::Result<Self>;

    fn parameters(&self) -> &Self::Parameters;

    fn slots(&self) -> usize;

    fn plaintext_modulus(&self) -> u64;

    /// Galois element realizing a rotation of the slots by `steps` positions.
    fn galois_element(&self, steps: usize) -> GaloisElement;

    /// Checks a secret share against the public point of its owner.
    fn validate_secret_share(&self, share: &Self::SecretShare, point: Zq) -> anyhow::Result<()>;

    /// Converts a Shamir share at `point` into an additive share among `participants`.
    fn to_additive(
        &self,
        share: &Self::SecretShare,
        point: Zq,
        participants: &[Zq],
    ) -> anyhow::Result<Self::AdditiveSecret>;

    /// Trusted-dealer generation of secret shares, one per point, with reconstruction threshold `threshold`.
    fn gen_test_secret_shares<R: Rng + CryptoRng>(
        &self,
        threshold: usize,
        points: &[Zq],
        rng: &mut R,
    ) -> anyhow::Result<Vec<Self::SecretShare>>;

    fn gen_share<R: Rng + CryptoRng>(
        &self,
        input: &ShareInput<'_, Self>,
        secret: &Self::AdditiveSecret,
        rng: &mut R,
    ) -> anyhow::Result<Self::Share>;

    /// Structural check of a received share.
    fn check_share(&self, input: &ShareInput<'_, Self>, share: &Self::Share) -> anyhow::Result<()>;

    /// Combines shares. The result must not depend on the order of `shares`.
    fn aggregate(
        &self,
        input: &ShareInput<'_, Self>,
        shares: &[Self::Share],
    ) -> anyhow::Result<AggregatedResult<Self>>;

    /// Opens a ciphertext produced by a receiver-local decryption.
    fn finish_decryption(
        &self,
        switched: &Self::Ciphertext,
        secret: &Self::AdditiveSecret,
    ) -> anyhow::Result<Self::Plaintext>;

    fn encode(&self, values: &[u64]) -> anyhow::Result<Self::Plaintext>;

    fn decode(&self, plaintext: &Self::Plaintext) -> Vec<u64>;

    fn encrypt<R: Rng + CryptoRng>(
        &self,
        public_key: &Self::PublicKey,
        plaintext: &Self::Plaintext,
        rng: &mut R,
    ) -> anyhow::Result<Self::Ciphertext>;

    fn evaluator(
        &self,
        relin_key: Option<Self::RelinKey>,
        galois_keys: BTreeMap<GaloisElement, Self::GaloisKey>,
    ) -> Self::Evaluator;
}

/// Non-interactive homomorphic operations, bound to the evaluation keys it was built with.
pub trait Evaluator: Send + Sync {
    type Ciphertext;

    fn add(&self, lhs: &Self::Ciphertext, rhs: &Self::Ciphertext) -> anyhow::Result<Self::Ciphertext>;

    fn mul(&self, lhs: &Self::Ciphertext, rhs: &Self::Ciphertext) -> anyhow::Result<Self::Ciphertext>;

    /// `acc += lhs * rhs`
    fn mul_then_add(
        &self,
        lhs: &Self::Ciphertext,
        rhs: &Self::Ciphertext,
        acc: &mut Self::Ciphertext,
    ) -> anyhow::Result<()>;

    fn relinearize(&self, ciphertext: &Self::Ciphertext) -> anyhow::Result<Self::Ciphertext>;

    /// Cyclic rotation of the slots by `steps` positions to the left.
    fn rotate(&self, ciphertext: &Self::Ciphertext, steps: usize) -> anyhow::Result<Self::Ciphertext>;
}
