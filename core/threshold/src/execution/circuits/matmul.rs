//! Encrypted matrix-vector product, using the diagonal method.
//!
//! The evaluator holds the `m` generalized diagonals of the matrix under `//eval/mat-diag-<k>`,
//! with `d_k[i] = A[i][(i + k) mod m]`, each replicated over the slots. The vector comes from
//! the `in` node and the product is decrypted towards the `rec` node.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::runtime::CircuitRuntime;
use super::{Circuit, DecOptions};
use crate::error::CircuitError;
use crate::scheme::{Evaluator, MheScheme};

pub const MATMUL_CIRCUIT: &str = "matmul";

pub const VECTOR_LABEL: &str = "//in/vec";
pub const RESULT_LABEL: &str = "//eval/res-0";

pub fn diagonal_label(k: usize) -> String {
    format!("//eval/mat-diag-{k}")
}

#[derive(Clone, Debug)]
pub struct MatVecCircuit {
    pub dimension: usize,
    pub options: DecOptions,
}

impl MatVecCircuit {
    pub fn new(dimension: usize) -> Self {
        MatVecCircuit {
            dimension,
            options: DecOptions::default(),
        }
    }

    /// Rotations the circuit evaluates with.
    pub fn rotations(&self) -> Vec<usize> {
        (1..self.dimension).collect()
    }
}

#[async_trait]
impl<S: MheScheme> Circuit<S> for MatVecCircuit {
    async fn evaluate(&self, rt: &mut CircuitRuntime<S>) -> Result<(), CircuitError> {
        let m = self.dimension;
        let slots = rt.slots();
        if m == 0 || slots % m != 0 {
            return Err(CircuitError::InternalCryptoFailure(format!(
                "dimension {m} does not divide the {slots} slots"
            )));
        }

        let vector = rt.input(VECTOR_LABEL).await?;
        let mut diagonals = BTreeMap::new();
        for k in 0..m {
            diagonals.insert(k, rt.load(diagonal_label(k)).await?);
        }

        let product = rt.eval_local(true, &self.rotations(), |eval| {
            let mut terms = diagonals.iter();
            let (k, diagonal) = terms
                .next()
                .ok_or_else(|| anyhow::anyhow!("empty matrix"))?;
            let mut acc = eval.mul(&diagonal.ciphertext, &eval.rotate(&vector.ciphertext, *k)?)?;
            for (k, diagonal) in terms {
                let rotated = eval.rotate(&vector.ciphertext, *k)?;
                eval.mul_then_add(&diagonal.ciphertext, &rotated, &mut acc)?;
            }
            eval.relinearize(&acc)
        })?;

        let result = rt.new_operand(RESULT_LABEL, product)?;
        let receiver = rt.node("rec")?;
        rt.dec(&result, &receiver, &self.options).await
    }
}

/// Repeats `values` until `slots` are filled.
pub fn replicate(values: &[u64], slots: usize) -> Vec<u64> {
    values.iter().copied().cycle().take(slots).collect()
}

/// The replicated generalized diagonals of a square matrix.
pub fn diagonals(matrix: &[Vec<u64>], slots: usize) -> Vec<Vec<u64>> {
    let m = matrix.len();
    (0..m)
        .map(|k| {
            let diagonal: Vec<u64> = (0..m).map(|i| matrix[i][(i + k) % m]).collect();
            replicate(&diagonal, slots)
        })
        .collect()
}

/// Plain product modulo `modulus`.
pub fn mat_vec(matrix: &[Vec<u64>], vector: &[u64], modulus: u64) -> Vec<u64> {
    matrix
        .iter()
        .map(|row| {
            row.iter()
                .zip(vector)
                .fold(0u128, |acc, (a, v)| {
                    (acc + (*a as u128) * (*v as u128)) % modulus as u128
                }) as u64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn diagonal_layout() {
        let matrix = vec![vec![1, 2], vec![3, 4]];
        assert_eq!(
            diagonals(&matrix, 4),
            vec![vec![1, 4, 1, 4], vec![2, 3, 2, 3]]
        );
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    #[case(8)]
    fn diagonal_method_matches_the_plain_product(#[case] m: usize) {
        let slots = 16;
        let matrix: Vec<Vec<u64>> = (0..m)
            .map(|i| (0..m).map(|j| (i + 2 * j) as u64).collect())
            .collect();
        let vector: Vec<u64> = (0..m).map(|i| (3 * i + 1) as u64).collect();
        let replicated = replicate(&vector, slots);
        let mut acc = vec![0u64; slots];
        for (k, diagonal) in diagonals(&matrix, slots).iter().enumerate() {
            for (i, slot) in acc.iter_mut().enumerate() {
                *slot += diagonal[i] * replicated[(i + k) % slots];
            }
        }
        let expected = mat_vec(&matrix, &vector, 65537);
        assert_eq!(&acc[..m], expected.as_slice());
        assert_eq!(acc, replicate(&expected, slots));
    }

    #[test]
    fn rotations_skip_the_identity() {
        assert_eq!(MatVecCircuit::new(4).rotations(), vec![1, 2, 3]);
        assert!(MatVecCircuit::new(1).rotations().is_empty());
    }
}
