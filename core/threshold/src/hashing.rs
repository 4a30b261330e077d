use serde::Serialize;
use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake256,
};

use crate::networking::value::serialize;

/// Domain separator for hashing elements.
/// This is used to ensure that the hash is unique to the context in which it is used.
pub type DomainSep = [u8; DSEP_LEN];
pub const DSEP_LEN: usize = 8;

const DSEP_LIST: DomainSep = *b"HASH_LST";

/// Hash an element using SHAKE-256 with a chosen domain separator and a specified output size in bytes.
pub fn hash_element_w_size<T>(domain_separator: &DomainSep, element: &T, bytes: usize) -> Vec<u8>
where
    T: ?Sized + AsRef<[u8]>,
{
    let mut hasher = Shake256::default();
    hasher.update(domain_separator);
    hasher.update(element.as_ref());
    let mut output_reader = hasher.finalize_xof();
    let mut digest = vec![0u8; bytes];
    output_reader.read(&mut digest);
    digest
}

/// Hash a list of elements, each prefixed with its length so that distinct lists never collide.
pub fn hash_list_w_size<T>(domain_separator: &DomainSep, elements: &[&T], bytes: usize) -> Vec<u8>
where
    T: ?Sized + AsRef<[u8]>,
{
    let mut hasher = Shake256::default();
    hasher.update(&DSEP_LIST);
    hasher.update(domain_separator);
    hasher.update(&(elements.len() as u64).to_le_bytes());
    for cur_elem in elements {
        hasher.update(&(cur_elem.as_ref().len() as u64).to_le_bytes());
        hasher.update(cur_elem.as_ref());
    }
    let mut output_reader = hasher.finalize_xof();
    let mut digest = vec![0u8; bytes];
    output_reader.read(&mut digest);
    digest
}

/// Serialize an element with bincode and hash the result.
pub fn serialize_hash_element<T>(
    domain_separator: &DomainSep,
    element: &T,
    bytes: usize,
) -> anyhow::Result<Vec<u8>>
where
    T: ?Sized + Serialize,
{
    let serialized = serialize(element)?;
    Ok(hash_element_w_size(domain_separator, &serialized, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DSEP_TEST: DomainSep = *b"TESTTEST";

    #[test]
    fn domain_separation() {
        let a = hash_element_w_size(&DSEP_TEST, b"payload", 32);
        let b = hash_element_w_size(b"OTHERSEP", b"payload", 32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn list_boundaries_matter() {
        let first = hash_list_w_size(&DSEP_TEST, &[&b"ab"[..], &b"c"[..]][..], 16);
        let second = hash_list_w_size(&DSEP_TEST, &[&b"a"[..], &b"bc"[..]][..], 16);
        assert_ne!(first, second);
    }

    #[test]
    fn serialized_hash_is_stable() {
        let first = serialize_hash_element(&DSEP_TEST, &(1u64, "kind"), 16).unwrap();
        let second = serialize_hash_element(&DSEP_TEST, &(1u64, "kind"), 16).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
    }
}
