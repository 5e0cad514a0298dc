use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};

use crate::crypto::*;

/// AES with either key size, backed by the aes crate.
/// The crate zeroizes round keys on drop when built with its `zeroize` feature.
pub enum CrateAes {
    Aes128(Aes128),
    Aes256(Aes256),
}
impl AesBlock for CrateAes {
    fn new(key: &[u8]) -> Option<Self> {
        match key.len() {
            AES_128_KEY_SIZE => Aes128::new_from_slice(key).ok().map(Self::Aes128),
            AES_256_KEY_SIZE => Aes256::new_from_slice(key).ok().map(Self::Aes256),
            _ => None,
        }
    }

    fn encrypt_in_place(&self, block: &mut [u8; AES_BLOCK_SIZE]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.encrypt_block(block),
            Self::Aes256(c) => c.encrypt_block(block),
        }
    }
}
