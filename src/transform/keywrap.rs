//! AES key wrap (RFC 3394).
//!
//! Wraps per-block envelope keys under the configured master key. The
//! 64-bit integrity value `0xA6A6A6A6A6A6A6A6` is checked on unwrap; a
//! mismatch means the wrapped key or the master key is wrong and is
//! reported as a data-integrity failure.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;

use crate::error::{Result, VaultError};

/// RFC 3394 §2.2.3 initial value.
pub const KEYWRAP_IV: u64 = 0xA6A6_A6A6_A6A6_A6A6;

fn cipher(kek: &[u8]) -> Result<Aes256> {
    Aes256::new_from_slice(kek)
        .map_err(|_| VaultError::Transform("Key-wrap KEK must be 32 bytes long.".to_string()))
}

/// Wrap `plaintext` (a key of 16+ bytes, multiple of 8) under `kek`.
/// Output is 8 bytes longer than the input.
pub fn wrap_key(kek: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() < 16 || plaintext.len() % 8 != 0 {
        return Err(VaultError::Transform(format!(
            "Key wrap input must be a multiple of 8 and at least 16 bytes, got {}.",
            plaintext.len()
        )));
    }
    let cipher = cipher(kek)?;
    let n = plaintext.len() / 8;
    let mut a = KEYWRAP_IV;
    let mut r: Vec<[u8; 8]> = plaintext
        .chunks_exact(8)
        .map(|c| {
            let mut block = [0u8; 8];
            block.copy_from_slice(c);
            block
        })
        .collect();

    for j in 0..6u64 {
        for (i, ri) in r.iter_mut().enumerate() {
            let mut block = [0u8; 16];
            block[..8].copy_from_slice(&a.to_be_bytes());
            block[8..].copy_from_slice(ri);
            let mut ga = GenericArray::clone_from_slice(&block);
            cipher.encrypt_block(&mut ga);
            let t = (n as u64) * j + (i as u64 + 1);
            let mut msb = [0u8; 8];
            msb.copy_from_slice(&ga[..8]);
            a = u64::from_be_bytes(msb) ^ t;
            ri.copy_from_slice(&ga[8..]);
        }
    }

    let mut out = Vec::with_capacity(8 + plaintext.len());
    out.extend_from_slice(&a.to_be_bytes());
    for ri in &r {
        out.extend_from_slice(ri);
    }
    Ok(out)
}

/// Unwrap a key produced by [`wrap_key`], verifying the RFC 3394
/// integrity value.
pub fn unwrap_key(kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return Err(VaultError::Transform(format!(
            "Wrapped key must be a multiple of 8 and at least 24 bytes, got {}.",
            wrapped.len()
        )));
    }
    let cipher = cipher(kek)?;
    let n = wrapped.len() / 8 - 1;
    let mut msb = [0u8; 8];
    msb.copy_from_slice(&wrapped[..8]);
    let mut a = u64::from_be_bytes(msb);
    let mut r: Vec<[u8; 8]> = wrapped[8..]
        .chunks_exact(8)
        .map(|c| {
            let mut block = [0u8; 8];
            block.copy_from_slice(c);
            block
        })
        .collect();

    for j in (0..6u64).rev() {
        for i in (0..n).rev() {
            let t = (n as u64) * j + (i as u64 + 1);
            let mut block = [0u8; 16];
            block[..8].copy_from_slice(&(a ^ t).to_be_bytes());
            block[8..].copy_from_slice(&r[i]);
            let mut ga = GenericArray::clone_from_slice(&block);
            cipher.decrypt_block(&mut ga);
            let mut head = [0u8; 8];
            head.copy_from_slice(&ga[..8]);
            a = u64::from_be_bytes(head);
            r[i].copy_from_slice(&ga[8..]);
        }
    }

    if a != KEYWRAP_IV {
        return Err(VaultError::Scrubbing(format!(
            "Key-wrap integrity check failed: {a:#018x} (expected {KEYWRAP_IV:#018x})."
        )));
    }
    let mut out = Vec::with_capacity(wrapped.len() - 8);
    for ri in &r {
        out.extend_from_slice(ri);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 3394 §4.6: 256-bit key data wrapped with a 256-bit KEK.
    const KEK: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const PLAIN: &str = "00112233445566778899aabbccddeeff000102030405060708090a0b0c0d0e0f";
    const WRAPPED: &str = "28c9f404c4b810f4cbccb35cfb87f8263f5786e2d80ed326cbc7f0e71a99f43bfb988b9b7a02dd21";

    #[test]
    fn rfc3394_vector_4_6() {
        let kek = hex::decode(KEK).unwrap();
        let plain = hex::decode(PLAIN).unwrap();
        let wrapped = wrap_key(&kek, &plain).unwrap();
        assert_eq!(hex::encode(&wrapped), WRAPPED);
        assert_eq!(unwrap_key(&kek, &wrapped).unwrap(), plain);
    }

    #[test]
    fn corrupted_wrap_fails_the_integrity_check() {
        let kek = hex::decode(KEK).unwrap();
        let mut wrapped = hex::decode(WRAPPED).unwrap();
        wrapped[3] ^= 0x01;
        let err = unwrap_key(&kek, &wrapped).unwrap_err();
        assert!(matches!(err, VaultError::Scrubbing(_)));
    }

    #[test]
    fn wrong_kek_fails_the_integrity_check() {
        let kek = hex::decode(KEK).unwrap();
        let mut other = kek.clone();
        other[0] ^= 0xff;
        let wrapped = wrap_key(&kek, &hex::decode(PLAIN).unwrap()).unwrap();
        assert!(unwrap_key(&other, &wrapped).is_err());
    }

    #[test]
    fn odd_lengths_are_rejected() {
        let kek = vec![0u8; 32];
        assert!(wrap_key(&kek, &[0u8; 15]).is_err());
        assert!(wrap_key(&kek, &[0u8; 8]).is_err());
        assert!(unwrap_key(&kek, &[0u8; 17]).is_err());
    }
}
