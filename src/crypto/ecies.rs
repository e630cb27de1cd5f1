// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! ECIES hybrid encryption on P-256.
//!
//! Wire-compatible with the SEC-1 variant used by the device-gateway:
//! ECDH to a shared secret, NIST SP 800-56 concatenation KDF (SHA-256) to
//! an AES-128 key and a MAC key, AES-128-CTR over the plaintext with the
//! IV prepended to the ciphertext, and an HMAC-SHA-256 tag.
//!
//! Framing per message: `R || iv+ct || tag` where `R` is the sender's
//! ephemeral public key as an uncompressed SEC1 point.
//!
//! The ECDH itself is delegated to the caller so a hardware token can
//! perform the key agreement without exposing the private scalar - see
//! [`decrypt_with`].

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use hmac::{Hmac, Mac};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// AES-128 key length; the KDF also derives this many bytes of raw MAC key.
const KEY_LEN: usize = 16;
/// AES block length; the IV occupies the first block of the ciphertext.
const BLOCK_SIZE: usize = 16;
/// SHA-256 output length; also the tag length.
const HASH_LEN: usize = 32;
/// Uncompressed SEC1 point length for P-256.
const POINT_LEN: usize = 65;

/// Decrypt an ECIES ciphertext, delegating the ECDH to `derive`.
///
/// `derive` receives the sender's ephemeral public point and must return
/// the raw shared secret: the big-endian X coordinate of `d*R`, zero
/// padded to the curve byte length.
///
/// `s1` and `s2` are the optional SEC-1 shared-info strings mixed into the
/// KDF and the tag respectively; the device-gateway uses neither.
pub fn decrypt_with<F>(derive: F, c: &[u8], s1: &[u8], s2: &[u8]) -> Result<Vec<u8>>
where
    F: FnOnce(&PublicKey) -> Result<Vec<u8>>,
{
    if c.is_empty() {
        return Err(Error::InvalidMessage);
    }
    match c[0] {
        2 | 3 | 4 => {
            if c.len() < POINT_LEN + HASH_LEN + 1 {
                return Err(Error::InvalidMessage);
            }
        }
        _ => return Err(Error::InvalidPublicKey),
    }

    let point = EncodedPoint::from_bytes(&c[..POINT_LEN]).map_err(|_| Error::InvalidPublicKey)?;
    let ephemeral: Option<PublicKey> = PublicKey::from_encoded_point(&point).into();
    let ephemeral = ephemeral.ok_or(Error::InvalidCurve)?;

    let ct = &c[POINT_LEN..c.len() - HASH_LEN];
    let tag = &c[c.len() - HASH_LEN..];
    if ct.len() < BLOCK_SIZE {
        return Err(Error::InvalidMessage);
    }

    let z = derive(&ephemeral)?;
    let (ke, km) = derive_keys(&z, s1);

    let expected = message_tag(&km, ct, s2);
    if !bool::from(tag.ct_eq(&expected)) {
        return Err(Error::InvalidMessage);
    }

    let mut plaintext = ct[BLOCK_SIZE..].to_vec();
    let mut cipher = Aes128Ctr::new(&ke.into(), ct[..BLOCK_SIZE].into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

/// Encrypt a message to `peer` with a freshly generated ephemeral key.
pub fn encrypt(peer: &PublicKey, msg: &[u8], s1: &[u8], s2: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = p256::SecretKey::random(&mut rand::rngs::OsRng);
    let z = p256::ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), peer.as_affine());
    let (ke, km) = derive_keys(z.raw_secret_bytes().as_slice(), s1);

    let mut ct = vec![0u8; BLOCK_SIZE + msg.len()];
    rand::rngs::OsRng.fill_bytes(&mut ct[..BLOCK_SIZE]);
    ct[BLOCK_SIZE..].copy_from_slice(msg);
    let (iv, body) = ct.split_at_mut(BLOCK_SIZE);
    let mut cipher = Aes128Ctr::new(&ke.into(), (&*iv).into());
    cipher.apply_keystream(body);

    let tag = message_tag(&km, &ct, s2);

    let point = ephemeral.public_key().to_encoded_point(false);
    let mut out = Vec::with_capacity(POINT_LEN + ct.len() + HASH_LEN);
    out.extend_from_slice(point.as_bytes());
    out.extend_from_slice(&ct);
    out.extend_from_slice(&tag);
    Ok(out)
}

// NIST SP 800-56 concatenation KDF (section 5.8.1) over SHA-256.
fn concat_kdf(z: &[u8], s1: &[u8], kd_len: usize) -> Vec<u8> {
    let mut k = Vec::with_capacity(kd_len.next_multiple_of(HASH_LEN));
    let mut counter: u32 = 1;
    while k.len() < kd_len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(z);
        hasher.update(s1);
        k.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    k.truncate(kd_len);
    k
}

// Derive the encryption key and the (hashed) MAC key from the shared secret.
fn derive_keys(z: &[u8], s1: &[u8]) -> ([u8; KEY_LEN], [u8; HASH_LEN]) {
    let k = concat_kdf(z, s1, 2 * KEY_LEN);
    let mut ke = [0u8; KEY_LEN];
    ke.copy_from_slice(&k[..KEY_LEN]);
    let km: [u8; HASH_LEN] = Sha256::digest(&k[KEY_LEN..]).into();
    (ke, km)
}

// MAC of the ciphertext (the "tag"), as per SEC 1, 3.5.
fn message_tag(km: &[u8], msg: &[u8], shared: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = HmacSha256::new_from_slice(km).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.update(shared);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derive_for(key: &p256::SecretKey) -> impl Fn(&PublicKey) -> Result<Vec<u8>> + '_ {
        move |peer| {
            let z = p256::ecdh::diffie_hellman(key.to_nonzero_scalar(), peer.as_affine());
            Ok(z.raw_secret_bytes().as_slice().to_vec())
        }
    }

    #[test]
    fn test_round_trip() {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        for len in [0usize, 1, 15, 16, 17, 1024, 1 << 20] {
            let msg = vec![0xa5u8; len];
            let ct = encrypt(&key.public_key(), &msg, b"", b"").unwrap();
            assert_eq!(ct.len(), POINT_LEN + BLOCK_SIZE + len + HASH_LEN);
            let pt = decrypt_with(derive_for(&key), &ct, b"", b"").unwrap();
            assert_eq!(pt, msg);
        }
    }

    #[test]
    fn test_shared_info_must_match() {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let ct = encrypt(&key.public_key(), b"hello", b"s1", b"s2").unwrap();

        let pt = decrypt_with(derive_for(&key), &ct, b"s1", b"s2").unwrap();
        assert_eq!(pt, b"hello");

        assert!(matches!(
            decrypt_with(derive_for(&key), &ct, b"", b"s2").unwrap_err(),
            Error::InvalidMessage
        ));
        assert!(matches!(
            decrypt_with(derive_for(&key), &ct, b"s1", b"").unwrap_err(),
            Error::InvalidMessage
        ));
    }

    #[test]
    fn test_corrupted_tag() {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let mut ct = encrypt(&key.public_key(), b"secret", b"", b"").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(
            decrypt_with(derive_for(&key), &ct, b"", b"").unwrap_err(),
            Error::InvalidMessage
        ));
    }

    #[test]
    fn test_corrupted_ciphertext() {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let mut ct = encrypt(&key.public_key(), b"secret", b"", b"").unwrap();
        ct[POINT_LEN + BLOCK_SIZE] ^= 0x01;
        assert!(matches!(
            decrypt_with(derive_for(&key), &ct, b"", b"").unwrap_err(),
            Error::InvalidMessage
        ));
    }

    #[test]
    fn test_malformed_messages() {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);

        assert!(matches!(
            decrypt_with(derive_for(&key), b"", b"", b"").unwrap_err(),
            Error::InvalidMessage
        ));

        // Unknown point tag
        let bogus = vec![9u8; 200];
        assert!(matches!(
            decrypt_with(derive_for(&key), &bogus, b"", b"").unwrap_err(),
            Error::InvalidPublicKey
        ));

        // Valid tag byte but too short overall
        let mut short = vec![4u8; POINT_LEN + HASH_LEN];
        short[0] = 4;
        assert!(matches!(
            decrypt_with(derive_for(&key), &short, b"", b"").unwrap_err(),
            Error::InvalidMessage
        ));
    }

    #[test]
    fn test_off_curve_point() {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let mut ct = encrypt(&key.public_key(), b"secret", b"", b"").unwrap();
        // Flip a Y-coordinate bit so the point no longer satisfies the
        // curve equation
        ct[POINT_LEN - 1] ^= 0x01;
        assert!(matches!(
            decrypt_with(derive_for(&key), &ct, b"", b"").unwrap_err(),
            Error::InvalidCurve
        ));
    }

    #[test]
    fn test_kdf_counter_advances() {
        // More than one hash block of output must not repeat the first block
        let k = concat_kdf(b"z", b"", 64);
        assert_eq!(k.len(), 64);
        assert_ne!(k[..32], k[32..]);
    }
}
