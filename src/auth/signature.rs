//! `EncryptedPasswd` construction for Google's Android master login.
//!
//! The credentials are RSA-OAEP (SHA-1, MGF1-SHA-1, empty label) encrypted
//! with the public key shipped inside Google Play Services, then prefixed
//! with a version byte and the first four bytes of the key's SHA-1
//! fingerprint.

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE};
use base64::Engine;
use num_bigint::BigUint;
use rand::RngCore;
use sha1::{Digest, Sha1};

use super::error::AuthError;

/// Google Play Services 7.3.29 login key: `len(n) || n || len(e) || e`,
/// lengths as 32-bit big-endian integers.
const ANDROID_LOGIN_KEY: &str = concat!(
    "AAAAgMom/1a/v0lblO2Ubrt60J2gcuXSljGFQXgcyZWveWLEwo6prwgi3",
    "iJIZdodyhKZQrNWp5nKJ3srRXcUW+F1BD3baEVGcmEgqaLZUNBjm057pK",
    "RI16kB0YppeGx5qIQ5QjKzsR8ETQbKLNWgRY0QRNVz34kMJR3P/LgHax/",
    "6rmf5AAAAAwEAAQ==",
);

const SHA1_LEN: usize = 20;

struct LoginKey {
    modulus: BigUint,
    exponent: BigUint,
    /// Modulus length in bytes (`k` in RFC 8017).
    size: usize,
    fingerprint: [u8; 4],
}

fn read_chunk<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let len_bytes: [u8; 4] = data.get(*pos..*pos + 4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let start = *pos + 4;
    let chunk = data.get(start..start + len)?;
    *pos = start + len;
    Some(chunk)
}

fn parse_login_key(encoded: &str) -> Result<LoginKey, AuthError> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| AuthError::Protocol(format!("login key is not base64: {}", e)))?;
    let mut pos = 0;
    let (modulus, exponent) = match (read_chunk(&raw, &mut pos), read_chunk(&raw, &mut pos)) {
        (Some(n), Some(e)) => (BigUint::from_bytes_be(n), BigUint::from_bytes_be(e)),
        _ => return Err(AuthError::Protocol("login key is truncated".into())),
    };

    let digest = Sha1::digest(&raw);
    let mut fingerprint = [0u8; 4];
    fingerprint.copy_from_slice(&digest[..4]);

    let size = (modulus.bits() as usize).div_ceil(8);
    Ok(LoginKey {
        modulus,
        exponent,
        size,
        fingerprint,
    })
}

/// MGF1 mask generation with SHA-1.
fn mgf1(seed: &[u8], len: usize) -> Vec<u8> {
    let mut mask = Vec::with_capacity(len + SHA1_LEN);
    let mut counter: u32 = 0;
    while mask.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(seed);
        hasher.update(counter.to_be_bytes());
        mask.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    mask.truncate(len);
    mask
}

/// EME-OAEP encoding (RFC 8017 §7.1.1) with an empty label.
fn oaep_pad(message: &[u8], k: usize, seed: &[u8; SHA1_LEN]) -> Result<Vec<u8>, AuthError> {
    let max_len = k.saturating_sub(2 * SHA1_LEN + 2);
    if message.len() > max_len {
        return Err(AuthError::InvalidCredentials(format!(
            "account and password together must be at most {} bytes",
            max_len
        )));
    }

    let db_len = k - SHA1_LEN - 1;
    let mut db = Vec::with_capacity(db_len);
    db.extend_from_slice(&Sha1::digest(b""));
    db.resize(db_len - message.len() - 1, 0);
    db.push(0x01);
    db.extend_from_slice(message);

    for (b, m) in db.iter_mut().zip(mgf1(seed, db_len)) {
        *b ^= m;
    }
    let mut masked_seed = *seed;
    for (b, m) in masked_seed.iter_mut().zip(mgf1(&db, SHA1_LEN)) {
        *b ^= m;
    }

    let mut em = Vec::with_capacity(k);
    em.push(0x00);
    em.extend_from_slice(&masked_seed);
    em.extend_from_slice(&db);
    Ok(em)
}

fn rsa_encrypt(key: &LoginKey, padded: &[u8]) -> Vec<u8> {
    let c = BigUint::from_bytes_be(padded).modpow(&key.exponent, &key.modulus);
    let bytes = c.to_bytes_be();
    let mut out = vec![0u8; key.size.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

/// Build the `EncryptedPasswd` form value for `email` / `password`.
pub fn encrypt_password(email: &str, password: &str) -> Result<String, AuthError> {
    let key = parse_login_key(ANDROID_LOGIN_KEY)?;

    let mut message = Vec::with_capacity(email.len() + password.len() + 1);
    message.extend_from_slice(email.as_bytes());
    message.push(0);
    message.extend_from_slice(password.as_bytes());

    let mut seed = [0u8; SHA1_LEN];
    rand::thread_rng().fill_bytes(&mut seed);
    let padded = oaep_pad(&message, key.size, &seed)?;

    let mut signature = Vec::with_capacity(1 + 4 + key.size);
    signature.push(0x00);
    signature.extend_from_slice(&key.fingerprint);
    signature.extend_from_slice(&rsa_encrypt(&key, &padded));
    Ok(URL_SAFE.encode(signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oaep_unpad(em: &[u8]) -> Vec<u8> {
        let masked_seed = &em[1..1 + SHA1_LEN];
        let masked_db = &em[1 + SHA1_LEN..];
        let seed: Vec<u8> = masked_seed
            .iter()
            .zip(mgf1(masked_db, SHA1_LEN))
            .map(|(a, b)| a ^ b)
            .collect();
        let db: Vec<u8> = masked_db
            .iter()
            .zip(mgf1(&seed, masked_db.len()))
            .map(|(a, b)| a ^ b)
            .collect();
        assert_eq!(&db[..SHA1_LEN], Sha1::digest(b"").as_slice());
        let sep = db[SHA1_LEN..].iter().position(|&b| b == 1).unwrap() + SHA1_LEN;
        db[sep + 1..].to_vec()
    }

    #[test]
    fn login_key_parses_as_1024_bit_rsa() {
        let key = parse_login_key(ANDROID_LOGIN_KEY).unwrap();
        assert_eq!(key.size, 128);
        assert_eq!(key.exponent, BigUint::from(65537u32));
    }

    #[test]
    fn truncated_key_is_rejected() {
        assert!(parse_login_key("AAAAgA==").is_err());
    }

    #[test]
    fn mgf1_output_has_requested_length() {
        assert_eq!(mgf1(b"seed", 107).len(), 107);
        assert_eq!(mgf1(b"seed", 20), Sha1::digest(b"seed\0\0\0\0").to_vec());
    }

    #[test]
    fn oaep_padding_recovers_message() {
        let seed = [7u8; SHA1_LEN];
        let em = oaep_pad(b"user@gmail.com\0hunter2", 128, &seed).unwrap();
        assert_eq!(em.len(), 128);
        assert_eq!(em[0], 0);
        assert_eq!(oaep_unpad(&em), b"user@gmail.com\0hunter2");
    }

    #[test]
    fn oaep_rejects_long_credentials() {
        let seed = [0u8; SHA1_LEN];
        let long = vec![b'a'; 87];
        assert!(matches!(
            oaep_pad(&long, 128, &seed),
            Err(AuthError::InvalidCredentials(_))
        ));
        assert!(oaep_pad(&long[..86], 128, &seed).is_ok());
    }

    #[test]
    fn encrypted_password_layout() {
        let key = parse_login_key(ANDROID_LOGIN_KEY).unwrap();
        let encoded = encrypt_password("user@gmail.com", "hunter2").unwrap();
        let raw = URL_SAFE.decode(&encoded).unwrap();
        assert_eq!(raw.len(), 1 + 4 + 128);
        assert_eq!(raw[0], 0);
        assert_eq!(&raw[1..5], &key.fingerprint);
        assert!(!encoded.contains('+') && !encoded.contains('/'));
    }

    #[test]
    fn encryption_is_randomized() {
        let a = encrypt_password("user@gmail.com", "hunter2").unwrap();
        let b = encrypt_password("user@gmail.com", "hunter2").unwrap();
        assert_ne!(a, b);
    }
}
