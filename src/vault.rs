use base64::engine::general_purpose;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix that marks an already-hashed password record.
const RECORD_PREFIX: &str = "ENC:";
const SALT_LEN: usize = 18;
const COOKIE_LEN: usize = 33;

/// Whether a stored password is already in `ENC:<salt>:<digest>` form.
pub fn is_hashed(record: &str) -> bool {
    match record.strip_prefix(RECORD_PREFIX) {
        Some(rest) => matches!(rest.split_once(':'), Some((salt, digest)) if !salt.is_empty() && !digest.is_empty()),
        None => false,
    }
}

/// Hash a plaintext password into an `ENC:<b64 salt>:<b64 digest>` record.
///
/// The digest is HMAC-SHA256 keyed with a fresh random salt.
pub fn hash(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let mut mac = HmacSha256::new_from_slice(&salt).expect("hmac accepts any key length");
    mac.update(password.as_bytes());
    let digest = mac.finalize().into_bytes();

    format!(
        "{RECORD_PREFIX}{}:{}",
        general_purpose::STANDARD.encode(salt),
        general_purpose::STANDARD.encode(digest)
    )
}

/// Check a candidate password against a stored record in constant time.
///
/// A malformed record never verifies.
pub fn verify(candidate: &str, record: &str) -> bool {
    let Some(rest) = record.strip_prefix(RECORD_PREFIX) else {
        return false;
    };
    let Some((salt_b64, digest_b64)) = rest.split_once(':') else {
        return false;
    };
    let Ok(salt) = general_purpose::STANDARD.decode(salt_b64) else {
        return false;
    };
    let Ok(digest) = general_purpose::STANDARD.decode(digest_b64) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(&salt) else {
        return false;
    };
    mac.update(candidate.as_bytes());
    mac.verify_slice(&digest).is_ok()
}

/// Generate a fresh control-port cookie secret.
pub fn new_cookie() -> String {
    let mut bytes = [0u8; COOKIE_LEN];
    OsRng.fill_bytes(&mut bytes);
    general_purpose::STANDARD.encode(bytes)
}
