//! Stateless email activation tokens.
//!
//! A token is `<day>-<mac>` where `day` is the base36 day bucket it was
//! issued on and `mac` a truncated HMAC-SHA256 over the user ID, the day and
//! the verification flag. Verifying a user changes the hashed state, so any
//! token issued before activation stops matching.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::crypto::CryptoError;
use crate::user::User;

type HmacSha256 = Hmac<Sha256>;

const KEY_SALT: &[u8] = b"accounts.activation.ActivationTokenGenerator";
const MAC_LENGTH: usize = 16;
const SECONDS_PER_DAY: u64 = 60 * 60 * 24;

/// Encode a user ID to be embedded in a URL.
pub fn encode_uid(id: i64) -> String {
    URL_SAFE_NO_PAD.encode(id.to_string())
}

/// Decode a user ID produced by [`encode_uid`].
pub fn decode_uid(uid: &str) -> Option<i64> {
    let bytes = URL_SAFE_NO_PAD.decode(uid).ok()?;
    std::str::from_utf8(&bytes).ok()?.parse().ok()
}

/// Generate and check activation tokens.
pub struct ActivationTokenGenerator {
    keyed: HmacSha256,
    timeout_days: u64,
}

impl ActivationTokenGenerator {
    /// Create a new [`ActivationTokenGenerator`].
    pub fn new(secret: &[u8], timeout_days: u64) -> Result<Self, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::EmptySecret);
        }

        Ok(Self {
            keyed: <HmacSha256 as Mac>::new_from_slice(secret)?,
            timeout_days,
        })
    }

    fn mac(&self, user: &User, day: u64) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(KEY_SALT);
        mac.update(user.id.to_string().as_bytes());
        mac.update(b":");
        mac.update(day.to_string().as_bytes());
        mac.update(b":");
        mac.update(if user.is_verified { b"1" } else { b"0" });
        mac
    }

    /// Create a token for `user`.
    pub fn make_token(&self, user: &User) -> String {
        self.make_token_at(user, crate::token::now())
    }

    pub(crate) fn make_token_at(&self, user: &User, now: u64) -> String {
        let day = now / SECONDS_PER_DAY;
        let tag = self.mac(user, day).finalize().into_bytes();

        format!("{}-{}", to_base36(day), hex::encode(&tag[..MAC_LENGTH]))
    }

    /// Check that `token` was made for `user` in its current state and has
    /// not expired.
    pub fn check_token(&self, user: &User, token: &str) -> bool {
        self.check_token_at(user, token, crate::token::now())
    }

    pub(crate) fn check_token_at(&self, user: &User, token: &str, now: u64) -> bool {
        let Some((day, tag)) = token.split_once('-') else {
            return false;
        };
        let Some(day) = from_base36(day) else {
            return false;
        };
        let Ok(tag) = hex::decode(tag) else {
            return false;
        };
        if tag.len() != MAC_LENGTH {
            return false;
        }

        let today = now / SECONDS_PER_DAY;
        if day > today || today - day > self.timeout_days {
            return false;
        }

        self.mac(user, day).verify_truncated_left(&tag).is_ok()
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_owned();
    }

    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();

    String::from_utf8_lossy(&out).into_owned()
}

fn from_base36(value: &str) -> Option<u64> {
    if value.is_empty() || value.len() > 13 {
        return None;
    }
    u64::from_str_radix(value, 36).ok()
}
