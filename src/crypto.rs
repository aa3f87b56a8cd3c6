//! Cryptogragic logics.

use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Argon2, Params, Version};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::config::Argon2 as ArgonConfig;

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("argon2 error: {0}")]
    Argon2(String),
    #[error("secret key is empty")]
    EmptySecret,
    #[error("invalid key length for hmac")]
    Hmac(#[from] hmac::digest::InvalidLength),
}

/// Cryptographic manager.
pub struct Crypto {
    pub pwd: PasswordManager,
    secret: Zeroizing<Vec<u8>>,
}

impl Crypto {
    /// Create a new [`Crypto`].
    pub fn new(
        config: Option<ArgonConfig>,
        secret: impl AsRef<[u8]>,
    ) -> Result<Self> {
        if secret.as_ref().is_empty() {
            return Err(CryptoError::EmptySecret);
        }

        Ok(Self {
            pwd: PasswordManager::new(config)?,
            secret: Zeroizing::new(secret.as_ref().to_vec()),
        })
    }

    /// Process-wide secret used to sign tokens.
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

/// Password manager that uses Argon2id and PHC string format for hashing and
/// verification.
pub struct PasswordManager {
    params: Params,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'_> {
        Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
    }

    /// Hash password using Argon2id.
    pub fn hash_password(&self, password: impl AsRef<[u8]>) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(hash.to_string())
    }

    /// Verify password against a PHC.
    ///
    /// Returns `false` on mismatch or on malformed stored hash.
    pub fn verify_password(
        &self,
        password: impl AsRef<[u8]>,
        phc_hash: &str,
    ) -> bool {
        let Ok(parsed) = PasswordHash::new(phc_hash) else {
            tracing::warn!("stored password hash is not a valid PHC string");
            return false;
        };

        self.argon2()
            .verify_password(password.as_ref(), &parsed)
            .is_ok()
    }
}

#[cfg(test)]
pub(crate) fn light_argon2() -> ArgonConfig {
    ArgonConfig {
        memory_cost: 1024,
        iterations: 1,
        parallelism: 1,
        hash_length: 32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let pwd = PasswordManager::new(Some(light_argon2())).unwrap();

        let hash = pwd.hash_password("StrongPass1").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("StrongPass1"));

        assert!(pwd.verify_password("StrongPass1", &hash));
        assert!(!pwd.verify_password("StrongPass2", &hash));
        assert!(!pwd.verify_password("StrongPass1", "not-a-phc-string"));
    }

    #[test]
    fn test_salted() {
        let pwd = PasswordManager::new(Some(light_argon2())).unwrap();

        assert_ne!(
            pwd.hash_password("StrongPass1").unwrap(),
            pwd.hash_password("StrongPass1").unwrap()
        );
    }

    #[test]
    fn test_empty_secret() {
        assert!(matches!(
            Crypto::new(Some(light_argon2()), ""),
            Err(CryptoError::EmptySecret)
        ));
    }
}
