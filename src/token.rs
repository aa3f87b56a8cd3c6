//! Manage json web tokens.

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::config::Token as TokenConfig;
use crate::error::{Result, ServerError};

const JTI_LENGTH: usize = 32;

/// Kind of session token. Kinds are never interchangeable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub token_type: TokenType,
    /// Recipients that the JWT is intended for.
    pub aud: String,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: u64,
    /// Identifies the time at which the JWT was issued.
    pub iat: u64,
    /// Identifies the organization that issued the JWT.
    pub iss: String,
    /// Unique token identifier.
    pub jti: String,
    /// User ID.
    pub sub: String,
}

impl Claims {
    /// Parse `sub` as a user ID.
    pub fn user_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }
}

/// A freshly issued refresh token.
#[derive(Clone, Debug)]
pub struct RefreshToken {
    pub token: String,
    pub jti: String,
    pub expires_at: u64,
}

/// Access and refresh tokens issued together.
#[derive(Clone, Debug)]
pub struct TokenPair {
    pub access: String,
    pub refresh: RefreshToken,
}

/// Manage JWT tokens.
#[derive(Clone)]
pub struct TokenManager {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    access_lifetime: u64,
    refresh_lifetime: u64,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("algorithm", &self.algorithm)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Create a new [`TokenManager`] instance.
    pub fn new(issuer: &str, secret: &[u8], config: &TokenConfig) -> Self {
        Self {
            algorithm: Algorithm::HS256,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: issuer.to_owned(),
            audience: config.audience.clone(),
            access_lifetime: config.access_lifetime,
            refresh_lifetime: config.refresh_lifetime,
        }
    }

    fn sign(
        &self,
        token_type: TokenType,
        user_id: i64,
        now: u64,
    ) -> Result<(String, Claims)> {
        let lifetime = match token_type {
            TokenType::Access => self.access_lifetime,
            TokenType::Refresh => self.refresh_lifetime,
        };
        let claims = Claims {
            token_type,
            aud: self.audience.clone(),
            exp: now + lifetime,
            iat: now,
            iss: self.issuer.clone(),
            jti: Alphanumeric.sample_string(&mut OsRng, JTI_LENGTH),
            sub: user_id.to_string(),
        };

        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key)?;
        Ok((token, claims))
    }

    /// Create a new access token.
    pub fn create_access(&self, user_id: i64) -> Result<String> {
        self.create_access_at(user_id, now())
    }

    pub(crate) fn create_access_at(&self, user_id: i64, now: u64) -> Result<String> {
        Ok(self.sign(TokenType::Access, user_id, now)?.0)
    }

    /// Create a new access and refresh tokens pair.
    pub fn create_pair(&self, user_id: i64) -> Result<TokenPair> {
        self.create_pair_at(user_id, now())
    }

    pub(crate) fn create_pair_at(&self, user_id: i64, now: u64) -> Result<TokenPair> {
        let (access, _) = self.sign(TokenType::Access, user_id, now)?;
        let (token, claims) = self.sign(TokenType::Refresh, user_id, now)?;

        Ok(TokenPair {
            access,
            refresh: RefreshToken {
                token,
                jti: claims.jti,
                expires_at: claims.exp,
            },
        })
    }

    /// Decode and check a token of the expected kind.
    pub fn decode(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "aud", "iss", "sub"]);

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)?.claims;

        if claims.token_type != expected {
            return Err(ServerError::InvalidToken);
        }

        Ok(claims)
    }
}

/// Current Unix timestamp, in seconds.
pub fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
