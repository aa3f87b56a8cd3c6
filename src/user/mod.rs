mod repository;

pub use repository::*;

use serde::{Deserialize, Serialize};

/// User as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip)]
    pub password: String,
    #[serde(skip)]
    pub is_verified: bool,
    #[serde(skip)]
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// User not yet persisted. `password` must already be hashed.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// Lower-case the domain part of an email address.
///
/// The local part is kept as is, some providers are case-sensitive.
pub fn normalize_email(email: &str) -> String {
    let email = email.trim();
    match email.rsplit_once('@') {
        Some((local, domain)) => format!("{local}@{}", domain.to_lowercase()),
        None => email.to_owned(),
    }
}
