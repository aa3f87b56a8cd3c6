//! Handle database requests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::error::{Result, ServerError};
use crate::user::{NewUser, User};

const SELECT_USER: &str =
    "SELECT id, name, email, password, is_verified, created_at FROM users";

fn email_taken() -> ServerError {
    ServerError::Conflict {
        field: "email",
        message: "User with this email already exists.",
    }
}

/// Persistence of [`User`]s.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert [`NewUser`] and return the stored [`User`].
    ///
    /// Fails with [`ServerError::Conflict`] if email is already used.
    async fn insert(&self, user: NewUser) -> Result<User>;

    /// Find a user using `id` field.
    async fn find_by_id(&self, id: i64) -> Result<Option<User>>;

    /// Find a user using `email` field.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Mark a user as verified.
    ///
    /// Returns `false` if user was already verified or does not exist.
    async fn set_verified(&self, id: i64) -> Result<bool>;

    /// Replace password hash.
    async fn set_password(&self, id: i64, password: &str) -> Result<()>;

    /// Replace display name.
    async fn set_name(&self, id: i64, name: &str) -> Result<()>;
}

/// PostgreSQL [`UserRepository`].
#[derive(Clone)]
pub struct PgUserRepository {
    pool: Pool<Postgres>,
}

impl PgUserRepository {
    /// Create a new [`PgUserRepository`].
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn insert(&self, user: NewUser) -> Result<User> {
        sqlx::query_as::<_, User>(
            r#"INSERT INTO users (name, email, password)
                VALUES ($1, $2, $3)
                RETURNING id, name, email, password, is_verified, created_at"#,
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(err) if err.is_unique_violation() => {
                email_taken()
            },
            err => err.into(),
        })
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        Ok(sqlx::query_as::<_, User>(&format!("{SELECT_USER} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(
            sqlx::query_as::<_, User>(&format!(
                "{SELECT_USER} WHERE email = $1"
            ))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?,
        )
    }

    async fn set_verified(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE users SET is_verified = true WHERE id = $1 AND is_verified = false"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_password(&self, id: i64, password: &str) -> Result<()> {
        sqlx::query(r#"UPDATE users SET password = $1 WHERE id = $2"#)
            .bind(password)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_name(&self, id: i64, name: &str) -> Result<()> {
        sqlx::query(r#"UPDATE users SET name = $1 WHERE id = $2"#)
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[derive(Default)]
struct Users {
    next_id: i64,
    by_id: BTreeMap<i64, User>,
}

/// In-process [`UserRepository`], used when no database is configured.
#[derive(Default)]
pub struct MemoryUserRepository {
    users: Mutex<Users>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, id: i64, f: impl FnOnce(&mut User)) {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(user) = users.by_id.get_mut(&id) {
            f(user);
        }
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn insert(&self, user: NewUser) -> Result<User> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());

        if users.by_id.values().any(|u| u.email == user.email) {
            return Err(email_taken());
        }

        users.next_id += 1;
        let user = User {
            id: users.next_id,
            name: user.name,
            email: user.email,
            password: user.password,
            is_verified: false,
            created_at: chrono::Utc::now(),
        };
        users.by_id.insert(user.id, user.clone());

        Ok(user)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        Ok(users.by_id.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        Ok(users.by_id.values().find(|u| u.email == email).cloned())
    }

    async fn set_verified(&self, id: i64) -> Result<bool> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        match users.by_id.get_mut(&id) {
            Some(user) if !user.is_verified => {
                user.is_verified = true;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn set_password(&self, id: i64, password: &str) -> Result<()> {
        self.update(id, |user| user.password = password.to_owned());
        Ok(())
    }

    async fn set_name(&self, id: i64, name: &str) -> Result<()> {
        self.update(id, |user| user.name = name.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            name: "A".into(),
            email: email.into(),
            password: "hash".into(),
        }
    }

    #[tokio::test]
    async fn test_memory_insert_and_find() {
        let repo = MemoryUserRepository::new();

        let a = repo.insert(new_user("a@x.com")).await.unwrap();
        let b = repo.insert(new_user("b@x.com")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(!a.is_verified);

        assert_eq!(repo.find_by_id(a.id).await.unwrap(), Some(a.clone()));
        assert_eq!(repo.find_by_email("b@x.com").await.unwrap(), Some(b));
        assert_eq!(repo.find_by_email("c@x.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_unique_email() {
        let repo = MemoryUserRepository::new();

        repo.insert(new_user("a@x.com")).await.unwrap();
        let err = repo.insert(new_user("a@x.com")).await.unwrap_err();
        assert!(matches!(err, ServerError::Conflict { field: "email", .. }));
    }

    #[tokio::test]
    async fn test_memory_verified_once() {
        let repo = MemoryUserRepository::new();
        let user = repo.insert(new_user("a@x.com")).await.unwrap();

        assert!(repo.set_verified(user.id).await.unwrap());
        assert!(!repo.set_verified(user.id).await.unwrap());
        assert!(!repo.set_verified(404).await.unwrap());
        assert!(repo.find_by_id(user.id).await.unwrap().unwrap().is_verified);
    }
}
