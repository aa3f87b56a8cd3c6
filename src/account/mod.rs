//! Account lifecycle: registration, activation, sessions and profile.

mod policy;

pub use policy::PasswordPolicy;

use std::sync::Arc;

use validator::{ValidationError, ValidationErrors};

use crate::activation::{self, ActivationTokenGenerator};
use crate::blacklist::TokenBlacklist;
use crate::config::Configuration;
use crate::crypto::{Crypto, CryptoError};
use crate::error::{Result, ServerError};
use crate::mail::{MailManager, Template};
use crate::token::{TokenManager, TokenPair, TokenType};
use crate::user::{NewUser, User, UserRepository, normalize_email};

const NO_ACTIVE_ACCOUNT: &str = "No active account found with the given credentials.";
const EMAIL_NOT_VERIFIED: &str = "Email is not verified.";
const NON_FIELD_ERRORS: &str = "non_field_errors";

/// A freshly created account and its first session.
#[derive(Debug)]
pub struct Registered {
    pub user: User,
    pub tokens: TokenPair,
}

/// Orchestrate every account operation.
pub struct AccountService {
    users: Arc<dyn UserRepository>,
    blacklist: Arc<dyn TokenBlacklist>,
    crypto: Crypto,
    tokens: TokenManager,
    activation: ActivationTokenGenerator,
    policy: PasswordPolicy,
    mail: MailManager,
    site_url: String,
}

impl AccountService {
    /// Create a new [`AccountService`].
    pub fn new(
        config: &Configuration,
        users: Arc<dyn UserRepository>,
        blacklist: Arc<dyn TokenBlacklist>,
        crypto: Crypto,
        mail: MailManager,
    ) -> std::result::Result<Self, CryptoError> {
        let tokens = TokenManager::new(&config.url, crypto.secret(), &config.token);
        let activation = ActivationTokenGenerator::new(
            crypto.secret(),
            config.activation.timeout_days,
        )?;

        Ok(Self {
            users,
            blacklist,
            crypto,
            tokens,
            activation,
            policy: PasswordPolicy::from(&config.password),
            mail,
            site_url: config.url.clone(),
        })
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    /// Build the link a user has to follow to verify their email.
    pub fn activation_link(&self, user: &User) -> String {
        format!(
            "{}{}api/activate/{}/{}/",
            self.site_url,
            if self.site_url.ends_with('/') { "" } else { "/" },
            activation::encode_uid(user.id),
            self.activation.make_token(user)
        )
    }

    /// Create an account, open a session and send the activation email.
    pub async fn register(
        &self,
        email: &str,
        name: &str,
        password: &str,
    ) -> Result<Registered> {
        let email = normalize_email(email);
        self.policy.check("password", password, &[email.as_str(), name])?;

        let user = self
            .users
            .insert(NewUser {
                name: name.to_owned(),
                email,
                password: self.crypto.pwd.hash_password(password)?,
            })
            .await?;

        let tokens = self.issue_pair(user.id).await?;

        let link = self.activation_link(&user);
        let template = Template::Activation {
            name: &user.name,
            link: &link,
        };
        if let Err(err) = self
            .mail
            .enqueue(user.id, template.subject(), template.render())
        {
            tracing::error!(user_id = user.id, %err, "activation email not queued");
        }

        tracing::info!(user_id = user.id, "account registered");
        metrics::counter!("accounts_registered_total").increment(1);

        Ok(Registered { user, tokens })
    }

    /// Verify the email of the user designated by `uid`.
    pub async fn activate(&self, uid: &str, token: &str) -> Result<()> {
        let id = activation::decode_uid(uid).ok_or(ServerError::InvalidLink)?;
        let user = self
            .users
            .find_by_id(id)
            .await?
            .ok_or(ServerError::InvalidLink)?;

        if !self.activation.check_token(&user, token) {
            return Err(ServerError::InvalidLink);
        }

        if !self.users.set_verified(user.id).await? {
            return Err(ServerError::InvalidLink);
        }

        tracing::info!(user_id = user.id, "account activated");
        metrics::counter!("accounts_activated_total").increment(1);

        Ok(())
    }

    async fn credentials(&self, email: &str, password: &str) -> Result<User> {
        let user = self.users.find_by_email(&normalize_email(email)).await?;

        match user {
            Some(user) if self.crypto.pwd.verify_password(password, &user.password) => {
                Ok(user)
            },
            _ => {
                metrics::counter!("auth_failures_total", "reason" => "invalid_credentials")
                    .increment(1);
                Err(ServerError::Authentication(NO_ACTIVE_ACCOUNT))
            },
        }
    }

    async fn issue_pair(&self, user_id: i64) -> Result<TokenPair> {
        let pair = self.tokens.create_pair(user_id)?;
        self.blacklist
            .register(&pair.refresh.jti, user_id, pair.refresh.expires_at)
            .await?;
        Ok(pair)
    }

    /// Open a session for a verified user.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair> {
        let user = self.credentials(email, password).await?;

        if !user.is_verified {
            metrics::counter!("auth_failures_total", "reason" => "unverified").increment(1);
            let mut errors = ValidationErrors::new();
            errors.add(
                NON_FIELD_ERRORS,
                ValidationError::new("unverified").with_message(EMAIL_NOT_VERIFIED.into()),
            );
            return Err(errors.into());
        }

        self.issue_pair(user.id).await
    }

    /// Exchange credentials for a token pair, verified or not.
    pub async fn obtain_pair(&self, email: &str, password: &str) -> Result<TokenPair> {
        let user = self.credentials(email, password).await?;
        self.issue_pair(user.id).await
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh(&self, refresh: &str) -> Result<String> {
        let claims = self
            .tokens
            .decode(refresh, TokenType::Refresh)
            .map_err(|_| ServerError::InvalidToken)?;

        if !self.blacklist.is_active(&claims.jti).await? {
            metrics::counter!("auth_failures_total", "reason" => "revoked").increment(1);
            return Err(ServerError::InvalidToken);
        }

        let user_id = claims.user_id().ok_or(ServerError::InvalidToken)?;
        if self.users.find_by_id(user_id).await?.is_none() {
            return Err(ServerError::InvalidToken);
        }

        self.tokens.create_access(user_id)
    }

    /// Resolve the user behind an access token.
    pub async fn authenticate(&self, access: &str) -> Result<User> {
        let user_id = self
            .tokens
            .decode(access, TokenType::Access)
            .ok()
            .and_then(|claims| claims.user_id())
            .ok_or(ServerError::Unauthorized)?;

        self.users
            .find_by_id(user_id)
            .await?
            .ok_or(ServerError::Unauthorized)
    }

    /// Blacklist a refresh token owned by `user`.
    ///
    /// Every failure is reported as [`ServerError::BadRequest`].
    pub async fn logout(&self, user: &User, refresh: &str) -> Result<()> {
        let claims = self
            .tokens
            .decode(refresh, TokenType::Refresh)
            .map_err(|_| ServerError::BadRequest)?;

        if claims.user_id() != Some(user.id) {
            return Err(ServerError::BadRequest);
        }

        match self.blacklist.blacklist(&claims.jti).await {
            Ok(true) => {
                tracing::debug!(user_id = user.id, "refresh token blacklisted");
                Ok(())
            },
            Ok(false) => Err(ServerError::BadRequest),
            Err(err) => {
                tracing::error!(user_id = user.id, %err, "cannot blacklist refresh token");
                Err(ServerError::BadRequest)
            },
        }
    }

    /// Replace the password of `user` after checking the current one.
    pub async fn change_password(
        &self,
        user: &User,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        if !self.crypto.pwd.verify_password(old_password, &user.password) {
            let mut errors = ValidationErrors::new();
            errors.add(
                "old_password",
                ValidationError::new("wrong_password")
                    .with_message("Wrong password.".into()),
            );
            return Err(errors.into());
        }

        self.policy
            .check("new_password", new_password, &[user.email.as_str(), user.name.as_str()])?;

        let hash = self.crypto.pwd.hash_password(new_password)?;
        self.users.set_password(user.id, &hash).await?;

        tracing::info!(user_id = user.id, "password changed");
        Ok(())
    }

    /// Update the mutable part of a profile. Email is never changed.
    pub async fn update_profile(&self, user: User, name: Option<&str>) -> Result<User> {
        let Some(name) = name else {
            return Ok(user);
        };

        self.users.set_name(user.id, name).await?;
        Ok(User {
            name: name.to_owned(),
            ..user
        })
    }

    /// Forget expired refresh tokens.
    pub async fn purge_expired_tokens(&self) -> Result<u64> {
        let count = self.blacklist.purge_expired().await?;
        tracing::debug!(count, "expired refresh tokens purged");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::MemoryTokenBlacklist;
    use crate::crypto::light_argon2;
    use crate::mail::{Dispatch, RecordingTransport, StalledTransport, Transport};
    use crate::user::MemoryUserRepository;

    struct Harness {
        service: AccountService,
        users: Arc<MemoryUserRepository>,
        blacklist: Arc<MemoryTokenBlacklist>,
        transport: Arc<RecordingTransport>,
    }

    fn service(
        users: Arc<MemoryUserRepository>,
        blacklist: Arc<MemoryTokenBlacklist>,
        transport: Arc<dyn Transport>,
        dispatch: Dispatch,
    ) -> AccountService {
        let mut config = Configuration::default();
        config.url = "https://accounts.test/".into();
        let mail = MailManager::start(users.clone(), transport, dispatch);
        let crypto = Crypto::new(Some(light_argon2()), "secret").unwrap();

        AccountService::new(&config, users, blacklist, crypto, mail).unwrap()
    }

    fn harness() -> Harness {
        let users = Arc::new(MemoryUserRepository::new());
        let blacklist = Arc::new(MemoryTokenBlacklist::new());
        let transport = Arc::new(RecordingTransport::default());
        let service = service(
            users.clone(),
            blacklist.clone(),
            transport.clone(),
            Dispatch {
                retry_delay: std::time::Duration::ZERO,
                ..Default::default()
            },
        );

        Harness {
            service,
            users,
            blacklist,
            transport,
        }
    }

    fn link_parts(link: &str) -> (String, String) {
        let parts: Vec<&str> = link.trim_end_matches('/').rsplit('/').take(2).collect();
        (parts[1].to_owned(), parts[0].to_owned())
    }

    #[tokio::test]
    async fn test_register() {
        let h = harness();

        let registered = h
            .service
            .register("a@X.com", "A", "StrongPass1")
            .await
            .unwrap();
        assert_eq!(registered.user.email, "a@x.com");
        assert_eq!(registered.user.name, "A");
        assert!(!registered.user.is_verified);
        assert_ne!(registered.user.password, "StrongPass1");

        let claims = h
            .service
            .tokens()
            .decode(&registered.tokens.access, TokenType::Access)
            .unwrap();
        assert_eq!(claims.user_id(), Some(registered.user.id));

        let sent = h.transport.wait_for(1).await;
        assert_eq!(sent[0].to, "a@x.com");
        assert_eq!(sent[0].subject, "Activate your account");
        assert!(sent[0].body.contains("https://accounts.test/api/activate/"));
    }

    #[tokio::test]
    async fn test_register_conflict_and_policy() {
        let h = harness();
        h.service.register("a@x.com", "A", "StrongPass1").await.unwrap();

        assert!(matches!(
            h.service.register("a@x.com", "B", "StrongPass1").await,
            Err(ServerError::Conflict { field: "email", .. })
        ));
        assert!(matches!(
            h.service.register("b@x.com", "B", "short").await,
            Err(ServerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_activation() {
        let h = harness();
        let a = h.service.register("a@x.com", "A", "StrongPass1").await.unwrap();
        let b = h.service.register("b@x.com", "B", "StrongPass1").await.unwrap();

        let (uid_a, token_a) = link_parts(&h.service.activation_link(&a.user));
        let (uid_b, _) = link_parts(&h.service.activation_link(&b.user));

        assert!(matches!(
            h.service.activate(&uid_b, &token_a).await,
            Err(ServerError::InvalidLink)
        ));
        assert!(matches!(
            h.service.activate("garbage", &token_a).await,
            Err(ServerError::InvalidLink)
        ));

        h.service.activate(&uid_a, &token_a).await.unwrap();
        assert!(h.users.find_by_id(a.user.id).await.unwrap().unwrap().is_verified);

        assert!(matches!(
            h.service.activate(&uid_a, &token_a).await,
            Err(ServerError::InvalidLink)
        ));
    }

    #[tokio::test]
    async fn test_login_requires_verification() {
        let h = harness();
        let a = h.service.register("a@x.com", "A", "StrongPass1").await.unwrap();

        let Err(ServerError::Validation(errors)) =
            h.service.login("a@x.com", "StrongPass1").await
        else {
            panic!("expected validation error");
        };
        assert_eq!(
            errors.field_errors()[NON_FIELD_ERRORS][0].to_string(),
            EMAIL_NOT_VERIFIED
        );
        assert!(matches!(
            h.service.login("a@x.com", "WrongPass1").await,
            Err(ServerError::Authentication(NO_ACTIVE_ACCOUNT))
        ));
        assert!(h.service.obtain_pair("a@x.com", "StrongPass1").await.is_ok());

        h.users.set_verified(a.user.id).await.unwrap();
        assert!(h.service.login("a@x.com", "StrongPass1").await.is_ok());
        assert!(matches!(
            h.service.login("a@x.com", "WrongPass1").await,
            Err(ServerError::Authentication(NO_ACTIVE_ACCOUNT))
        ));
        assert!(matches!(
            h.service.login("nobody@x.com", "StrongPass1").await,
            Err(ServerError::Authentication(NO_ACTIVE_ACCOUNT))
        ));
    }

    #[tokio::test]
    async fn test_logout_then_refresh() {
        let h = harness();
        let a = h.service.register("a@x.com", "A", "StrongPass1").await.unwrap();
        let refresh = a.tokens.refresh.token;

        assert!(h.service.refresh(&refresh).await.is_ok());
        assert!(matches!(
            h.service.refresh(&a.tokens.access).await,
            Err(ServerError::InvalidToken)
        ));

        h.service.logout(&a.user, &refresh).await.unwrap();
        assert!(matches!(
            h.service.refresh(&refresh).await,
            Err(ServerError::InvalidToken)
        ));
        assert!(matches!(
            h.service.logout(&a.user, &refresh).await,
            Err(ServerError::BadRequest)
        ));
        assert!(matches!(
            h.service.logout(&a.user, "garbage").await,
            Err(ServerError::BadRequest)
        ));
    }

    #[tokio::test]
    async fn test_revoked_token_stays_revoked_after_purge() {
        let h = harness();
        let a = h.service.register("a@x.com", "A", "StrongPass1").await.unwrap();
        let refresh = a.tokens.refresh.token;

        h.service.logout(&a.user, &refresh).await.unwrap();
        assert_eq!(h.blacklist.purge_at(u64::MAX), 1);

        assert!(matches!(
            h.service.refresh(&refresh).await,
            Err(ServerError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_refresh_requires_registered_token() {
        let h = harness();
        let a = h.service.register("a@x.com", "A", "StrongPass1").await.unwrap();

        // Signed by the service but never recorded as issued.
        let pair = h.service.tokens().create_pair(a.user.id).unwrap();
        assert!(matches!(
            h.service.refresh(&pair.refresh.token).await,
            Err(ServerError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_register_with_stalled_mail_queue() {
        let users = Arc::new(MemoryUserRepository::new());
        let service = service(
            users,
            Arc::new(MemoryTokenBlacklist::new()),
            Arc::new(StalledTransport),
            Dispatch {
                workers: 1,
                queue_size: 1,
                ..Default::default()
            },
        );

        for email in ["a@x.com", "b@x.com", "c@x.com", "d@x.com"] {
            let registered = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                service.register(email, "A", "StrongPass1"),
            )
            .await
            .expect("registration waited on the mail queue")
            .unwrap();
            assert_eq!(registered.user.email, email);
        }
    }

    #[tokio::test]
    async fn test_logout_foreign_token() {
        let h = harness();
        let a = h.service.register("a@x.com", "A", "StrongPass1").await.unwrap();
        let b = h.service.register("b@x.com", "B", "StrongPass1").await.unwrap();

        assert!(matches!(
            h.service.logout(&a.user, &b.tokens.refresh.token).await,
            Err(ServerError::BadRequest)
        ));
        assert!(h.service.refresh(&b.tokens.refresh.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_change_password() {
        let h = harness();
        let a = h.service.register("a@x.com", "A", "StrongPass1").await.unwrap();

        let err = h
            .service
            .change_password(&a.user, "WrongPass1", "NewStrong1")
            .await
            .unwrap_err();
        let ServerError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert!(errors.field_errors().contains_key("old_password"));
        assert_eq!(
            h.users.find_by_id(a.user.id).await.unwrap().unwrap().password,
            a.user.password
        );

        h.service
            .change_password(&a.user, "StrongPass1", "NewStrong1")
            .await
            .unwrap();
        let stored = h.users.find_by_id(a.user.id).await.unwrap().unwrap();
        assert!(h.service.crypto.pwd.verify_password("NewStrong1", &stored.password));

        // Sessions survive a password change.
        assert!(h.service.refresh(&a.tokens.refresh.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_profile() {
        let h = harness();
        let a = h.service.register("a@x.com", "A", "StrongPass1").await.unwrap();

        let user = h.service.update_profile(a.user, Some("B")).await.unwrap();
        assert_eq!(user.name, "B");
        assert_eq!(user.email, "a@x.com");

        let user = h.service.update_profile(user, None).await.unwrap();
        assert_eq!(user.name, "B");
        assert_eq!(h.users.find_by_id(user.id).await.unwrap().unwrap().name, "B");
    }

    #[tokio::test]
    async fn test_authenticate() {
        let h = harness();
        let a = h.service.register("a@x.com", "A", "StrongPass1").await.unwrap();

        assert_eq!(
            h.service.authenticate(&a.tokens.access).await.unwrap().id,
            a.user.id
        );
        assert!(matches!(
            h.service.authenticate(&a.tokens.refresh.token).await,
            Err(ServerError::Unauthorized)
        ));
    }
}
