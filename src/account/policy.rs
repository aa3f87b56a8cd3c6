//! Password acceptance rules.

use std::borrow::Cow;

use validator::{ValidationError, ValidationErrors};

use crate::config::Password as PasswordConfig;

/// Check passwords before they get hashed.
#[derive(Clone, Debug)]
pub struct PasswordPolicy {
    min_length: usize,
    max_length: usize,
    min_score: Option<u8>,
}

impl From<&PasswordConfig> for PasswordPolicy {
    fn from(config: &PasswordConfig) -> Self {
        Self {
            min_length: config.min_length,
            max_length: config.max_length,
            min_score: config.zxcvbn,
        }
    }
}

impl PasswordPolicy {
    /// Validate `password` and report issues under `field`.
    ///
    /// `user_inputs` are values the password should not be derived from,
    /// such as the email or the name.
    pub fn check(
        &self,
        field: &'static str,
        password: &str,
        user_inputs: &[&str],
    ) -> Result<(), ValidationErrors> {
        match self.issue(password, user_inputs) {
            Some(issue) => {
                let mut errors = ValidationErrors::new();
                errors.add(field, issue);
                Err(errors)
            },
            None => Ok(()),
        }
    }

    /// First rule `password` breaks, if any.
    pub fn issue(&self, password: &str, user_inputs: &[&str]) -> Option<ValidationError> {
        let length = password.chars().count();

        if password.is_empty() {
            Some(error("blank", "Password field may not be blank.".into()))
        } else if length < self.min_length {
            Some(error(
                "min_length",
                format!(
                    "Ensure password field has at least {} characters.",
                    self.min_length
                )
                .into(),
            ))
        } else if length > self.max_length {
            Some(error(
                "max_length",
                format!(
                    "Ensure password field has no more than {} characters.",
                    self.max_length
                )
                .into(),
            ))
        } else if self.is_weak(password, user_inputs) {
            Some(error("weak", "This password is too weak.".into()))
        } else {
            None
        }
    }

    fn is_weak(&self, password: &str, user_inputs: &[&str]) -> bool {
        let Some(min_score) = self.min_score else {
            return false;
        };

        match zxcvbn::zxcvbn(password, user_inputs) {
            Ok(entropy) => entropy.score() < min_score,
            Err(_) => true,
        }
    }
}

fn error(code: &'static str, message: Cow<'static, str>) -> ValidationError {
    ValidationError::new(code).with_message(message)
}
