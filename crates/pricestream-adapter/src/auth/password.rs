/*
[INPUT]:  Proposed new password
[OUTPUT]: Policy verdict before a password change is sent
[POS]:    Auth layer - local password policy check
[UPDATE]: When the server-side password rules change
*/

use crate::http::AuthError;

/// Special characters accepted by the password policy
pub const SPECIAL_CHARACTERS: &str = "~!@#$%^&*()-_=+[]{}|;:,.<>/?";

/// Password rules enforced by the authentication service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_length: usize,
    /// Out of upper case, lower case, digit and special
    pub min_categories: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 30,
            min_categories: 3,
        }
    }
}

impl PasswordPolicy {
    pub fn validate(&self, password: &str) -> Result<(), AuthError> {
        if let Some(invalid) = password
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !SPECIAL_CHARACTERS.contains(*c))
        {
            return Err(AuthError::PasswordPolicy(format!(
                "character {invalid:?} is not allowed"
            )));
        }

        let length = password.chars().count();
        if length < self.min_length {
            return Err(AuthError::PasswordPolicy(format!(
                "must be at least {} characters, got {length}",
                self.min_length
            )));
        }

        let categories = [
            password.chars().any(|c| c.is_ascii_uppercase()),
            password.chars().any(|c| c.is_ascii_lowercase()),
            password.chars().any(|c| c.is_ascii_digit()),
            password.chars().any(|c| SPECIAL_CHARACTERS.contains(c)),
        ]
        .iter()
        .filter(|present| **present)
        .count();

        if categories < self.min_categories {
            return Err(AuthError::PasswordPolicy(format!(
                "must mix at least {} of upper case, lower case, digits and special characters",
                self.min_categories
            )));
        }
        Ok(())
    }
}
