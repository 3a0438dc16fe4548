use crate::db::models::User;
use crate::error::AuthError;

const MIN_PASSWORD_LEN: usize = 6;

/// Field-level messages for an auth form. Empty means the form may submit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormErrors {
    pub email: Option<&'static str>,
    pub password: Option<&'static str>,
    pub name: Option<&'static str>,
    pub confirm_password: Option<&'static str>,
    pub general: Option<&'static str>,
}

impl FormErrors {
    pub fn is_empty(&self) -> bool {
        *self == FormErrors::default()
    }

    /// Maps a failed sign-in/sign-up to the form's general message.
    pub fn from_auth_error(err: &AuthError) -> Self {
        Self {
            general: Some(err.form_message()),
            ..Self::default()
        }
    }

    /// Every message, field order first, general last.
    pub fn messages(&self) -> Vec<&'static str> {
        [
            self.name,
            self.email,
            self.password,
            self.confirm_password,
            self.general,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

fn check_email(email: &str) -> Option<&'static str> {
    if email.is_empty() {
        Some("Email is required")
    } else if !User::is_valid_email(email) {
        Some("Email is invalid")
    } else {
        None
    }
}

fn check_password(password: &str) -> Option<&'static str> {
    if password.is_empty() {
        Some("Password is required")
    } else if password.chars().count() < MIN_PASSWORD_LEN {
        Some("Password must be at least 6 characters")
    } else {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

impl LoginForm {
    pub fn validate(&self) -> FormErrors {
        FormErrors {
            email: check_email(&self.email),
            password: check_password(&self.password),
            ..FormErrors::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignUpForm {
    pub name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
}

impl SignUpForm {
    pub fn validate(&self) -> FormErrors {
        let confirm_password = if self.confirm_password != self.password {
            Some("Passwords do not match")
        } else {
            None
        };
        FormErrors {
            name: self.name.trim().is_empty().then_some("Name is required"),
            email: check_email(&self.email),
            password: check_password(&self.password),
            confirm_password,
            general: None,
        }
    }
}
