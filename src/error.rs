use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("user not found")]
    UserNotFound,
    #[error("too many failed attempts")]
    TooManyAttempts,
    #[error("email already in use")]
    EmailAlreadyInUse,
    #[error("invalid email address")]
    InvalidEmail,
    #[error("password must be at least 6 characters")]
    WeakPassword,
    #[error("network error: {0}")]
    Network(String),
}

impl AuthError {
    /// Text shown in the login/sign-up form for this failure.
    pub fn form_message(&self) -> &'static str {
        match self {
            AuthError::UserNotFound => "No account found with this email.",
            AuthError::InvalidCredentials => "Incorrect password.",
            AuthError::InvalidEmail => "Invalid email address.",
            AuthError::TooManyAttempts => "Too many failed attempts. Please try again later.",
            AuthError::EmailAlreadyInUse => "An account with this email already exists.",
            AuthError::WeakPassword => "Password must be at least 6 characters.",
            AuthError::Network(_) => "Login failed. Please try again.",
        }
    }
}

impl From<PersistenceError> for AuthError {
    fn from(err: PersistenceError) -> Self {
        AuthError::Network(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown setting key: {0}")]
    UnknownKey(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<rusqlite::Error> for ConfigError {
    fn from(err: rusqlite::Error) -> Self {
        ConfigError::Persistence(err.into())
    }
}

macro_rules! serialize_as_display {
    ($($ty:ty),*) => {
        $(
            impl Serialize for $ty {
                fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
                where
                    S: serde::Serializer,
                {
                    serializer.serialize_str(&self.to_string())
                }
            }
        )*
    };
}

serialize_as_display!(AuthError, PersistenceError, ConfigError);
