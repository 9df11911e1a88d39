use std::fmt;
use std::time::Duration;

use crate::constants;

/// A provider credential that has passed resolution.
///
/// Blank values and the placeholder key never become an `ApiKey`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Resolve the effective key: a non-blank override wins, otherwise the
    /// environment value is used.
    pub fn resolve(override_key: Option<&str>) -> Option<Self> {
        let candidate = match override_key.map(str::trim) {
            Some(key) if !key.is_empty() => key,
            _ => constants::MODELSCOPE_API_KEY.trim(),
        };
        Self::parse(candidate)
    }

    /// Accept a single value without consulting the environment.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || value == constants::PLACEHOLDER_API_KEY {
            None
        } else {
            Some(Self(value.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Everything the provider client needs apart from the credential.
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl InterpreterConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: constants::MODELSCOPE_BASE_URL.trim_end_matches('/').to_string(),
            model: constants::DIVINA_MODEL.clone(),
            temperature: constants::TEMPERATURE,
            max_tokens: constants::MAX_TOKENS,
            timeout: Duration::from_secs(constants::REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
