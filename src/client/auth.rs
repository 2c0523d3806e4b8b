/// Supplies the bearer token for transports and REST calls.
///
/// `None` means "not ready yet" (signed out, token still loading). Callers
/// wait rather than fail.
pub trait AuthProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl AuthProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Reads the token from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub const DEFAULT_VAR: &'static str = "CHAT_STREAM_TOKEN";

    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

impl AuthProvider for EnvTokenProvider {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}
