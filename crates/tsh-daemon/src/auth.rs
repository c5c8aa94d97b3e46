//! Device authentication tokens.
//!
//! The daemon does not authenticate itself; some other agent on the device
//! does and publishes a bearer token. A [`TokenProvider`] reads that token.
//! An empty token means the device is not authorized (yet).

use crate::config::TokenSource;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use tsh_core::{TshError, TshResult};

/// Source of the current bearer token.
#[allow(async_fn_in_trait)]
pub trait TokenProvider {
    /// The current token. Empty when the device is not authorized.
    async fn get_token(&self) -> TshResult<String>;
}

/// Poll `provider` until it yields a non-empty token.
///
/// Waits indefinitely while the token is empty; a provider error ends the
/// wait with [`TshError::Token`].
pub async fn acquire_token<P: TokenProvider>(
    provider: &P,
    poll_interval: Duration,
) -> TshResult<String> {
    let mut logged = false;
    loop {
        let token = provider
            .get_token()
            .await
            .map_err(|e| match e {
                TshError::Token(_) => e,
                other => TshError::Token(other.to_string()),
            })?;
        if !token.is_empty() {
            debug!("token acquired");
            return Ok(token);
        }
        if !logged {
            info!("device not authorized yet, waiting for token");
            logged = true;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Whether the device is currently unauthorized.
///
/// Only a successfully read empty token counts; a provider failure says
/// nothing about authorization.
pub async fn is_unauthorized<P: TokenProvider>(provider: &P) -> bool {
    match provider.get_token().await {
        Ok(token) => token.is_empty(),
        Err(e) => {
            warn!(error = %e, "could not check authorization state");
            false
        }
    }
}

/// A fixed token, typically given on the command line.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> TshResult<String> {
        Ok(self.token.clone())
    }
}

/// Reads the token from a file that the device's auth agent rewrites.
///
/// A missing file reads as an empty token.
#[derive(Debug, Clone)]
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenProvider for FileTokenProvider {
    async fn get_token(&self) -> TshResult<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(TshError::Token(format!(
                "cannot read {}: {e}",
                self.path.display()
            ))),
        }
    }
}

/// The provider selected by configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredTokenProvider {
    Static(StaticTokenProvider),
    File(FileTokenProvider),
}

impl From<TokenSource> for ConfiguredTokenProvider {
    fn from(source: TokenSource) -> Self {
        match source {
            TokenSource::Static(token) => Self::Static(StaticTokenProvider::new(token)),
            TokenSource::File(path) => Self::File(FileTokenProvider::new(path)),
        }
    }
}

impl TokenProvider for ConfiguredTokenProvider {
    async fn get_token(&self) -> TshResult<String> {
        match self {
            Self::Static(p) => p.get_token().await,
            Self::File(p) => p.get_token().await,
        }
    }
}
