//! Static-key connector: the credential secret is the session token.
//!
//! For upstreams that authenticate with a plain API key there is no handshake:
//! "authenticating" hands back the configured secret. The token is the secret,
//! so sessions are never persisted; `validate` only accepts a token that
//! still matches the configured key.

use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use crate::{Connector, ConnectorError, Credential, Result, Session};

/// Connector for API-key credentials.
#[derive(Debug, Default, Clone)]
pub struct StaticConnector;

impl StaticConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for StaticConnector {
    fn id(&self) -> &str {
        "static"
    }

    fn authenticate<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let secret = credential.client_secret.expose();
            if secret.is_empty() {
                return Err(ConnectorError::AuthRequired(format!(
                    "credential {} has an empty key",
                    credential.name
                )));
            }
            Ok(secret.clone())
        })
    }

    fn validate<'a>(
        &'a self,
        credential: &'a Credential,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let valid = token == credential.client_secret.expose().as_str();
            if !valid {
                debug!(resource = credential.name, "persisted key differs from configured key");
            }
            Ok(valid)
        })
    }

    fn disconnect<'a>(&'a self, session: &'a Session) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        session.close();
        Box::pin(async {})
    }

    fn persists_sessions(&self) -> bool {
        false
    }
}
