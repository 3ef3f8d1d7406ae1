//! HTTP handshake connector
//!
//! Turns a credential into a session through the client-credentials
//! handshake in `session_auth::handshake`, and maps handshake errors onto the
//! failure classes the rotator acts on.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use connector::{Connector, ConnectorError, Credential, Session};
use tracing::debug;

/// Connector for credentials that authenticate against an auth endpoint.
pub struct HttpConnector {
    client: reqwest::Client,
    auth_url: String,
}

impl HttpConnector {
    pub fn new(client: reqwest::Client, auth_url: impl Into<String>) -> Self {
        Self {
            client,
            auth_url: auth_url.into(),
        }
    }
}

impl Connector for HttpConnector {
    fn id(&self) -> &str {
        "http"
    }

    fn authenticate<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = connector::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let token = session_auth::authenticate(
                &self.client,
                &self.auth_url,
                &credential.client_id,
                credential.client_secret.expose(),
            )
            .await
            .map_err(connector_error)?;
            debug!(
                resource = credential.name,
                expires_in = token.expires_in,
                "handshake complete"
            );
            Ok(token.access_token)
        })
    }

    fn validate<'a>(
        &'a self,
        _credential: &'a Credential,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = connector::Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            session_auth::validate(&self.client, &self.auth_url, token)
                .await
                .map_err(connector_error)
        })
    }

    fn disconnect<'a>(&'a self, session: &'a Session) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        session.close();
        Box::pin(async {})
    }
}

fn connector_error(err: session_auth::Error) -> ConnectorError {
    match err {
        session_auth::Error::InvalidCredentials(message) => ConnectorError::AuthRequired(message),
        session_auth::Error::RateLimited { retry_after_secs } => ConnectorError::RateLimited {
            retry_after: Duration::from_secs(retry_after_secs),
            message: err.to_string(),
        },
        other => ConnectorError::Transient(other.to_string()),
    }
}
