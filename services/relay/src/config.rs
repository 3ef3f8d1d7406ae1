//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credential secrets are loaded from `RELAY_SECRET_<NAME>` or the
//! credential's `client_secret_file`, never stored in the TOML directly.

use common::Secret;
use connector::Credential;
use dispatcher::{DispatcherConfig, RetryOrdering};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    pub rotator: RotatorSection,
    pub upstream: UpstreamSection,
    pub admin: AdminSection,
}

/// Worker pool, retry and cleanup settings
#[derive(Debug, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_per_owner_limit")]
    pub per_owner_limit: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub retry_ordering: RetryOrdering,
    /// 0 disables the per-call timeout
    #[serde(default)]
    pub job_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_job_max_age")]
    pub job_max_age_secs: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            per_owner_limit: default_per_owner_limit(),
            poll_interval_ms: default_poll_interval(),
            retry_ordering: RetryOrdering::default(),
            job_timeout_secs: 0,
            cleanup_interval_secs: default_cleanup_interval(),
            job_max_age_secs: default_job_max_age(),
        }
    }
}

/// How a credential becomes a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    /// The secret is used as the bearer token directly
    #[default]
    Static,
    /// Client-credentials handshake against `auth_url`
    Http,
}

/// Resource rotator settings
#[derive(Debug, Deserialize)]
pub struct RotatorSection {
    #[serde(default)]
    pub connector: ConnectorKind,
    #[serde(default)]
    pub auth_url: Option<String>,
    pub session_dir: PathBuf,
    #[serde(default = "default_session_cache_capacity")]
    pub session_cache_capacity: usize,
    /// 0 disables background session warm-up
    #[serde(default = "default_warm_interval")]
    pub warm_interval_secs: u64,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

/// One credential set
#[derive(Debug, Deserialize)]
pub struct CredentialConfig {
    pub name: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
}

/// Upstream the fetch processor calls
#[derive(Debug, Deserialize)]
pub struct UpstreamSection {
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
}

/// Admin HTTP listener
#[derive(Debug, Deserialize)]
pub struct AdminSection {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_workers() -> usize {
    5
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    5
}

fn default_per_owner_limit() -> usize {
    3
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_job_max_age() -> u64 {
    86400
}

fn default_session_cache_capacity() -> usize {
    64
}

fn default_warm_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_wait() -> u64 {
    120
}

fn default_max_connections() -> usize {
    1000
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Env var holding the secret for credential `name`.
pub fn secret_env_key(name: &str) -> String {
    format!("RELAY_SECRET_{}", name.to_uppercase().replace('-', "_"))
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve every
    /// credential secret.
    ///
    /// Secret resolution order per credential:
    /// 1. `RELAY_SECRET_<NAME>` env var
    /// 2. `client_secret_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        for credential in &mut config.rotator.credentials {
            let key = secret_env_key(&credential.name);
            let secret =
                common::resolve_secret(&key, credential.client_secret_file.as_deref())?;
            if secret.is_none() {
                return Err(common::Error::Secret(format!(
                    "no secret for credential {} (set {key} or client_secret_file)",
                    credential.name
                )));
            }
            credential.client_secret = secret;
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let d = &self.dispatcher;
        if d.max_workers == 0 {
            return Err(common::Error::Config(
                "max_workers must be greater than 0".into(),
            ));
        }
        if d.per_owner_limit == 0 {
            return Err(common::Error::Config(
                "per_owner_limit must be greater than 0".into(),
            ));
        }
        if d.poll_interval_ms == 0 {
            return Err(common::Error::Config(
                "poll_interval_ms must be greater than 0".into(),
            ));
        }

        if !is_http_url(&self.upstream.url) {
            return Err(common::Error::Config(format!(
                "upstream url must start with http:// or https://, got: {}",
                self.upstream.url
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.upstream.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be greater than 0".into(),
            ));
        }
        if self.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        let r = &self.rotator;
        if r.connector == ConnectorKind::Http {
            match r.auth_url.as_deref() {
                Some(url) if is_http_url(url) => {}
                Some(url) => {
                    return Err(common::Error::Config(format!(
                        "auth_url must start with http:// or https://, got: {url}"
                    )));
                }
                None => {
                    return Err(common::Error::Config(
                        "auth_url is required for the http connector".into(),
                    ));
                }
            }
        }
        if r.credentials.is_empty() {
            return Err(common::Error::Config(
                "at least one [[rotator.credentials]] entry is required".into(),
            ));
        }
        let mut seen = HashSet::new();
        for credential in &r.credentials {
            if !is_valid_name(&credential.name) {
                return Err(common::Error::Config(format!(
                    "credential name {:?} may only contain letters, digits, '_' and '-'",
                    credential.name
                )));
            }
            if !seen.insert(credential.name.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate credential name: {}",
                    credential.name
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("transcribe-relay.toml")
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let d = &self.dispatcher;
        DispatcherConfig {
            max_workers: d.max_workers,
            max_retries: d.max_retries,
            retry_delay: Duration::from_secs(d.retry_delay_secs),
            per_owner_limit: d.per_owner_limit,
            poll_interval: Duration::from_millis(d.poll_interval_ms),
            retry_ordering: d.retry_ordering,
            job_timeout: (d.job_timeout_secs > 0).then(|| Duration::from_secs(d.job_timeout_secs)),
        }
    }

    /// Credential sets in configuration order, with their resolved secrets.
    pub fn credentials(&self) -> Vec<Credential> {
        self.rotator
            .credentials
            .iter()
            .map(|c| {
                let secret = c
                    .client_secret
                    .as_ref()
                    .map(|s| s.expose().clone())
                    .unwrap_or_default();
                Credential::new(&c.name, &c.client_id, secret)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    const BASE: &str = r#"
[rotator]
session_dir = "/tmp/relay-sessions"

[[rotator.credentials]]
name = "primary"
client_id = "app-1"

[[rotator.credentials]]
name = "backup-2"

[upstream]
url = "https://media.example.com/v1"

[admin]
listen_addr = "127.0.0.1:9090"
"#;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn with_secrets<T>(f: impl FnOnce() -> T) -> T {
        unsafe {
            set_env("RELAY_SECRET_PRIMARY", "secret-primary");
            set_env("RELAY_SECRET_BACKUP_2", "secret-backup");
        }
        let out = f();
        unsafe {
            remove_env("RELAY_SECRET_PRIMARY");
            remove_env("RELAY_SECRET_BACKUP_2");
        }
        out
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), BASE);

        let config = with_secrets(|| Config::load(&path)).unwrap();
        assert_eq!(config.dispatcher.max_workers, 5);
        assert_eq!(config.dispatcher.max_retries, 2);
        assert_eq!(config.dispatcher.per_owner_limit, 3);
        assert_eq!(config.dispatcher.retry_ordering, RetryOrdering::PreserveOriginal);
        assert_eq!(config.rotator.connector, ConnectorKind::Static);
        assert_eq!(config.rotator.session_cache_capacity, 64);
        assert_eq!(config.rotator.warm_interval_secs, 30);
        assert_eq!(config.upstream.timeout_secs, 60);
        assert_eq!(config.upstream.max_attempts, 3);
        assert_eq!(config.upstream.max_wait_secs, 120);
        assert_eq!(config.admin.max_connections, 1000);

        let credentials = config.credentials();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[0].name, "primary");
        assert_eq!(credentials[0].client_id, "app-1");
        assert_eq!(credentials[0].client_secret.expose(), "secret-primary");
        assert_eq!(credentials[1].client_secret.expose(), "secret-backup");
    }

    #[test]
    fn test_dispatcher_config_conversion() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml_content = format!(
            r#"
[dispatcher]
max_workers = 8
retry_delay_secs = 2
poll_interval_ms = 250
retry_ordering = "reset-to-now"
job_timeout_secs = 90
{BASE}"#
        );
        let path = write_config(dir.path(), &toml_content);

        let config = with_secrets(|| Config::load(&path)).unwrap();
        let dc = config.dispatcher_config();
        assert_eq!(dc.max_workers, 8);
        assert_eq!(dc.retry_delay, Duration::from_secs(2));
        assert_eq!(dc.poll_interval, Duration::from_millis(250));
        assert_eq!(dc.retry_ordering, RetryOrdering::ResetToNow);
        assert_eq!(dc.job_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_zero_job_timeout_means_none() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), BASE);
        let config = with_secrets(|| Config::load(&path)).unwrap();
        assert!(config.dispatcher_config().job_timeout.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_secret_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("primary.secret");
        std::fs::write(&secret_path, "file-secret\n").unwrap();

        let toml_content = format!(
            r#"
[rotator]
session_dir = "/tmp/relay-sessions"

[[rotator.credentials]]
name = "primary"
client_secret_file = "{}"

[upstream]
url = "http://localhost:8000"

[admin]
listen_addr = "127.0.0.1:9090"
"#,
            secret_path.display()
        );
        let path = write_config(dir.path(), &toml_content);

        unsafe { remove_env("RELAY_SECRET_PRIMARY") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.credentials()[0].client_secret.expose(), "file-secret");
    }

    #[test]
    fn test_secret_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("primary.secret");
        std::fs::write(&secret_path, "file-secret").unwrap();

        let toml_content = format!(
            r#"
[rotator]
session_dir = "/tmp/relay-sessions"

[[rotator.credentials]]
name = "primary"
client_secret_file = "{}"

[upstream]
url = "http://localhost:8000"

[admin]
listen_addr = "127.0.0.1:9090"
"#,
            secret_path.display()
        );
        let path = write_config(dir.path(), &toml_content);

        unsafe { set_env("RELAY_SECRET_PRIMARY", "env-secret") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("RELAY_SECRET_PRIMARY") };
        assert_eq!(config.credentials()[0].client_secret.expose(), "env-secret");
    }

    #[test]
    fn test_missing_secret_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), BASE);

        unsafe {
            remove_env("RELAY_SECRET_PRIMARY");
            remove_env("RELAY_SECRET_BACKUP_2");
        }
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, common::Error::Secret(_)), "got: {err:?}");
        assert!(err.to_string().contains("RELAY_SECRET_PRIMARY"));
    }

    #[test]
    fn test_secret_env_key_normalizes_name() {
        assert_eq!(secret_env_key("backup-2"), "RELAY_SECRET_BACKUP_2");
        assert_eq!(secret_env_key("Primary"), "RELAY_SECRET_PRIMARY");
    }

    fn assert_config_error(toml_content: &str, needle: &str) {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), toml_content);
        let err = with_secrets(|| Config::load(&path)).unwrap_err();
        assert!(matches!(err, common::Error::Config(_)), "got: {err:?}");
        assert!(err.to_string().contains(needle), "got: {err}");
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert_config_error(&format!("[dispatcher]\nmax_workers = 0\n{BASE}"), "max_workers");
    }

    #[test]
    fn test_zero_owner_limit_rejected() {
        assert_config_error(
            &format!("[dispatcher]\nper_owner_limit = 0\n{BASE}"),
            "per_owner_limit",
        );
    }

    #[test]
    fn test_invalid_upstream_url_rejected() {
        assert_config_error(
            &BASE.replace("https://media.example.com/v1", "media.example.com"),
            "upstream url",
        );
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert_config_error(
            &BASE.replace(
                "url = \"https://media.example.com/v1\"",
                "url = \"https://media.example.com/v1\"\nmax_attempts = 0",
            ),
            "max_attempts",
        );
    }

    #[test]
    fn test_empty_credentials_rejected() {
        assert_config_error(
            r#"
[rotator]
session_dir = "/tmp/relay-sessions"

[upstream]
url = "https://media.example.com"

[admin]
listen_addr = "127.0.0.1:9090"
"#,
            "rotator.credentials",
        );
    }

    #[test]
    fn test_duplicate_credentials_rejected() {
        assert_config_error(
            &BASE.replace("name = \"backup-2\"", "name = \"primary\""),
            "duplicate credential name",
        );
    }

    #[test]
    fn test_invalid_credential_name_rejected() {
        assert_config_error(
            &BASE.replace("name = \"backup-2\"", "name = \"../escape\""),
            "may only contain",
        );
    }

    #[test]
    fn test_http_connector_requires_auth_url() {
        assert_config_error(
            &BASE.replace(
                "session_dir = \"/tmp/relay-sessions\"",
                "session_dir = \"/tmp/relay-sessions\"\nconnector = \"http\"",
            ),
            "auth_url is required",
        );
    }

    #[test]
    fn test_http_connector_with_auth_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml_content = BASE.replace(
            "session_dir = \"/tmp/relay-sessions\"",
            "session_dir = \"/tmp/relay-sessions\"\nconnector = \"http\"\nauth_url = \"https://auth.example.com\"",
        );
        let path = write_config(dir.path(), &toml_content);
        let config = with_secrets(|| Config::load(&path)).unwrap();
        assert_eq!(config.rotator.connector, ConnectorKind::Http);
        assert_eq!(
            config.rotator.auth_url.as_deref(),
            Some("https://auth.example.com")
        );
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("transcribe-relay.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
