//! Configuration for the container factory.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use yarnpool_reconcile::{BackoffPolicy, PollPolicy};

/// How requests to the resource manager are authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Pseudo-authentication: `?user.name={user}` on every request.
    Simple { user: String },

    /// SPNEGO: `Authorization: Negotiate {token}` on every request. The token
    /// is obtained out of band (e.g. by a `kinit` sidecar).
    Kerberos { token: String },
}

impl AuthMode {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMode::Simple { .. } => "simple",
            AuthMode::Kerberos { .. } => "kerberos",
        }
    }
}

/// Container factory configuration.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Resource manager REST base URL, including the API prefix.
    pub resource_manager_url: String,

    pub auth: AuthMode,

    /// Name of the service that hosts every container of this factory.
    pub service_name: String,

    pub service_version: String,

    /// Queue placement hint.
    pub queue: String,

    /// Registry prepended to runtime images that are not caller-provided.
    pub runtimes_registry: Option<String>,

    /// Memory per container when the caller passes zero.
    pub default_memory_mb: u64,

    /// CPUs per container when the caller passes zero.
    pub default_cpus: u32,

    /// First delay between status polls.
    pub poll_interval: Duration,

    /// Ceiling for the growing delay between status polls.
    pub poll_max_interval: Duration,

    /// Deadline for the service to become STABLE (or absent).
    pub service_timeout: Duration,

    /// Deadline for a component to reach its desired count.
    pub container_timeout: Duration,

    /// Per-request HTTP timeout.
    pub request_timeout: Duration,

    /// Whether destroy waits for the scale-down to converge.
    pub wait_on_destroy: bool,

    /// Whether log links reported by the resource manager are surfaced.
    pub surface_log_links: bool,

    /// Images declared as zero-count components when the service is created.
    pub predeclared_images: Vec<String>,

    /// Containers the daemon starts per predeclared image after init.
    pub prewarm_count: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            resource_manager_url: "http://127.0.0.1:8088/app/v1".to_string(),
            auth: AuthMode::Simple {
                user: "yarnpool".to_string(),
            },
            service_name: "yarnpool-actions".to_string(),
            service_version: "1.0.0".to_string(),
            queue: "default".to_string(),
            runtimes_registry: None,
            default_memory_mb: 256,
            default_cpus: 1,
            poll_interval: Duration::from_millis(500),
            poll_max_interval: Duration::from_secs(5),
            service_timeout: Duration::from_secs(300),
            container_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            wait_on_destroy: true,
            surface_log_links: false,
            predeclared_images: Vec::new(),
            prewarm_count: 0,
            log_level: "info".to_string(),
        }
    }
}

impl FactoryConfig {
    /// Load configuration from `YARNPOOL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let user = std::env::var("YARNPOOL_AUTH_USER")
            .or_else(|_| std::env::var("USER"))
            .unwrap_or_else(|_| "yarnpool".to_string());
        let auth = parse_auth(
            &env_or("YARNPOOL_AUTH_MODE", "simple"),
            user,
            std::env::var("YARNPOOL_KERBEROS_TOKEN").ok(),
        )?;

        Ok(Self {
            resource_manager_url: env_or("YARNPOOL_RM_URL", &defaults.resource_manager_url),
            auth,
            service_name: env_or("YARNPOOL_SERVICE_NAME", &defaults.service_name),
            service_version: env_or("YARNPOOL_VERSION", &defaults.service_version),
            queue: env_or("YARNPOOL_QUEUE", &defaults.queue),
            runtimes_registry: std::env::var("YARNPOOL_RUNTIMES_REGISTRY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            default_memory_mb: env_parse("YARNPOOL_DEFAULT_MEMORY_MB", defaults.default_memory_mb)?,
            default_cpus: env_parse("YARNPOOL_DEFAULT_CPUS", defaults.default_cpus)?,
            poll_interval: Duration::from_millis(env_parse("YARNPOOL_POLL_INTERVAL_MS", 500)?),
            poll_max_interval: Duration::from_millis(env_parse(
                "YARNPOOL_POLL_MAX_INTERVAL_MS",
                5000,
            )?),
            service_timeout: Duration::from_secs(env_parse("YARNPOOL_SERVICE_TIMEOUT_SECS", 300)?),
            container_timeout: Duration::from_secs(env_parse(
                "YARNPOOL_CONTAINER_TIMEOUT_SECS",
                120,
            )?),
            request_timeout: Duration::from_secs(env_parse("YARNPOOL_REQUEST_TIMEOUT_SECS", 30)?),
            wait_on_destroy: env_flag("YARNPOOL_WAIT_ON_DESTROY", defaults.wait_on_destroy),
            surface_log_links: env_flag("YARNPOOL_SURFACE_LOG_LINKS", defaults.surface_log_links),
            predeclared_images: parse_images(&env_or("YARNPOOL_PREDECLARED_IMAGES", "")),
            prewarm_count: env_parse("YARNPOOL_PREWARM_COUNT", defaults.prewarm_count)?,
            log_level: env_or("YARNPOOL_LOG_LEVEL", &defaults.log_level),
        })
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.poll_interval,
            max: self.poll_max_interval.max(self.poll_interval),
            jitter: 0.1,
        }
    }

    /// Poll policy for service-level stability.
    pub fn service_poll_policy(&self) -> PollPolicy {
        PollPolicy::new(self.backoff(), self.service_timeout)
    }

    /// Poll policy for component flex convergence.
    pub fn container_poll_policy(&self) -> PollPolicy {
        PollPolicy::new(self.backoff(), self.container_timeout)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_auth(mode: &str, user: String, token: Option<String>) -> Result<AuthMode> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "simple" => Ok(AuthMode::Simple { user }),
        "kerberos" => match token.filter(|t| !t.is_empty()) {
            Some(token) => Ok(AuthMode::Kerberos { token }),
            None => bail!("YARNPOOL_AUTH_MODE=kerberos requires YARNPOOL_KERBEROS_TOKEN"),
        },
        other => bail!("unknown YARNPOOL_AUTH_MODE {other:?} (expected simple or kerberos)"),
    }
}

fn parse_images(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("simple", None, Some(AuthMode::Simple { user: "whisk".into() }))]
    #[case("SIMPLE", Some("ignored"), Some(AuthMode::Simple { user: "whisk".into() }))]
    #[case("kerberos", Some("tok"), Some(AuthMode::Kerberos { token: "tok".into() }))]
    #[case("kerberos", None, None)]
    #[case("kerberos", Some(""), None)]
    #[case("digest", None, None)]
    fn test_parse_auth(
        #[case] mode: &str,
        #[case] token: Option<&str>,
        #[case] expected: Option<AuthMode>,
    ) {
        let parsed = parse_auth(mode, "whisk".to_string(), token.map(str::to_string)).ok();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_parse_images() {
        assert_eq!(
            parse_images(" openwhisk/nodejs:20 , ,openwhisk/python:3 "),
            vec!["openwhisk/nodejs:20", "openwhisk/python:3"]
        );
        assert!(parse_images("").is_empty());
    }

    #[test]
    fn test_poll_policies() {
        let config = FactoryConfig {
            poll_interval: Duration::from_millis(100),
            poll_max_interval: Duration::from_millis(10),
            ..Default::default()
        };

        let policy = config.container_poll_policy();
        assert_eq!(policy.timeout, config.container_timeout);
        assert_eq!(policy.backoff.max, Duration::from_millis(100));
        assert_eq!(config.service_poll_policy().timeout, config.service_timeout);
    }
}
