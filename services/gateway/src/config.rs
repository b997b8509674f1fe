//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets never live in the TOML: the admin key comes from GATEWAY_ADMIN_KEY
//! or `admin_key_file`, credentials are added through the admin API or an
//! import file.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use key_pool::{
    BucketClock, DispatchPolicy, OverflowPolicy, SelectionPolicy, Strategy, UsageBackend,
};
use provider::{HeaderInjection, ProviderKind};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub clearance: ClearanceConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// JSON credential file. Absent means an in-memory pool.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    #[serde(skip)]
    pub admin_key: Option<Secret<String>>,
    /// Path to a file containing the admin bearer key (alternative to GATEWAY_ADMIN_KEY)
    #[serde(default)]
    pub admin_key_file: Option<PathBuf>,
}

/// Selection and retry settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub strategy: Strategy,
    /// Per-provider strategy override, keyed by provider name.
    pub strategies: BTreeMap<String, Strategy>,
    pub daily_limit: Option<u64>,
    pub overflow: OverflowPolicy,
    pub hybrid_threshold: f64,
    pub max_attempts: usize,
    pub cooldown_secs: u64,
    /// Cool-down after a clearance challenge, shorter than `cooldown_secs`.
    pub clearance_cooldown_secs: u64,
    pub attempt_timeout_secs: u64,
    pub deadline_secs: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            strategies: BTreeMap::new(),
            daily_limit: None,
            overflow: OverflowPolicy::Soft,
            hybrid_threshold: 0.8,
            max_attempts: 3,
            cooldown_secs: 300,
            clearance_cooldown_secs: 30,
            attempt_timeout_secs: 120,
            deadline_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageBackendKind {
    #[default]
    Memory,
    Sqlite,
    Redis,
}

/// Usage counter storage
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub backend: UsageBackendKind,
    /// Database file, required for the sqlite backend.
    pub path: Option<PathBuf>,
    /// Server address, required for the redis backend. USAGE_REDIS_URL overrides.
    pub url: Option<String>,
    /// Namespace for every redis key, so instances can share a server.
    pub key_prefix: String,
    /// Offset that defines the daily bucket boundary, e.g. "+08:00".
    pub utc_offset: String,
    pub prune_interval_secs: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            backend: UsageBackendKind::Memory,
            path: None,
            url: None,
            key_prefix: "media-gateway:".into(),
            utc_offset: "+08:00".into(),
            prune_interval_secs: 3600,
        }
    }
}

/// Anti-bot clearance refresher
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClearanceConfig {
    pub enabled: bool,
    pub solver_url: String,
    pub target_url: String,
    /// Proxy the solver's browser goes through. CLEARANCE_PROXY overrides.
    pub proxy: Option<String>,
    pub default_ttl_secs: u64,
    pub refresh_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub max_timeout_secs: u64,
}

impl Default for ClearanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            solver_url: "http://localhost:8191".into(),
            target_url: "https://grok.com".into(),
            proxy: None,
            default_ttl_secs: 3600,
            refresh_interval_secs: 3600,
            backoff_base_secs: 300,
            max_timeout_secs: 60,
        }
    }
}

/// One upstream provider
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    /// Name of the cookie that carries the session secret.
    pub session_cookie: String,
    #[serde(default)]
    pub requires_clearance: bool,
    /// Model-name prefixes routed to this provider.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Plain-text key file (one secret per line) imported at startup.
    #[serde(default)]
    pub import_file: Option<PathBuf>,
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,
}

/// Header to inject into upstream requests
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
}

impl From<&HeaderConfig> for HeaderInjection {
    fn from(h: &HeaderConfig) -> Self {
        HeaderInjection {
            name: h.name.clone(),
            value: h.value.clone(),
        }
    }
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    1000
}

fn default_timeout() -> u64 {
    120
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Admin key resolution order:
    /// 1. GATEWAY_ADMIN_KEY env var
    /// 2. admin_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        if let Ok(url) = std::env::var("USAGE_REDIS_URL") {
            config.usage.url = Some(url).filter(|u| !u.trim().is_empty());
        }
        config.validate()?;

        if let Ok(key) = std::env::var("GATEWAY_ADMIN_KEY") {
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.server.admin_key = Some(Secret::new(key));
            }
        } else if let Some(ref key_file) = config.server.admin_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read admin_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.server.admin_key = Some(Secret::new(key));
            }
        }

        if let Ok(proxy) = std::env::var("CLEARANCE_PROXY") {
            config.clearance.proxy = Some(proxy).filter(|p| !p.trim().is_empty());
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let fail = |msg: String| Err(common::Error::Config(msg));

        if self.server.max_connections == 0 {
            return fail("max_connections must be greater than 0".into());
        }

        let r = &self.rotation;
        if r.max_attempts == 0 {
            return fail("rotation.max_attempts must be greater than 0".into());
        }
        if r.cooldown_secs == 0 || r.clearance_cooldown_secs == 0 {
            return fail("rotation cool-downs must be greater than 0".into());
        }
        if r.attempt_timeout_secs == 0 || r.deadline_secs == 0 {
            return fail("rotation timeouts must be greater than 0".into());
        }
        if !(r.hybrid_threshold > 0.0 && r.hybrid_threshold <= 1.0) {
            return fail(format!(
                "rotation.hybrid_threshold must be in (0, 1], got {}",
                r.hybrid_threshold
            ));
        }
        if r.daily_limit == Some(0) {
            return fail("rotation.daily_limit must be greater than 0 when set".into());
        }
        for name in r.strategies.keys() {
            if name.parse::<ProviderKind>().is_err() {
                return fail(format!("rotation.strategies: unknown provider {name}"));
            }
        }

        if BucketClock::parse(&self.usage.utc_offset).is_err() {
            return fail(format!(
                "usage.utc_offset must look like +08:00, got: {}",
                self.usage.utc_offset
            ));
        }
        if self.usage.backend == UsageBackendKind::Sqlite && self.usage.path.is_none() {
            return fail("usage.path is required for the sqlite backend".into());
        }
        if self.usage.backend == UsageBackendKind::Redis {
            match self.usage.url.as_deref() {
                Some(url) if url.starts_with("redis://") || url.starts_with("rediss://") => {}
                Some(_) => {
                    return fail("usage.url must start with redis:// or rediss://".into());
                }
                None => return fail("usage.url is required for the redis backend".into()),
            }
            if self.usage.key_prefix.is_empty() {
                return fail("usage.key_prefix must not be empty".into());
            }
        }
        if self.usage.prune_interval_secs == 0 {
            return fail("usage.prune_interval_secs must be greater than 0".into());
        }

        if self.clearance.enabled {
            if !is_http_url(&self.clearance.solver_url) {
                return fail(format!(
                    "clearance.solver_url must start with http:// or https://, got: {}",
                    self.clearance.solver_url
                ));
            }
            if !is_http_url(&self.clearance.target_url) {
                return fail(format!(
                    "clearance.target_url must start with http:// or https://, got: {}",
                    self.clearance.target_url
                ));
            }
            if self.clearance.refresh_interval_secs == 0 || self.clearance.default_ttl_secs == 0 {
                return fail("clearance intervals must be greater than 0".into());
            }
            if self.clearance.backoff_base_secs == 0 || self.clearance.max_timeout_secs == 0 {
                return fail(
                    "clearance.backoff_base_secs and clearance.max_timeout_secs must be greater than 0"
                        .into(),
                );
            }
        }

        if self.providers.is_empty() {
            return fail("at least one [[providers]] entry is required".into());
        }
        let mut seen = HashSet::new();
        for p in &self.providers {
            if !seen.insert(p.kind) {
                return fail(format!("provider {} is configured twice", p.kind));
            }
            if !is_http_url(&p.base_url) {
                return fail(format!(
                    "base_url must start with http:// or https://, got: {}",
                    p.base_url
                ));
            }
            if p.session_cookie.trim().is_empty() {
                return fail(format!("provider {}: session_cookie must not be empty", p.kind));
            }
            if p.timeout_secs == 0 {
                return fail(format!("provider {}: timeout_secs must be greater than 0", p.kind));
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
        PathBuf::from("media-gateway.toml")
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            max_attempts: self.rotation.max_attempts,
            cooldown: Duration::from_secs(self.rotation.cooldown_secs),
            clearance_cooldown: Duration::from_secs(self.rotation.clearance_cooldown_secs),
            attempt_timeout: Duration::from_secs(self.rotation.attempt_timeout_secs),
            deadline: Duration::from_secs(self.rotation.deadline_secs),
        }
    }

    /// Selection policy for `provider`, applying any strategy override.
    pub fn selection_policy(&self, provider: Option<ProviderKind>) -> SelectionPolicy {
        let strategy = provider
            .and_then(|p| self.rotation.strategies.get(p.as_str()))
            .copied()
            .unwrap_or(self.rotation.strategy);
        SelectionPolicy {
            strategy,
            daily_limit: self.rotation.daily_limit,
            overflow: self.rotation.overflow,
            hybrid_threshold: self.rotation.hybrid_threshold,
        }
    }

    pub fn usage_backend(&self) -> UsageBackend {
        match (self.usage.backend, &self.usage.path, &self.usage.url) {
            (UsageBackendKind::Sqlite, Some(path), _) => UsageBackend::Sqlite { path: path.clone() },
            (UsageBackendKind::Redis, _, Some(url)) => UsageBackend::Redis {
                url: url.clone(),
                key_prefix: self.usage.key_prefix.clone(),
            },
            _ => UsageBackend::Memory,
        }
    }

    pub fn bucket_clock(&self) -> BucketClock {
        BucketClock::parse(&self.usage.utc_offset).unwrap_or_default()
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

    fn valid_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:8000"

[rotation]
strategy = "hybrid"
daily_limit = 50

[rotation.strategies]
gemini = "least_used"

[usage]
backend = "sqlite"
path = "/var/lib/media-gateway/usage.db"

[[providers]]
kind = "grok"
base_url = "https://grok.com"
session_cookie = "sso"
requires_clearance = true
models = ["grok-"]

[[providers.headers]]
name = "x-client"
value = "media-gateway"

[[providers]]
kind = "gemini"
base_url = "https://gemini.google.com"
session_cookie = "__Secure-C_SES"
models = ["gemini-", "imagen", "veo"]
"#
    }

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn clear_env() {
        unsafe {
            remove_env("GATEWAY_ADMIN_KEY");
            remove_env("CLEARANCE_PROXY");
            remove_env("USAGE_REDIS_URL");
        }
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 8000);
        assert_eq!(config.server.admin_addr, default_admin_addr());
        assert_eq!(config.server.max_connections, 1000);
        assert!(config.server.admin_key.is_none());
        assert_eq!(config.rotation.max_attempts, 3);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].headers.len(), 1);
        assert!(config.providers[0].requires_clearance);
        assert_eq!(config.providers[1].timeout_secs, 120);
        assert!(!config.clearance.enabled);
        assert!(matches!(config.usage_backend(), UsageBackend::Sqlite { .. }));
    }

    #[test]
    fn test_selection_policy_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write_config(dir.path(), valid_toml())).unwrap();

        let grok = config.selection_policy(Some(ProviderKind::Grok));
        assert_eq!(grok.strategy, Strategy::Hybrid);
        assert_eq!(grok.daily_limit, Some(50));
        let gemini = config.selection_policy(Some(ProviderKind::Gemini));
        assert_eq!(gemini.strategy, Strategy::LeastUsed);
        assert_eq!(config.selection_policy(None).strategy, Strategy::Hybrid);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_admin_key_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), valid_toml());

        unsafe { set_env("GATEWAY_ADMIN_KEY", "admin-secret-123") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.server.admin_key.as_ref().unwrap().expose(),
            "admin-secret-123"
        );
        clear_env();
    }

    #[test]
    fn test_admin_key_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("admin_key");
        std::fs::write(&key_path, "file-key-456\n").unwrap();
        let contents = valid_toml().replace(
            "[server]\n",
            &format!("[server]\nadmin_key_file = \"{}\"\n", key_path.display()),
        );
        let path = write_config(dir.path(), &contents);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.admin_key.as_ref().unwrap().expose(), "file-key-456");
    }

    #[test]
    fn test_admin_key_env_overrides_nonexistent_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let contents = valid_toml().replace(
            "[server]\n",
            "[server]\nadmin_key_file = \"/nonexistent/admin_key\"\n",
        );
        let path = write_config(dir.path(), &contents);

        unsafe { set_env("GATEWAY_ADMIN_KEY", "env-wins") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.admin_key.as_ref().unwrap().expose(), "env-wins");
        clear_env();

        let result = Config::load(&path);
        assert!(result.is_err(), "nonexistent admin_key_file must return an error");
    }

    #[test]
    fn test_clearance_proxy_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), valid_toml());

        unsafe { set_env("CLEARANCE_PROXY", "socks5://127.0.0.1:1080") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.clearance.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
        clear_env();
    }

    fn assert_rejected(contents: &str, needle: &str) {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), contents);
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains(needle), "expected {needle:?} in error, got: {err}");
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert_rejected(
            &valid_toml().replace("https://grok.com", "grok.com"),
            "base_url must start with http",
        );
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        assert_rejected(
            &valid_toml().replace("kind = \"gemini\"", "kind = \"grok\""),
            "configured twice",
        );
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert_rejected(
            &valid_toml().replace("daily_limit = 50", "daily_limit = 50\nmax_attempts = 0"),
            "max_attempts",
        );
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        assert_rejected(
            &valid_toml().replace("daily_limit = 50", "daily_limit = 50\nhybrid_threshold = 1.5"),
            "hybrid_threshold",
        );
    }

    #[test]
    fn test_unknown_strategy_provider_rejected() {
        assert_rejected(
            &valid_toml().replace("gemini = \"least_used\"", "openai = \"least_used\""),
            "unknown provider openai",
        );
    }

    #[test]
    fn test_sqlite_without_path_rejected() {
        assert_rejected(
            &valid_toml().replace("path = \"/var/lib/media-gateway/usage.db\"\n", ""),
            "usage.path is required",
        );
    }

    fn redis_toml(url_line: &str) -> String {
        valid_toml().replace(
            "backend = \"sqlite\"\npath = \"/var/lib/media-gateway/usage.db\"\n",
            &format!("backend = \"redis\"\n{url_line}"),
        )
    }

    #[test]
    fn test_redis_backend_selected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let toml = redis_toml("url = \"redis://cache.internal:6379/2\"\nkey_prefix = \"gw-a:\"\n");
        let config = Config::load(&write_config(dir.path(), &toml)).unwrap();
        match config.usage_backend() {
            UsageBackend::Redis { url, key_prefix } => {
                assert_eq!(url, "redis://cache.internal:6379/2");
                assert_eq!(key_prefix, "gw-a:");
            }
            other => panic!("expected redis backend, got {other:?}"),
        }
    }

    #[test]
    fn test_redis_url_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { set_env("USAGE_REDIS_URL", "rediss://:pw@cache.internal:6380/0") };
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&write_config(dir.path(), &redis_toml("")));
        clear_env();

        let config = result.unwrap();
        assert_eq!(config.usage.key_prefix, "media-gateway:");
        assert!(matches!(
            config.usage_backend(),
            UsageBackend::Redis { ref url, .. } if url == "rediss://:pw@cache.internal:6380/0"
        ));
    }

    #[test]
    fn test_redis_without_url_rejected() {
        assert_rejected(&redis_toml(""), "usage.url is required");
    }

    #[test]
    fn test_redis_bad_scheme_rejected() {
        assert_rejected(
            &redis_toml("url = \"http://cache.internal:6379\"\n"),
            "redis:// or rediss://",
        );
    }

    #[test]
    fn test_bad_offset_rejected() {
        assert_rejected(
            &valid_toml().replace("backend = \"sqlite\"", "backend = \"sqlite\"\nutc_offset = \"CST\""),
            "utc_offset",
        );
    }

    #[test]
    fn test_no_providers_rejected() {
        assert_rejected(
            "[server]\nlisten_addr = \"127.0.0.1:8000\"\n",
            "at least one [[providers]]",
        );
    }

    #[test]
    fn test_clearance_solver_url_validated_when_enabled() {
        let contents = format!(
            "{}\n[clearance]\nenabled = true\nsolver_url = \"flaresolverr:8191\"\n",
            valid_toml()
        );
        assert_rejected(&contents, "clearance.solver_url");
    }

    #[test]
    fn test_clearance_zero_backoff_rejected() {
        let contents = format!(
            "{}\n[clearance]\nenabled = true\nsolver_url = \"http://flaresolverr:8191\"\nbackoff_base_secs = 0\n",
            valid_toml()
        );
        assert_rejected(&contents, "clearance.backoff_base_secs");
    }

    #[test]
    fn test_clearance_zero_max_timeout_rejected() {
        let contents = format!(
            "{}\n[clearance]\nenabled = true\nsolver_url = \"http://flaresolverr:8191\"\nmax_timeout_secs = 0\n",
            valid_toml()
        );
        assert_rejected(&contents, "clearance.max_timeout_secs");
    }

    #[test]
    fn test_zero_clearance_cooldown_rejected() {
        assert_rejected(
            &valid_toml().replace("daily_limit = 50", "daily_limit = 50\nclearance_cooldown_secs = 0"),
            "cool-downs",
        );
    }

    #[test]
    fn test_dispatch_policy_cooldowns() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let contents = valid_toml().replace("daily_limit = 50", "daily_limit = 50\ncooldown_secs = 600");
        let config = Config::load(&write_config(dir.path(), &contents)).unwrap();

        let policy = config.dispatch_policy();
        assert_eq!(policy.cooldown, Duration::from_secs(600));
        assert_eq!(policy.clearance_cooldown, Duration::from_secs(30));
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
        assert_eq!(path, PathBuf::from("media-gateway.toml"));
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
