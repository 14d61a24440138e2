pub fn config_dir() -> std::path::PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(|x| x.into())
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join(env!("CARGO_PKG_NAME"))
}

pub fn state_dir() -> std::path::PathBuf {
    match std::env::var("XDG_STATE_HOME") {
        Ok(d) => std::path::PathBuf::from(d),
        Err(_) => home_dir().join(".local").join("state"),
    }
    .join(env!("CARGO_PKG_NAME"))
}

pub fn cache_dir() -> std::path::PathBuf {
    state_dir().join("cache")
}

fn home_dir() -> std::path::PathBuf {
    // Without $HOME, fall back to a relative path rather than failing every command.
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_default()
}

pub fn salt_path() -> std::path::PathBuf {
    std::env::var("ROLECHAIN_SALT_PATH")
        .map(|x| x.into())
        .unwrap_or_else(|_| state_dir().join("salt"))
}

pub fn credential_store_dir() -> std::path::PathBuf {
    state_dir().join("credentials")
}

pub fn settings_path() -> std::path::PathBuf {
    config_dir().join("config.json")
}

pub fn chains_dir() -> std::path::PathBuf {
    config_dir().join("chains.d")
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStrategyKind {
    /// Re-run the whole chain from the first step.
    #[default]
    Full,
    /// Re-run only from the first step whose credentials are about to expire.
    ExpiringSuffix,
}

impl std::str::FromStr for RefreshStrategyKind {
    type Err = crate::Error;
    fn from_str(s: &str) -> Result<RefreshStrategyKind, crate::Error> {
        match s {
            "full" => Ok(RefreshStrategyKind::Full),
            "expiring_suffix" => Ok(RefreshStrategyKind::ExpiringSuffix),
            _ => Err(crate::Error::UserError(
                "unknown refresh_strategy".to_owned(),
            )),
        }
    }
}

/// Tuning knobs for chain execution and refresh.
#[serde_with::serde_as]
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ChainConfig {
    pub max_steps: usize,
    pub default_duration_seconds: u32,
    pub retry_attempts: u32,
    #[serde(rename = "retry_delay_ms")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub retry_delay: std::time::Duration,
    #[serde(rename = "refresh_before_expiry_secs")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub refresh_before_expiry: std::time::Duration,
    pub enable_auto_refresh: bool,
    #[serde(rename = "refresh_interval_secs")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub refresh_interval: std::time::Duration,
    pub refresh_strategy: RefreshStrategyKind,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_steps: crate::validator::DEFAULT_MAX_STEPS,
            default_duration_seconds: 3600,
            retry_attempts: 3,
            retry_delay: std::time::Duration::from_secs(1),
            refresh_before_expiry: std::time::Duration::from_secs(5 * 60),
            enable_auto_refresh: true,
            refresh_interval: std::time::Duration::from_secs(60),
            refresh_strategy: RefreshStrategyKind::Full,
        }
    }
}

impl ChainConfig {
    /// Rejects values the scheduler and orchestrator can't run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_steps == 0 {
            return Err(crate::Error::ConfigError(
                "max_steps must be at least 1".to_owned(),
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(crate::Error::ConfigError(
                "refresh_interval_secs must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ProviderSettings {
    /// Executable invoked for `sts assume-role`; `aws` when absent.
    pub program: Option<String>,
    pub region: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub chain: ChainConfig,
    pub provider: ProviderSettings,
}

impl Settings {
    /// Reads `config.json` from [`config_dir`]; a missing file yields defaults.
    pub async fn load() -> crate::Result<Self> {
        let path = settings_path();
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Self::default());
        }
        Self::read_from_file(&path).await
    }

    pub async fn read_from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let data = tokio::fs::read(&path).await?;
        let parsed: Self = serde_json::from_slice(&data).map_err(|e| {
            crate::Error::ConfigError(format!(
                "Can't parse {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        parsed.chain.validate()?;
        Ok(parsed)
    }
}

/// A named role chain stored under `chains.d/`.
#[derive(serde::Serialize, serde::Deserialize, Clone)]
pub struct ChainDefinition {
    #[serde(skip)]
    pub config_path: std::path::PathBuf,

    pub id: String,
    pub steps: Vec<crate::credentials::RoleChainStep>,
    #[serde(default)]
    pub config: Option<ChainConfig>,
}

impl std::fmt::Debug for ChainDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainDefinition")
            .field("id", &self.id)
            .field("steps", &self.steps.len())
            .field("config_path", &self.config_path)
            .finish()
    }
}

impl ChainDefinition {
    pub async fn find_from_fs(query: &str) -> crate::Result<Self> {
        Self::find_in_dir(chains_dir(), query).await
    }

    pub async fn find_in_dir(
        dir: impl AsRef<std::path::Path>,
        query: &str,
    ) -> crate::Result<Self> {
        let mut d = tokio::fs::read_dir(dir.as_ref())
            .await
            .map_err(|e| crate::Error::ConfigError(format!("Can't list chains.d: {}", e)))?;
        let mut result = None;
        while let Some(entry) = d.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match Self::read_from_file(&path).await {
                Ok(c) if c.id == query => {
                    if result.is_some() {
                        return Err(crate::Error::ConfigError(format!(
                            "chain id is duplicated: {}",
                            query
                        )));
                    }
                    result = Some(c);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = ?e,
                        "Error while enumerating chain definitions",
                    );
                }
            }
        }
        result.ok_or_else(|| {
            crate::Error::UserError(format!("No chain definition found for: {}", query))
        })
    }

    pub async fn read_from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let data = tokio::fs::read(&path).await?;
        let mut parsed: Self = serde_json::from_slice(&data)?;
        if let Some(ref config) = parsed.config {
            config.validate()?;
        }
        parsed.config_path = path.as_ref().into();
        Ok(parsed)
    }

    /// The definition's own config, falling back to `default`.
    pub fn config_or<'a>(&'a self, default: &'a ChainConfig) -> &'a ChainConfig {
        self.config.as_ref().unwrap_or(default)
    }
}
