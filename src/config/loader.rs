use super::schema::{Config, NetworkConfig};
use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};

impl Config {
    /// Read, override and validate `path`. `${VAR}` references stay in place
    /// until a network is selected with [`Config::network`].
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_path = path.to_path_buf();

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("invalid anchorage config")
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("ANCHORAGE_JOURNAL_DIR")
            && !dir.is_empty()
        {
            self.journal.dir = PathBuf::from(dir);
        }

        if let Some(raw) = lookup("ANCHORAGE_MAX_CONCURRENCY")
            && let Ok(limit) = raw.parse::<usize>()
        {
            self.execution.max_concurrency = limit;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.execution.max_concurrency == 0 {
            bail!("execution.max_concurrency must be at least 1");
        }
        if self.execution.future_timeout_ms == 0 || self.execution.batch_timeout_ms == 0 {
            bail!("execution timeouts must be positive");
        }
        for (name, network) in &self.networks {
            if network.url.trim().is_empty() {
                bail!("networks.{name}.url must not be empty");
            }
            if network.accounts.is_empty() {
                bail!("networks.{name}.accounts must list at least one signing account");
            }
        }
        Ok(())
    }

    /// Settings of network `name`, with `$VAR` / `${VAR}` in its URL and
    /// credentials taken from the environment. Only the selected network's
    /// variables have to be set.
    pub fn network(&self, name: &str) -> Result<NetworkConfig> {
        self.network_with(name, |var| std::env::var(var).ok())
    }

    /// [`Config::network`] with an explicit variable lookup. A reference to
    /// an unset variable is an error.
    pub fn network_with<F>(&self, name: &str, lookup: F) -> Result<NetworkConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = self.networks.get(name).with_context(|| {
            let known: Vec<&str> = self.networks.keys().map(String::as_str).collect();
            format!("unknown network {name} (configured: [{}])", known.join(", "))
        })?;

        let expand = |value: &str| -> Result<String> {
            shellexpand::env_with_context(value, |var| {
                lookup(var).map(Some).ok_or_else(|| "not set".to_string())
            })
            .map(std::borrow::Cow::into_owned)
            .map_err(|error| anyhow::anyhow!("{error}"))
        };

        let mut network = raw.clone();
        network.url = expand(&raw.url).with_context(|| format!("networks.{name}.url"))?;
        for (index, account) in network.accounts.iter_mut().enumerate() {
            *account = expand(account).with_context(|| format!("networks.{name}.accounts[{index}]"))?;
        }
        if network.url.trim().is_empty() {
            bail!("networks.{name}.url is empty after expansion");
        }
        Ok(network)
    }

    /// Journal directory, with `~` expanded and relative paths anchored at
    /// the config file's directory.
    pub fn journal_dir(&self) -> PathBuf {
        let raw = self.journal.dir.to_string_lossy();
        let expanded = PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref());
        if expanded.is_absolute() {
            return expanded;
        }
        self.config_path
            .parent()
            .map_or_else(|| expanded.clone(), |base| base.join(&expanded))
    }
}
