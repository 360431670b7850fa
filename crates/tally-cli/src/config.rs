//! Configuration loading and management.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use tally_core::{EngineConfig, PresenceConfig, RuleSet};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the event store database.
    pub store_path: PathBuf,

    /// Path to the interval ledger file.
    pub ledger_path: PathBuf,

    /// A source with no events for this long is reported as stale.
    pub stale_after_secs: u64,

    /// Reduction engine settings.
    pub engine: EngineConfig,

    /// Presence conflict resolution settings.
    pub presence: PresenceConfig,

    /// Tag expansion rules.
    pub rules: RuleSet,

    /// Window event tagging.
    pub resolver: ResolverConfig,
}

/// Maps window events to tags by application name.
///
/// An application mapped to an empty list is deliberately untracked;
/// applications absent from the map are unmatched and fall back to the
/// engine's no-match handling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    /// Tags to assign per application name.
    pub apps: BTreeMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            store_path: data_dir.join("events.db"),
            ledger_path: data_dir.join("ledger.json"),
            stale_after_secs: 300,
            engine: EngineConfig::default(),
            presence: PresenceConfig::default(),
            rules: RuleSet::default(),
            resolver: ResolverConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from default locations.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(None)
    }

    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (TALLY_*)
        figment = figment.merge(Env::prefixed("TALLY_"));

        figment.extract()
    }
}

/// Returns the platform-specific config directory for tally.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tally"))
}

/// Returns the platform-specific data directory for tally.
///
/// On Linux: `~/.local/share/tally`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("tally"))
}
