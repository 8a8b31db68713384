use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs;

use crate::reconcile::DEFAULT_FRESHNESS_WINDOW_SECS;
use crate::report::RESERVED_REPORT_KEYS;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

/// One upstream feed from `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub platform: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub fn parse(yaml: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(yaml).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        registry
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(registry)
    }

    /// Platforms are summary keys, so they may not shadow the fixed ones.
    fn validate(&self) -> Result<()> {
        for source in &self.sources {
            let key = source.platform.to_lowercase();
            if RESERVED_REPORT_KEYS.contains(&key.as_str()) {
                bail!("platform `{}` clashes with a run summary field", source.platform);
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub data_file: PathBuf,
    pub collection: String,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub freshness_window_secs: i64,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            data_file: lookup("OPCAT_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/opportunities.json")),
            collection: lookup("OPCAT_COLLECTION").unwrap_or_else(|| "opportunities".to_string()),
            scheduler_enabled: lookup("OPCAT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: lookup("SYNC_CRON_1").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_cron_2: lookup("SYNC_CRON_2").unwrap_or_else(|| "0 0 18 * * *".to_string()),
            user_agent: lookup("OPCAT_USER_AGENT").unwrap_or_else(|| "opcat-bot/0.1".to_string()),
            http_timeout_secs: lookup("OPCAT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            freshness_window_secs: lookup("OPCAT_FRESHNESS_WINDOW_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_FRESHNESS_WINDOW_SECS),
            workspace_root: lookup("OPCAT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    /// Fixture paths in `sources.yaml` are relative to the workspace root.
    pub fn resolve_fixture(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_unset() {
        let config = SyncConfig::from_lookup(|_| None);
        assert!(config.database_url.is_none());
        assert_eq!(config.data_file, PathBuf::from("./data/opportunities.json"));
        assert_eq!(config.collection, "opportunities");
        assert!(!config.scheduler_enabled);
        assert_eq!(config.sync_cron_1, "0 0 6 * * *");
        assert_eq!(config.freshness_window_secs, 3600);
        assert_eq!(config.http_timeout_secs, 20);
    }

    #[test]
    fn overrides_are_read_and_bad_numbers_ignored() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://opcat@localhost/opcat"),
            ("OPCAT_SCHEDULER_ENABLED", "1"),
            ("OPCAT_FRESHNESS_WINDOW_SECS", "60"),
            ("OPCAT_HTTP_TIMEOUT_SECS", "soon"),
            ("OPCAT_WORKSPACE_ROOT", "/srv/opcat"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.database_url.as_deref(), Some("postgres://opcat@localhost/opcat"));
        assert!(config.scheduler_enabled);
        assert_eq!(config.freshness_window_secs, 60);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.sources_path(), PathBuf::from("/srv/opcat/sources.yaml"));
        assert_eq!(
            config.resolve_fixture(Path::new("fixtures/mlh.json")),
            PathBuf::from("/srv/opcat/fixtures/mlh.json")
        );
    }

    #[test]
    fn registry_defaults_sources_to_enabled() {
        let registry = SourceRegistry::parse(
            r#"
sources:
  - platform: MLH
    display_name: Major League Hacking
    feed_url: https://example.org/mlh.json
  - platform: Devpost
    display_name: Devpost
    enabled: false
"#,
        )
        .unwrap();
        let enabled: Vec<_> = registry.enabled().map(|s| s.platform.as_str()).collect();
        assert_eq!(enabled, vec!["MLH"]);
        assert!(registry.sources[1].fixture_path.is_none());
    }

    #[test]
    fn platforms_named_like_summary_fields_are_rejected() {
        for platform in ["Success", "duration", "RUN_ID"] {
            let yaml = format!("sources:\n  - platform: {platform}\n    display_name: Clash\n");
            let err = SourceRegistry::parse(&yaml).unwrap_err();
            assert!(err.to_string().contains("clashes"), "{platform}: {err}");
        }
        assert!(SourceRegistry::parse("sources:\n  - platform: Successful\n    display_name: Fine\n").is_ok());
    }
}
