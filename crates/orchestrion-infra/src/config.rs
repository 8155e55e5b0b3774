//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.orchestrion/` by
//! default) into [`EngineConfig`]. A missing or malformed file yields the
//! defaults, so a node always starts.

use std::path::Path;

use orchestrion_types::config::EngineConfig;

pub const CONFIG_FILE: &str = "config.toml";

/// Load `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: a warning, then the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => {
            tracing::debug!(path = %config_path.display(), node_id = %config.engine.node_id, "config loaded");
            config
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrion_types::config::BackoffKind;
    use orchestrion_types::job::job_types;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.jobs.worker_pool_size, 8);
        assert_eq!(config.compaction.page_size, 100);
        assert!(!config.compaction.enabled);
    }

    #[tokio::test]
    async fn valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
[engine]
node_id = "node-a"
activity_max_attempts = 5

[jobs]
worker_pool_size = 2

[jobs.policies.compaction]
max_attempts = 4
backoff = "fixed"
base_delay_ms = 250

[external_tasks]
max_tasks_per_fetch = 25

[compaction]
enabled = true
cron = "every 10 minutes"
retention_secs = 86400
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.node_id, "node-a");
        assert_eq!(config.engine.activity_max_attempts, 5);
        assert_eq!(config.jobs.worker_pool_size, 2);
        assert_eq!(config.jobs.poll_interval_ms, 500);
        assert_eq!(config.external_tasks.max_tasks_per_fetch, 25);
        assert!(config.compaction.enabled);
        assert_eq!(config.compaction.retention_secs, 86_400);

        let policy = config.jobs.policy_for(job_types::COMPACTION);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff, BackoffKind::Fixed);
        assert_eq!(policy.base_delay_ms, 250);
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.jobs.lease_secs, 30);
        assert!(config.jobs.policies.is_empty());
    }
}
