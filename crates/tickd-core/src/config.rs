use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (tickd.toml + TICKD_* env overrides).
///
/// Loaded once at process init and never mutated; every component gets it
/// through the pipeline context rather than reading the environment itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickdConfig {
    pub signal: SignalConfig,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Signal sidecar settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Bot account in international format, e.g. "+41791234567".
    pub phone_number: String,
    /// Path to the sidecar executable (default: resolved from PATH).
    #[serde(default = "default_sidecar_path")]
    pub sidecar_path: String,
    /// Directory where the sidecar materialises downloaded attachments.
    #[serde(default = "default_attachment_dir")]
    pub attachment_dir: String,
    /// Fallback group for notifications when a run carries no group id.
    pub default_group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub name: String,
    pub user: String,
    pub password: String,
    /// Bounded pool; writers share it with readers.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Connection URL in the form sqlx expects.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// Vision model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Hard per-call deadline; past it the call counts as a transport error.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Optional template override; the embedded template is used otherwise.
    pub prompt_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_sensor_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    /// Test variant: shorter interval, no schedule gate, tagged runs.
    #[serde(default)]
    pub test_mode: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sensor_interval(),
            max_messages: default_max_messages(),
            test_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on concurrently running jobs.
    #[serde(default = "default_max_jobs")]
    pub max_concurrent_jobs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_jobs(),
        }
    }
}

fn default_sidecar_path() -> String {
    "signal-cli".to_string()
}
fn default_attachment_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.local/share/signal-cli/attachments", home)
}
fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_db_port() -> u16 {
    5432
}
fn default_db_name() -> String {
    "receipt_processing".to_string()
}
fn default_pool_size() -> u32 {
    8
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_sensor_interval() -> u64 {
    1200
}
fn default_max_messages() -> u32 {
    10
}
fn default_max_jobs() -> usize {
    4
}

impl TickdConfig {
    /// Load config from a TOML file with TICKD_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. TICKD_CONFIG env var
    ///   3. ./tickd.toml
    pub fn load(config_path: Option<&str>) -> Result<Self, figment::Error> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("TICKD_CONFIG").ok())
            .unwrap_or_else(|| "tickd.toml".to_string());

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TICKD_").split("__"))
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_fills_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "tickd.toml",
                r#"
                [signal]
                phone_number = "+41791234567"

                [database]
                user = "receipt_user"
                password = "secret"

                [llm]
                api_key = "sk-test"
                "#,
            )?;
            let cfg = TickdConfig::load(Some("tickd.toml")).expect("load");
            assert_eq!(cfg.database.port, 5432);
            assert_eq!(cfg.database.pool_size, 8);
            assert_eq!(cfg.database.connect_timeout_secs, 10);
            assert_eq!(cfg.llm.timeout_secs, 120);
            assert_eq!(cfg.sensor.interval_secs, 1200);
            assert_eq!(cfg.sensor.max_messages, 10);
            assert!(!cfg.sensor.test_mode);
            assert!(cfg.signal.default_group_id.is_none());
            Ok(())
        });
    }

    #[test]
    fn env_overrides_win() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "tickd.toml",
                r#"
                [signal]
                phone_number = "+41791234567"

                [database]
                user = "receipt_user"
                password = "secret"

                [llm]
                api_key = "sk-test"
                "#,
            )?;
            jail.set_env("TICKD_DATABASE__PORT", "5434");
            jail.set_env("TICKD_SENSOR__TEST_MODE", "true");
            let cfg = TickdConfig::load(Some("tickd.toml")).expect("load");
            assert_eq!(cfg.database.port, 5434);
            assert!(cfg.sensor.test_mode);
            Ok(())
        });
    }

    #[test]
    fn database_url_shape() {
        let db = DatabaseConfig {
            host: "db.internal".into(),
            port: 5433,
            name: "receipt_processing".into(),
            user: "receipt_user".into(),
            password: "pw".into(),
            pool_size: 8,
            connect_timeout_secs: 10,
        };
        assert_eq!(
            db.url(),
            "postgres://receipt_user:pw@db.internal:5433/receipt_processing"
        );
    }
}
