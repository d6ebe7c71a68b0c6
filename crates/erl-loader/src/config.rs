//! Configuration for the queue loader
//!
//! All knobs arrive through three layers with a fixed precedence:
//! command line over environment variables over an optional YAML config
//! file. The layers are merged exactly once at startup into an
//! immutable [`ConsumerConfig`] that is passed by reference everywhere;
//! core logic never reads ambient configuration state.

use clap::Parser;
use erl_common::{LoaderError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default number of concurrent processing workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default broker prefetch limit (client-held unacknowledged deliveries).
pub const DEFAULT_PREFETCH_COUNT: u16 = 16;

/// Default SQS visibility timeout in seconds.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: i32 = 60;

/// Default ceiling on delivery attempts when requeueing on engine errors.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Config file searched under the home directory when --config is not given.
pub const HOME_CONFIG_PATH: &str = ".erl/config.yaml";

/// System-wide config file searched last.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/erl/config.yaml";

/// What to do with a delivery when the engine call itself fails.
///
/// `Ack` consumes and drops the message (at-most-once, the historical
/// behavior); `Requeue` rejects it back to the broker until the
/// delivery-attempt ceiling is reached, after which it is dropped.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum EngineErrorPolicy {
    /// Acknowledge and drop the message, logging the failure
    #[default]
    Ack,
    /// Reject for broker redelivery, up to the delivery-attempt ceiling
    Requeue,
}

/// Command-line interface for the loader.
///
/// Every flag can also be supplied through its `ERL_*` environment
/// variable; command-line values win over the environment, and both win
/// over the config file.
#[derive(Parser, Debug, Default)]
#[command(name = "erl-loader")]
#[command(author, version, about = "Load entity-resolution records from a message queue")]
pub struct Cli {
    /// Input queue URL (amqp://, sqs://, or an https:// SQS queue URL)
    #[arg(short = 'i', long, env = "ERL_INPUT_URL")]
    pub input_url: Option<String>,

    /// Exchange to bind the queue to (AMQP transports only)
    #[arg(long, env = "ERL_EXCHANGE")]
    pub exchange: Option<String>,

    /// Queue to consume from (AMQP transports only)
    #[arg(long, env = "ERL_QUEUE_NAME")]
    pub queue_name: Option<String>,

    /// Number of concurrent processing workers (minimum 1)
    #[arg(long, env = "ERL_WORKER_COUNT")]
    pub worker_count: Option<usize>,

    /// Maximum unacknowledged deliveries held by the process
    #[arg(long, env = "ERL_PREFETCH_COUNT")]
    pub prefetch_count: Option<u16>,

    /// SQS visibility timeout in seconds
    #[arg(long, env = "ERL_VISIBILITY_TIMEOUT")]
    pub visibility_timeout_secs: Option<i32>,

    /// Base URL of the resolution engine HTTP endpoint
    #[arg(long, env = "ERL_ENGINE_URL")]
    pub engine_url: Option<String>,

    /// Engine configuration as a JSON blob
    #[arg(long, env = "ERL_ENGINE_CONFIG_JSON")]
    pub engine_config_json: Option<String>,

    /// Request the enriched "with info" response for each record
    #[arg(long, env = "ERL_WITH_INFO")]
    pub with_info: bool,

    /// Seconds to sleep at startup while dependent services come up
    #[arg(long, env = "ERL_DELAY_SECONDS")]
    pub delay_seconds: Option<u64>,

    /// Policy for deliveries whose engine call fails
    #[arg(long, env = "ERL_ON_ENGINE_ERROR", value_enum)]
    pub on_engine_error: Option<EngineErrorPolicy>,

    /// Delivery-attempt ceiling for the requeue policy
    #[arg(long, env = "ERL_MAX_DELIVERY_ATTEMPTS")]
    pub max_delivery_attempts: Option<u32>,

    /// Validate and count records without calling the engine
    #[arg(long)]
    pub dry_run: bool,

    /// Path to a YAML config file (default: ~/.erl/config.yaml, /etc/erl/config.yaml)
    #[arg(long, env = "ERL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ERL_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Optional values read from the YAML config file; the lowest-precedence
/// configuration layer.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    input_url: Option<String>,
    exchange: Option<String>,
    queue_name: Option<String>,
    worker_count: Option<usize>,
    prefetch_count: Option<u16>,
    visibility_timeout_secs: Option<i32>,
    engine_url: Option<String>,
    engine_config_json: Option<String>,
    with_info: Option<bool>,
    delay_seconds: Option<u64>,
    on_engine_error: Option<EngineErrorPolicy>,
    max_delivery_attempts: Option<u32>,
}

impl FileConfig {
    /// Load the file at `path`, failing loudly on unreadable or invalid YAML
    fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LoaderError::config(format!("cannot read config file '{}': {e}", path.display()))
        })?;
        serde_yaml::from_str(&contents).map_err(|e| {
            LoaderError::config(format!("invalid config file '{}': {e}", path.display()))
        })
    }

    /// Find and load the first config file on the search path, if any.
    ///
    /// An explicitly given path must exist; the default search locations
    /// are optional.
    fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let mut candidates = Vec::new();
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(HOME_CONFIG_PATH));
        }
        candidates.push(PathBuf::from(SYSTEM_CONFIG_PATH));

        for candidate in candidates {
            if candidate.is_file() {
                tracing::debug!(path = %candidate.display(), "loading config file");
                return Self::load(&candidate);
            }
        }
        Ok(Self::default())
    }
}

/// Immutable configuration for one consumption session.
///
/// Built once by [`ConsumerConfig::resolve`] and passed by reference
/// into the input selector and worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Input queue URL; the scheme selects the transport
    pub input_url: String,

    /// Exchange to bind to (required for AMQP)
    pub exchange: Option<String>,

    /// Queue to consume from (required for AMQP)
    pub queue_name: Option<String>,

    /// Number of concurrent processing workers, always >= 1
    pub worker_count: usize,

    /// Client-side outstanding-delivery limit, set before subscribing
    pub prefetch_count: u16,

    /// SQS visibility timeout in seconds
    pub visibility_timeout_secs: i32,

    /// Resolution engine base URL, if an engine is configured
    pub engine_url: Option<String>,

    /// Engine configuration JSON blob, passed through to the gateway
    pub engine_config_json: Option<String>,

    /// Request the enriched "with info" engine response
    pub with_info: bool,

    /// Startup delay in seconds
    pub delay_seconds: u64,

    /// Policy for deliveries whose engine call fails
    pub on_engine_error: EngineErrorPolicy,

    /// Delivery-attempt ceiling for the requeue policy
    pub max_delivery_attempts: u32,

    /// Skip the engine entirely; validate, count, and acknowledge
    pub dry_run: bool,

    /// Identifier stamped on every record loaded by this process
    pub load_id: String,
}

impl ConsumerConfig {
    /// Merge the CLI/environment layer over the config-file layer and
    /// apply defaults, producing the final immutable configuration.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let file = FileConfig::discover(cli.config.as_deref())?;
        Self::merge(cli, file)
    }

    fn merge(cli: &Cli, file: FileConfig) -> Result<Self> {
        let input_url = cli
            .input_url
            .clone()
            .or(file.input_url)
            .ok_or_else(|| LoaderError::config("an input URL is required (--input-url)"))?;

        Ok(ConsumerConfig {
            input_url,
            exchange: cli.exchange.clone().or(file.exchange),
            queue_name: cli.queue_name.clone().or(file.queue_name),
            worker_count: cli
                .worker_count
                .or(file.worker_count)
                .unwrap_or(DEFAULT_WORKER_COUNT)
                .max(1),
            // 0 would starve every worker (and means "unlimited" to an
            // AMQP broker's basic_qos), so the floor is 1 either way
            prefetch_count: cli
                .prefetch_count
                .or(file.prefetch_count)
                .unwrap_or(DEFAULT_PREFETCH_COUNT)
                .max(1),
            visibility_timeout_secs: cli
                .visibility_timeout_secs
                .or(file.visibility_timeout_secs)
                .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            engine_url: cli.engine_url.clone().or(file.engine_url),
            engine_config_json: cli.engine_config_json.clone().or(file.engine_config_json),
            with_info: cli.with_info || file.with_info.unwrap_or(false),
            delay_seconds: cli.delay_seconds.or(file.delay_seconds).unwrap_or(0),
            on_engine_error: cli
                .on_engine_error
                .or(file.on_engine_error)
                .unwrap_or_default(),
            max_delivery_attempts: cli
                .max_delivery_attempts
                .or(file.max_delivery_attempts)
                .unwrap_or(DEFAULT_MAX_DELIVERY_ATTEMPTS)
                .max(1),
            dry_run: cli.dry_run,
            load_id: Uuid::new_v4().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli_with_url(url: &str) -> Cli {
        Cli {
            input_url: Some(url.to_string()),
            ..Cli::default()
        }
    }

    /// Merge with an empty file layer. Tests that exercise the defaults
    /// go through here so they never pick up a real config file from
    /// the developer's home directory or /etc.
    fn merge_no_file(cli: &Cli) -> Result<ConsumerConfig> {
        ConsumerConfig::merge(cli, FileConfig::default())
    }

    #[test]
    fn test_defaults_applied() {
        let config = merge_no_file(&cli_with_url("amqp://localhost")).unwrap();
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(config.prefetch_count, DEFAULT_PREFETCH_COUNT);
        assert_eq!(config.on_engine_error, EngineErrorPolicy::Ack);
        assert!(!config.with_info);
        assert!(!config.load_id.is_empty());
    }

    #[test]
    fn test_input_url_required() {
        let err = merge_no_file(&Cli::default()).unwrap_err();
        assert!(err.to_string().contains("input URL"));
    }

    #[test]
    fn test_worker_count_minimum_one() {
        let cli = Cli {
            worker_count: Some(0),
            ..cli_with_url("amqp://localhost")
        };
        let config = merge_no_file(&cli).unwrap();
        assert_eq!(config.worker_count, 1);
    }

    #[test]
    fn test_prefetch_count_minimum_one() {
        let cli = Cli {
            prefetch_count: Some(0),
            ..cli_with_url("amqp://localhost")
        };
        let config = merge_no_file(&cli).unwrap();
        assert_eq!(config.prefetch_count, 1);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "input_url: amqp://file-host\nworker_count: 2\nprefetch_count: 3\nqueue_name: from-file"
        )
        .unwrap();

        let cli = Cli {
            input_url: Some("amqp://cli-host".to_string()),
            worker_count: Some(8),
            config: Some(file.path().to_path_buf()),
            ..Cli::default()
        };
        let config = ConsumerConfig::resolve(&cli).unwrap();
        assert_eq!(config.input_url, "amqp://cli-host");
        assert_eq!(config.worker_count, 8);
        // values only the file provides still land
        assert_eq!(config.prefetch_count, 3);
        assert_eq!(config.queue_name.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_missing_explicit_config_file_is_an_error() {
        let cli = Cli {
            input_url: Some("amqp://localhost".to_string()),
            config: Some(PathBuf::from("/nonexistent/erl.yaml")),
            ..Cli::default()
        };
        assert!(ConsumerConfig::resolve(&cli).is_err());
    }

    #[test]
    fn test_engine_error_policy_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "on_engine_error: requeue").unwrap();
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..cli_with_url("sqs://lookup?queue-name=q")
        };
        let config = ConsumerConfig::resolve(&cli).unwrap();
        assert_eq!(config.on_engine_error, EngineErrorPolicy::Requeue);
    }
}
