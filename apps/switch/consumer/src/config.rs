use core_config::{
    ConfigError, Environment, FromEnv, env_flag, env_optional, env_or_default, env_parse,
};
use relay_worker::{FailurePolicy, PipelineConfig};
use std::net::SocketAddr;
use std::time::Duration;

/// Consumer settings read from the environment.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub environment: Environment,
    pub redis_url: String,
    pub stream_name: String,
    pub consumer_group: String,
    /// Unique per process; defaults to `consumer-<uuid>`
    pub consumer_name: String,
    /// Block time of one XREADGROUP call
    pub block: Duration,
    pub batch_size: usize,
    /// gRPC address of the liquidity service; `None` disables the check
    pub liquidity_url: Option<String>,
    /// Readiness URL of the liquidity service; derived from the gRPC
    /// address when unset
    pub liquidity_health_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Path to the network config JSON
    pub network_config: String,
    pub fail_closed: bool,
    pub dependency_timeout: Duration,
}

impl FromEnv for ConsumerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            environment: Environment::from_env(),
            redis_url: env_or_default("REDIS_URL", "redis://127.0.0.1:6379"),
            stream_name: env_or_default("STREAM_NAME", "switch:transactions"),
            consumer_group: env_or_default("CONSUMER_GROUP", "switch-consumers"),
            consumer_name: env_optional("CONSUMER_NAME")
                .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::new_v4())),
            block: Duration::from_millis(env_parse("STREAM_BLOCK_MS", 1000u64)?),
            batch_size: env_parse("STREAM_BATCH_SIZE", 100usize)?,
            liquidity_url: env_optional("LIQUIDITY_URL"),
            liquidity_health_url: env_optional("LIQUIDITY_HEALTH_URL"),
            host: env_or_default("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8080u16)?,
            workers: env_parse("WORKERS", 5usize)?,
            queue_capacity: env_parse("QUEUE_CAPACITY", 1000usize)?,
            network_config: env_or_default("NETWORK_CONFIG", "config/network.json"),
            fail_closed: env_flag("FAIL_CLOSED", false)?,
            dependency_timeout: Duration::from_millis(env_parse("DEPENDENCY_TIMEOUT_MS", 100u64)?),
        };
        config.validate()?;
        Ok(config)
    }
}

impl ConsumerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("WORKERS must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("QUEUE_CAPACITY must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("STREAM_BATCH_SIZE must be at least 1".into()));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::ParseError {
                key: "HOST".to_string(),
                details: e.to_string(),
            })
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig::default()
            .with_workers(self.workers)
            .with_queue_capacity(self.queue_capacity)
            .with_dependency_timeout(self.dependency_timeout)
            .with_failure_policy(FailurePolicy::from_fail_closed(self.fail_closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 16] = [
        "APP_ENV",
        "REDIS_URL",
        "STREAM_NAME",
        "CONSUMER_GROUP",
        "CONSUMER_NAME",
        "LIQUIDITY_URL",
        "LIQUIDITY_HEALTH_URL",
        "HOST",
        "PORT",
        "WORKERS",
        "QUEUE_CAPACITY",
        "NETWORK_CONFIG",
        "FAIL_CLOSED",
        "DEPENDENCY_TIMEOUT_MS",
        "STREAM_BLOCK_MS",
        "STREAM_BATCH_SIZE",
    ];

    fn with_env<F: FnOnce()>(set: &[(&str, &str)], f: F) {
        let mut vars: Vec<(&str, Option<&str>)> = VARS.iter().map(|k| (*k, None)).collect();
        for &(key, value) in set {
            vars.retain(|(k, _)| *k != key);
            vars.push((key, Some(value)));
        }
        temp_env::with_vars(vars, f);
    }

    #[test]
    fn test_defaults() {
        with_env(&[], || {
            let config = ConsumerConfig::from_env().unwrap();
            assert_eq!(config.stream_name, "switch:transactions");
            assert_eq!(config.workers, 5);
            assert_eq!(config.queue_capacity, 1000);
            assert_eq!(config.dependency_timeout, Duration::from_millis(100));
            assert!(config.liquidity_url.is_none());
            assert!(config.liquidity_health_url.is_none());
            assert_eq!(config.batch_size, 100);
            assert_eq!(config.block, Duration::from_millis(1000));
            assert!(!config.fail_closed);
            assert!(config.consumer_name.starts_with("consumer-"));
            assert_eq!(config.socket_addr().unwrap().port(), 8080);
        });
    }

    #[test]
    fn test_overrides_flow_into_pipeline() {
        with_env(
            &[
                ("WORKERS", "8"),
                ("QUEUE_CAPACITY", "50"),
                ("FAIL_CLOSED", "true"),
                ("DEPENDENCY_TIMEOUT_MS", "250"),
                ("LIQUIDITY_URL", "liquidity-service:50051"),
                ("STREAM_BATCH_SIZE", "10"),
            ],
            || {
                let config = ConsumerConfig::from_env().unwrap();
                assert_eq!(config.liquidity_url.as_deref(), Some("liquidity-service:50051"));
                assert_eq!(config.batch_size, 10);

                let pipeline = config.pipeline();
                assert_eq!(pipeline.workers, 8);
                assert_eq!(pipeline.queue_capacity, 50);
                assert_eq!(pipeline.dependency_timeout, Duration::from_millis(250));
                assert_eq!(pipeline.failure_policy, FailurePolicy::FailClosed);
            },
        );
    }

    #[test]
    fn test_zero_workers_rejected() {
        with_env(&[("WORKERS", "0")], || {
            let err = ConsumerConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)));
        });
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        with_env(&[("STREAM_BATCH_SIZE", "0")], || {
            let err = ConsumerConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("STREAM_BATCH_SIZE")));
        });
    }

    #[test]
    fn test_bad_port_rejected() {
        with_env(&[("PORT", "eighty")], || {
            let err = ConsumerConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "PORT"));
        });
    }
}
