//! Pooling configuration

use crate::error::{PoolingError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every pooling property
pub const PROPERTY_PREFIX: &str = "pooling";

/// Default number of buckets in an assignment table
pub const DEFAULT_BUCKET_COUNT: usize = 1024;

/// Field names probed for a request id when none are configured
pub const DEFAULT_REQUEST_ID_FIELDS: &[&str] = &["requestId", "requestID", "request_id"];

/// Pooling configuration for a single controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingConfig {
    /// Whether pooling is enabled for the controller
    pub enabled: bool,

    /// Internal coordination topic (required)
    pub topic: String,

    /// Host identifier; generated when absent
    pub host: Option<String>,

    /// Number of buckets in the assignment table (must match across hosts)
    pub bucket_count: usize,

    /// Maximum events held while no assignment table is installed
    pub offline_queue_limit: usize,

    /// Maximum age of a queued event before it is discarded
    pub offline_queue_age_ms: u64,

    /// Time allowed for the Offline announcement to drain before the publisher stops
    pub offline_publish_wait_ms: u64,

    /// Time to wait for our own heartbeat while starting
    pub start_heartbeat_ms: u64,

    /// Time an inactive host waits for leader traffic before querying again
    pub reactivate_ms: u64,

    /// Window for collecting identification replies
    pub identification_ms: u64,

    /// Window in which the leader expects to observe its own traffic
    pub active_heartbeat_ms: u64,

    /// Period between leader heartbeats
    pub inter_heartbeat_ms: u64,

    /// JSON fields (dotted paths) probed for the request id of an event
    pub request_id_fields: Vec<String>,
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic: String::new(),
            host: None,
            bucket_count: DEFAULT_BUCKET_COUNT,
            offline_queue_limit: 1000,
            offline_queue_age_ms: 60_000,
            offline_publish_wait_ms: 3_000,
            start_heartbeat_ms: 100_000,
            reactivate_ms: 50_000,
            identification_ms: 50_000,
            active_heartbeat_ms: 50_000,
            inter_heartbeat_ms: 15_000,
            request_id_fields: DEFAULT_REQUEST_ID_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PoolingConfig {
    /// Create configuration builder for the given internal topic
    pub fn builder(topic: impl Into<String>) -> PoolingConfigBuilder {
        PoolingConfigBuilder::new(topic)
    }

    /// Load the configuration of `controller` from a flat property map.
    ///
    /// Each key is looked up as `pooling.<controller>.<key>` first and then as
    /// `pooling.<key>`, so controller-specific values override shared ones.
    pub fn from_properties(controller: &str, props: &HashMap<String, String>) -> Result<Self> {
        let lookup = PropertyLookup { controller, props };
        let defaults = Self::default();

        let topic = lookup
            .get("topic")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                PoolingError::MissingProperty(format!(
                    "{}.{}.topic",
                    PROPERTY_PREFIX, controller
                ))
            })?
            .to_string();

        let request_id_fields = match lookup.get("request.id.fields") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => defaults.request_id_fields.clone(),
        };

        let config = Self {
            enabled: lookup.parse("enabled")?.unwrap_or(defaults.enabled),
            topic,
            host: lookup
                .get("host")
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from),
            bucket_count: lookup
                .parse("bucket.count")?
                .unwrap_or(defaults.bucket_count),
            offline_queue_limit: lookup
                .parse("offline.queue.limit")?
                .unwrap_or(defaults.offline_queue_limit),
            offline_queue_age_ms: lookup
                .parse("offline.queue.age.milliseconds")?
                .unwrap_or(defaults.offline_queue_age_ms),
            offline_publish_wait_ms: lookup
                .parse("offline.publish.wait.milliseconds")?
                .unwrap_or(defaults.offline_publish_wait_ms),
            start_heartbeat_ms: lookup
                .parse("start.heartbeat.milliseconds")?
                .unwrap_or(defaults.start_heartbeat_ms),
            reactivate_ms: lookup
                .parse("reactivate.milliseconds")?
                .unwrap_or(defaults.reactivate_ms),
            identification_ms: lookup
                .parse("identification.milliseconds")?
                .unwrap_or(defaults.identification_ms),
            active_heartbeat_ms: lookup
                .parse("active.heartbeat.milliseconds")?
                .unwrap_or(defaults.active_heartbeat_ms),
            inter_heartbeat_ms: lookup
                .parse("inter.heartbeat.milliseconds")?
                .unwrap_or(defaults.inter_heartbeat_ms),
            request_id_fields,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(PoolingError::MissingProperty(format!(
                "{}.topic",
                PROPERTY_PREFIX
            )));
        }
        if self.bucket_count == 0 {
            return Err(PoolingError::InvalidConfig(
                "bucket count must be positive".into(),
            ));
        }
        if self.offline_queue_limit == 0 {
            return Err(PoolingError::InvalidConfig(
                "offline queue limit must be positive".into(),
            ));
        }
        if let Some(host) = &self.host {
            if host.trim().is_empty() {
                return Err(PoolingError::InvalidConfig("host id must not be blank".into()));
            }
        }

        let timers = [
            ("start heartbeat", self.start_heartbeat_ms),
            ("reactivate", self.reactivate_ms),
            ("identification", self.identification_ms),
            ("active heartbeat", self.active_heartbeat_ms),
            ("inter heartbeat", self.inter_heartbeat_ms),
        ];
        for (name, ms) in timers {
            if ms == 0 {
                return Err(PoolingError::InvalidConfig(format!(
                    "{} interval must be positive",
                    name
                )));
            }
        }

        Ok(())
    }

    pub fn offline_queue_age(&self) -> Duration {
        Duration::from_millis(self.offline_queue_age_ms)
    }

    pub fn offline_publish_wait(&self) -> Duration {
        Duration::from_millis(self.offline_publish_wait_ms)
    }

    pub fn start_heartbeat(&self) -> Duration {
        Duration::from_millis(self.start_heartbeat_ms)
    }

    pub fn reactivate(&self) -> Duration {
        Duration::from_millis(self.reactivate_ms)
    }

    pub fn identification(&self) -> Duration {
        Duration::from_millis(self.identification_ms)
    }

    pub fn active_heartbeat(&self) -> Duration {
        Duration::from_millis(self.active_heartbeat_ms)
    }

    pub fn inter_heartbeat(&self) -> Duration {
        Duration::from_millis(self.inter_heartbeat_ms)
    }
}

struct PropertyLookup<'a> {
    controller: &'a str,
    props: &'a HashMap<String, String>,
}

impl PropertyLookup<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        let specific = format!("{}.{}.{}", PROPERTY_PREFIX, self.controller, key);
        let shared = format!("{}.{}", PROPERTY_PREFIX, key);
        self.props
            .get(&specific)
            .or_else(|| self.props.get(&shared))
            .map(String::as_str)
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                PoolingError::InvalidConfig(format!(
                    "invalid value '{}' for {}.{}.{}",
                    raw, PROPERTY_PREFIX, self.controller, key
                ))
            }),
        }
    }
}

/// Builder for pooling configuration
#[derive(Debug)]
pub struct PoolingConfigBuilder {
    config: PoolingConfig,
}

impl PoolingConfigBuilder {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            config: PoolingConfig {
                enabled: true,
                topic: topic.into(),
                ..Default::default()
            },
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = Some(host.into());
        self
    }

    pub fn bucket_count(mut self, count: usize) -> Self {
        self.config.bucket_count = count;
        self
    }

    pub fn offline_queue(mut self, limit: usize, max_age: Duration) -> Self {
        self.config.offline_queue_limit = limit;
        self.config.offline_queue_age_ms = max_age.as_millis() as u64;
        self
    }

    pub fn offline_publish_wait(mut self, wait: Duration) -> Self {
        self.config.offline_publish_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn start_heartbeat(mut self, timeout: Duration) -> Self {
        self.config.start_heartbeat_ms = timeout.as_millis() as u64;
        self
    }

    pub fn reactivate(mut self, timeout: Duration) -> Self {
        self.config.reactivate_ms = timeout.as_millis() as u64;
        self
    }

    pub fn identification(mut self, window: Duration) -> Self {
        self.config.identification_ms = window.as_millis() as u64;
        self
    }

    pub fn active_heartbeat(mut self, window: Duration) -> Self {
        self.config.active_heartbeat_ms = window.as_millis() as u64;
        self
    }

    pub fn inter_heartbeat(mut self, period: Duration) -> Self {
        self.config.inter_heartbeat_ms = period.as_millis() as u64;
        self
    }

    pub fn request_id_fields(mut self, fields: Vec<impl Into<String>>) -> Self {
        self.config.request_id_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<PoolingConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
