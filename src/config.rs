use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .with_context(|| format!("missing required environment variable {}", name))
}

fn server_host() -> String {
    env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn server_port(default: u16) -> u16 {
    env::var("SERVER_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
}

impl CoordinatorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: server_host(),
            port: server_port(8000),
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub coordinator_url: String,
    pub advertised_url: String,
    pub group_id: String,
    pub is_leader: bool,
    pub kafka_broker_url: String,
    pub kafka_topic: String,
    pub host: String,
    pub port: u16,
}

impl ShardConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            coordinator_url: required("COORDINATOR_URL")?,
            advertised_url: required("ADVERTISED_URL")?,
            group_id: required("SHARD_GROUP_ID")?,
            is_leader: env::var("IS_LEADER")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
            kafka_broker_url: required("KAFKA_BROKER_URL")?,
            kafka_topic: required("KAFKA_TOPIC")?,
            host: server_host(),
            port: server_port(8001),
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionsConfig {
    pub kafka_broker_url: String,
    /// When unset, tag validation against the tags service is skipped.
    pub tags_service_url: Option<String>,
    pub host: String,
    pub port: u16,
}

impl CollectionsConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            kafka_broker_url: required("KAFKA_BROKER_URL")?,
            tags_service_url: env::var("TAGS_SERVICE_URL").ok().filter(|v| !v.is_empty()),
            host: server_host(),
            port: server_port(8002),
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub kafka_broker_url: String,
    pub host: String,
    pub port: u16,
}

impl FilterConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            kafka_broker_url: required("KAFKA_BROKER_URL")?,
            host: server_host(),
            port: server_port(8003),
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_rejects_missing_and_empty() {
        env::remove_var("MESHKV_TEST_MISSING");
        assert!(required("MESHKV_TEST_MISSING").is_err());

        env::set_var("MESHKV_TEST_EMPTY", "");
        assert!(required("MESHKV_TEST_EMPTY").is_err());

        env::set_var("MESHKV_TEST_SET", "value");
        assert_eq!(required("MESHKV_TEST_SET").unwrap(), "value");
    }
}
