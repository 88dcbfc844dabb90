// Sharding coordinator: owns the consistent-hash ring, the shard topology
// and the table definitions, and routes record requests to the right node.

use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method, StatusCode};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};
use crate::infrastructure::hash_ring::ConsistentHashRing;
use crate::infrastructure::middleware::with_trace_header;
use crate::models::{RecordData, RecordResponse, ShardGroup, TableDefinition};

const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CoordinatorService {
    ring: RwLock<ConsistentHashRing>,
    topology: RwLock<HashMap<String, ShardGroup>>,
    tables: RwLock<HashMap<String, TableDefinition>>,
    http: reqwest::Client,
}

impl CoordinatorService {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            ring: RwLock::new(ConsistentHashRing::new()),
            topology: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            http: reqwest::Client::builder().timeout(FORWARD_TIMEOUT).build()?,
        })
    }

    /// Apply a shard self-registration. Creating a group adds it to the
    /// ring; leadership is declared, not elected, so a second leader for
    /// the same group silently replaces the first (with a warning — there
    /// is no fencing, and until the old leader re-registers as a follower
    /// both will publish to the group topic).
    pub async fn register_shard_node(&self, group_id: &str, shard_url: &str, is_leader: bool) {
        let mut topology = self.topology.write().await;
        if !topology.contains_key(group_id) {
            topology.insert(group_id.to_string(), ShardGroup::default());
            self.ring.write().await.add_group(group_id);
        }

        let group = topology
            .entry(group_id.to_string())
            .or_insert_with(ShardGroup::default);

        if is_leader {
            if let Some(old_leader) = &group.leader {
                if old_leader != shard_url {
                    warn!(
                        "Replacing leader for {}: {} -> {}",
                        group_id, old_leader, shard_url
                    );
                }
            }
            group.leader = Some(shard_url.to_string());
            group.followers.retain(|f| f != shard_url);
        } else {
            if !group.followers.iter().any(|f| f == shard_url) {
                group.followers.push(shard_url.to_string());
            }
            if group.leader.as_deref() == Some(shard_url) {
                group.leader = None;
            }
        }

        info!(
            "Registered node {} for group {} (Leader: {})",
            shard_url, group_id, is_leader
        );
    }

    pub async fn topology_status(&self) -> Value {
        let topology = self.topology.read().await;
        let tables = self.tables.read().await;
        json!({
            "shards_count": topology.len(),
            "tables_count": tables.len(),
            "topology": &*topology,
            "tables": tables.keys().collect::<Vec<_>>(),
        })
    }

    pub async fn register_table(&self, table: TableDefinition) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        if tables.contains_key(&table.table_name) {
            return Err(AppError::Conflict("Table already exists".to_string()));
        }
        info!(
            "Registered table '{}' with primary key '{}'",
            table.table_name, table.primary_key
        );
        tables.insert(table.table_name.clone(), table);
        Ok(())
    }

    pub async fn get_all_tables(&self) -> Vec<TableDefinition> {
        self.tables.read().await.values().cloned().collect()
    }

    pub async fn delete_table(&self, table_name: &str) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        if tables.remove(table_name).is_none() {
            return Err(AppError::NotFound(format!(
                "Table '{}' not found",
                table_name
            )));
        }
        info!("Deleted table definition for '{}'", table_name);
        Ok(())
    }

    /// `POST /records`: extract the primary key named by the table
    /// definition from the record body and forward the create to the
    /// group leader as `POST /records/{table}/{pk}`.
    pub async fn create_record(&self, table_name: &str, value: Value) -> AppResult<RecordResponse> {
        let table = self
            .tables
            .read()
            .await
            .get(table_name)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("Table '{}' is not registered", table_name))
            })?;

        let primary_key = extract_primary_key(&value, &table.primary_key)?;
        let shard_url = self.target_node(table_name, &primary_key, true).await?;

        let url = record_url(&shard_url, table_name, &primary_key);
        info!("Forwarding WRITE (Create) to Leader: {}", url);

        let request = with_trace_header(self.http.post(&url)).json(&RecordData {
            value: value.clone(),
        });
        let response = request
            .send()
            .await
            .map_err(|err| connection_error(&shard_url, &err))?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| AppError::Internal(format!("Invalid shard response: {}", err)))?;

        Ok(RecordResponse {
            table_name: table_name.to_string(),
            primary_key,
            value: body.get("value").cloned().unwrap_or(Value::Null),
        })
    }

    /// Forward a record request as-is: writes go to the group leader,
    /// reads to a uniformly random group member. HEAD and DELETE carry no
    /// response body; everything else is rewrapped as a `RecordResponse`.
    pub async fn forward_record_request(
        &self,
        table_name: &str,
        primary_key: &str,
        method: Method,
        mut headers: HeaderMap,
        query: Option<String>,
        body: Bytes,
    ) -> AppResult<(StatusCode, Option<RecordResponse>)> {
        let is_write = method == Method::POST
            || method == Method::DELETE
            || method == Method::PUT
            || method == Method::PATCH;
        let shard_url = self.target_node(table_name, primary_key, is_write).await?;

        let mut url = record_url(&shard_url, table_name, primary_key);
        if let Some(query) = query {
            url.push('?');
            url.push_str(&query);
        }
        info!(
            "Forwarding {} to {}: {}",
            method,
            if is_write { "Leader" } else { "Replica" },
            url
        );

        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        let mut request = self.http.request(method.clone(), &url).headers(headers);
        request = with_trace_header(request);
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| connection_error(&shard_url, &err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(upstream_error(response).await);
        }

        if method == Method::HEAD || method == Method::DELETE {
            return Ok((status, None));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|err| AppError::Internal(format!("Invalid shard response: {}", err)))?;

        Ok((
            status,
            Some(RecordResponse {
                table_name: table_name.to_string(),
                primary_key: primary_key.to_string(),
                value: data.get("value").cloned().unwrap_or(Value::Null),
            }),
        ))
    }

    /// Resolve `"{table}::{pk}"` through the ring and pick the node that
    /// should serve the request.
    async fn target_node(
        &self,
        table_name: &str,
        primary_key: &str,
        write_op: bool,
    ) -> AppResult<String> {
        let key = format!("{}::{}", table_name, primary_key);
        let group_id = self.ring.read().await.lookup(&key).ok_or_else(|| {
            error!("Hashing ring has no active shard groups");
            AppError::ServiceUnavailable("No available shard groups".to_string())
        })?;

        let group = self
            .topology
            .read()
            .await
            .get(&group_id)
            .cloned()
            .ok_or_else(|| {
                AppError::ServiceUnavailable(format!(
                    "Topology info missing for group {}",
                    group_id
                ))
            })?;

        if write_op {
            group.leader.ok_or_else(|| {
                AppError::ServiceUnavailable(format!("No leader available for group {}", group_id))
            })
        } else {
            let mut candidates = Vec::new();
            if let Some(leader) = group.leader {
                candidates.push(leader);
            }
            candidates.extend(group.followers);

            if candidates.is_empty() {
                return Err(AppError::ServiceUnavailable(format!(
                    "No active nodes for group {}",
                    group_id
                )));
            }

            let index = rand::rng().random_range(0..candidates.len());
            Ok(candidates.swap_remove(index))
        }
    }
}

fn record_url(shard_url: &str, table_name: &str, primary_key: &str) -> String {
    format!(
        "{}/records/{}/{}",
        shard_url.trim_end_matches('/'),
        table_name,
        primary_key
    )
}

fn extract_primary_key(value: &Value, primary_key_field: &str) -> AppResult<String> {
    let missing = || {
        AppError::Validation(format!("Primary key '{}' is missing", primary_key_field))
    };
    match value.get(primary_key_field) {
        None | Some(Value::Null) => Err(missing()),
        Some(Value::String(s)) if s.is_empty() => Err(missing()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
    }
}

fn connection_error(shard_url: &str, err: &reqwest::Error) -> AppError {
    error!("Cannot connect to shard '{}': {}", shard_url, err);
    AppError::ServiceUnavailable(format!("Shard '{}' is unavailable.", shard_url))
}

async fn upstream_error(response: reqwest::Response) -> AppError {
    let status = response.status();
    let target = response.url().to_string();
    let detail = match response.text().await {
        Ok(text) => serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| {
                body.get("detail")
                    .or_else(|| body.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .unwrap_or(if text.is_empty() {
                format!("Shard returned status {}", status)
            } else {
                text
            }),
        Err(_) => format!("Shard returned status {}", status),
    };
    error!("Error from shard '{}': {} - {}", target, status, detail);
    AppError::Upstream { status, detail }
}
