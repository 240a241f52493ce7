//! Stage partitioning strategies.
//!
//! A partitioner slices a stage's declared workload (carried in
//! `Stage::config`) into content-addressed shards. Partitioning is
//! deterministic for a fixed stage definition: the same plan partitioned
//! after a restart reproduces the same cas_ids, which is what makes
//! dedup and resume work.
//!
//! Strategies differ only in how they slice; none of them touches I/O.

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::plan::Stage;
use crate::shard::ShardSpec;

/// Available partitioning strategies, resolved at stage parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionerKind {
    /// Bin files into shards by cumulative size.
    ByFilesize,
    /// One shard per module.
    ByModule,
    /// One shard per DAG depth level.
    ByDagDepth,
    /// Group routes by their leading path segment.
    ByRouteMap,
    /// Group assets by their declared bucket.
    ByAssetBucket,
    /// Chunk SQL statements into fixed-size batches.
    BySqlBatch,
}

impl PartitionerKind {
    /// Returns the strategy implementation for this kind.
    #[must_use]
    pub fn resolve(self) -> &'static dyn Partitioner {
        match self {
            Self::ByFilesize => &ByFilesize,
            Self::ByModule => &ByModule,
            Self::ByDagDepth => &ByDagDepth,
            Self::ByRouteMap => &ByRouteMap,
            Self::ByAssetBucket => &ByAssetBucket,
            Self::BySqlBatch => &BySqlBatch,
        }
    }

    /// Returns the wire name of this strategy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ByFilesize => "by_filesize",
            Self::ByModule => "by_module",
            Self::ByDagDepth => "by_dag_depth",
            Self::ByRouteMap => "by_route_map",
            Self::ByAssetBucket => "by_asset_bucket",
            Self::BySqlBatch => "by_sql_batch",
        }
    }
}

impl std::str::FromStr for PartitionerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "by_filesize" => Ok(Self::ByFilesize),
            "by_module" => Ok(Self::ByModule),
            "by_dag_depth" => Ok(Self::ByDagDepth),
            "by_route_map" => Ok(Self::ByRouteMap),
            "by_asset_bucket" => Ok(Self::ByAssetBucket),
            "by_sql_batch" => Ok(Self::BySqlBatch),
            other => Err(Error::UnknownStrategy {
                registry: "partitioner",
                name: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for PartitionerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slices a stage's workload into shards.
pub trait Partitioner: Send + Sync {
    /// Partitions the stage into shard specs, all in `Pending` phase.
    ///
    /// # Errors
    ///
    /// Returns `PlanValidation` if the stage config is missing or malformed
    /// for this strategy.
    fn partition(&self, stage: &Stage) -> Result<Vec<ShardSpec>>;
}

fn config_array<'a>(stage: &'a Stage, key: &str) -> Result<&'a Vec<Value>> {
    stage
        .config
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::PlanValidation {
            message: format!(
                "stage {} ({}) requires config array '{key}'",
                stage.id, stage.partitioner
            ),
        })
}

fn shard(stage: &Stage, inputs: Value) -> Result<ShardSpec> {
    ShardSpec::new(stage.id.clone(), stage.executor, inputs, Vec::new())
}

/// Bins files into shards whose cumulative size stays under
/// `config.targetBytes` (default 64 MiB). Files are taken in declared
/// order; a single oversized file gets its own shard.
struct ByFilesize;

impl Partitioner for ByFilesize {
    fn partition(&self, stage: &Stage) -> Result<Vec<ShardSpec>> {
        const DEFAULT_TARGET_BYTES: u64 = 64 * 1024 * 1024;

        let files = config_array(stage, "files")?;
        let target = stage
            .config
            .get("targetBytes")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TARGET_BYTES);

        let mut shards = Vec::new();
        let mut bin: Vec<Value> = Vec::new();
        let mut bin_bytes: u64 = 0;

        for file in files {
            let size = file.get("size").and_then(Value::as_u64).unwrap_or(0);
            if !bin.is_empty() && bin_bytes + size > target {
                shards.push(shard(stage, json!({"files": bin, "bytes": bin_bytes}))?);
                bin = Vec::new();
                bin_bytes = 0;
            }
            bin.push(file.clone());
            bin_bytes += size;
        }
        if !bin.is_empty() {
            shards.push(shard(stage, json!({"files": bin, "bytes": bin_bytes}))?);
        }
        Ok(shards)
    }
}

/// One shard per entry in `config.modules`.
struct ByModule;

impl Partitioner for ByModule {
    fn partition(&self, stage: &Stage) -> Result<Vec<ShardSpec>> {
        let modules = config_array(stage, "modules")?;
        modules
            .iter()
            .map(|m| shard(stage, json!({"module": m})))
            .collect()
    }
}

/// One shard per DAG depth level in `config.levels` (an array of arrays
/// of node names, shallowest first).
struct ByDagDepth;

impl Partitioner for ByDagDepth {
    fn partition(&self, stage: &Stage) -> Result<Vec<ShardSpec>> {
        let levels = config_array(stage, "levels")?;
        levels
            .iter()
            .enumerate()
            .map(|(depth, nodes)| shard(stage, json!({"depth": depth, "nodes": nodes})))
            .collect()
    }
}

/// Groups `config.routes` (path strings) by their first path segment.
/// Group order follows sorted segment names for determinism.
struct ByRouteMap;

impl Partitioner for ByRouteMap {
    fn partition(&self, stage: &Stage) -> Result<Vec<ShardSpec>> {
        let routes = config_array(stage, "routes")?;

        let mut groups: std::collections::BTreeMap<String, Vec<Value>> =
            std::collections::BTreeMap::new();
        for route in routes {
            let path = route.as_str().ok_or_else(|| Error::PlanValidation {
                message: format!("stage {}: routes must be strings", stage.id),
            })?;
            let segment = path
                .trim_start_matches('/')
                .split('/')
                .next()
                .unwrap_or("")
                .to_string();
            groups.entry(segment).or_default().push(route.clone());
        }

        groups
            .into_iter()
            .map(|(prefix, routes)| shard(stage, json!({"prefix": prefix, "routes": routes})))
            .collect()
    }
}

/// Groups `config.assets` (objects with a `bucket` field) by bucket.
/// Group order follows sorted bucket names for determinism.
struct ByAssetBucket;

impl Partitioner for ByAssetBucket {
    fn partition(&self, stage: &Stage) -> Result<Vec<ShardSpec>> {
        let assets = config_array(stage, "assets")?;

        let mut groups: std::collections::BTreeMap<String, Vec<Value>> =
            std::collections::BTreeMap::new();
        for asset in assets {
            let bucket = asset
                .get("bucket")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string();
            groups.entry(bucket).or_default().push(asset.clone());
        }

        groups
            .into_iter()
            .map(|(bucket, assets)| shard(stage, json!({"bucket": bucket, "assets": assets})))
            .collect()
    }
}

/// Chunks `config.statements` into batches of `config.batchSize`
/// (default 50), preserving statement order.
struct BySqlBatch;

impl Partitioner for BySqlBatch {
    fn partition(&self, stage: &Stage) -> Result<Vec<ShardSpec>> {
        const DEFAULT_BATCH_SIZE: usize = 50;

        let statements = config_array(stage, "statements")?;
        let batch_size = stage
            .config
            .get("batchSize")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE);

        statements
            .chunks(batch_size)
            .enumerate()
            .map(|(batch, stmts)| shard(stage, json!({"batch": batch, "statements": stmts})))
            .collect()
    }
}
