//! Record transformation: batch stages and the ordered chain that runs them.

mod retry;
mod stages;

pub use retry::RetryTransform;
pub use stages::{DropFields, Filter, Rename, SetField, Uppercase};

use crate::config::{RetryConfig, TransformConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::record::{Record, RecordPool};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A transformation stage over one batch of records.
///
/// Stages may drop, rewrite or add records. They may be called concurrently
/// from several workers on disjoint batches, so any internal state must be
/// synchronized.
#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        cancel: &CancellationToken,
        records: Vec<Record>,
    ) -> PipelineResult<Vec<Record>>;
}

/// Ordered list of stages applied in sequence.
#[derive(Clone, Default)]
pub struct TransformChain {
    stages: Vec<Arc<dyn Transform>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage, builder style.
    pub fn with_stage(mut self, stage: impl Transform + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn push(&mut self, stage: Arc<dyn Transform>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order. Stops early once a stage leaves no records.
    pub async fn apply(
        &self,
        cancel: &CancellationToken,
        mut records: Vec<Record>,
    ) -> PipelineResult<Vec<Record>> {
        for stage in &self.stages {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if records.is_empty() {
                break;
            }
            let start = Instant::now();
            let input = records.len();
            records = stage.process(cancel, records).await?;
            tracing::trace!(
                "Stage {} {} -> {} records in {:?}",
                stage.name(),
                input,
                records.len(),
                start.elapsed()
            );
        }
        Ok(records)
    }
}

impl std::fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformChain")
            .field("stages", &self.names())
            .finish()
    }
}

/// Stage backed by an async closure.
pub struct FnTransform<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnTransform<F>
where
    F: Fn(CancellationToken, Vec<Record>) -> Fut + Send + Sync,
    Fut: Future<Output = PipelineResult<Vec<Record>>> + Send,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> Transform for FnTransform<F>
where
    F: Fn(CancellationToken, Vec<Record>) -> Fut + Send + Sync,
    Fut: Future<Output = PipelineResult<Vec<Record>>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        records: Vec<Record>,
    ) -> PipelineResult<Vec<Record>> {
        (self.func)(cancel.clone(), records).await
    }
}

/// Build the chain described by `configs`. Every stage is wrapped in a
/// [`RetryTransform`] when `retry.enabled` is set. Filters return rejected
/// records to `pool`.
pub fn from_config(
    configs: &[TransformConfig],
    retry: &RetryConfig,
    pool: &Arc<RecordPool>,
) -> TransformChain {
    let mut chain = TransformChain::new();
    for config in configs {
        let stage: Arc<dyn Transform> = match config {
            TransformConfig::Filter { field, equals } => {
                Arc::new(Filter::new(field.clone(), equals.clone()).with_pool(pool.clone()))
            }
            TransformConfig::Rename { from, to } => Arc::new(Rename::new(from.clone(), to.clone())),
            TransformConfig::Drop { fields } => Arc::new(DropFields::new(fields.clone())),
            TransformConfig::Set { field, value } => {
                Arc::new(SetField::new(field.clone(), value.clone()))
            }
            TransformConfig::Uppercase { fields } => Arc::new(Uppercase::new(fields.clone())),
        };
        if retry.enabled {
            chain.push(Arc::new(RetryTransform::new(stage, retry)));
        } else {
            chain.push(stage);
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::record_from;
    use serde_json::json;

    fn people() -> Vec<Record> {
        vec![
            record_from([("name", json!("ada")), ("team", json!("core"))]),
            record_from([("name", json!("bob")), ("team", json!("web"))]),
            record_from([("name", json!("cyd")), ("team", json!("core"))]),
        ]
    }

    #[tokio::test]
    async fn test_chain_applies_in_order() {
        let chain = TransformChain::new()
            .with_stage(Filter::new("team", Some(json!("core"))))
            .with_stage(Rename::new("name", "member"))
            .with_stage(Uppercase::new(vec!["member".to_string()]));

        let out = chain.apply(&CancellationToken::new(), people()).await.unwrap();
        let members: Vec<&str> = out.iter().map(|r| r["member"].as_str().unwrap()).collect();
        assert_eq!(members, vec!["ADA", "CYD"]);
        assert_eq!(chain.names(), vec!["filter", "rename", "uppercase"]);
    }

    #[tokio::test]
    async fn test_empty_chain_is_identity() {
        let out = TransformChain::new()
            .apply(&CancellationToken::new(), people())
            .await
            .unwrap();
        assert_eq!(out, people());
    }

    #[tokio::test]
    async fn test_chain_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let chain = TransformChain::new().with_stage(Rename::new("a", "b"));
        let err = chain.apply(&cancel, people()).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_fn_transform() {
        let stage = FnTransform::new("tag", |_cancel, mut records: Vec<Record>| async move {
            for r in &mut records {
                r.insert("tagged".to_string(), json!(true));
            }
            Ok(records)
        });
        let chain = TransformChain::new().with_stage(stage);
        let out = chain.apply(&CancellationToken::new(), people()).await.unwrap();
        assert!(out.iter().all(|r| r["tagged"] == json!(true)));
    }

    #[tokio::test]
    async fn test_from_config_wraps_retry() {
        let configs = vec![
            TransformConfig::Drop {
                fields: vec!["team".to_string()],
            },
            TransformConfig::Set {
                field: "source".to_string(),
                value: json!("hr"),
            },
        ];
        let retry = RetryConfig {
            enabled: true,
            ..RetryConfig::default()
        };
        let chain = from_config(&configs, &retry, &Arc::new(RecordPool::default()));
        assert_eq!(chain.names(), vec!["drop", "set"]);

        let out = chain.apply(&CancellationToken::new(), people()).await.unwrap();
        assert!(out.iter().all(|r| !r.contains_key("team")));
        assert!(out.iter().all(|r| r["source"] == json!("hr")));
    }
}
