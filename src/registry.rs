//! Instance registry and scaling reconciler
//!
//! Tracks each application's target instance count. The store holds the
//! authoritative value; the cache fronts it with a bounded TTL. Every write
//! goes through [`InstanceRegistry::set_count`], which applies the
//! application's scaling policy.

use crate::cache::{instances_key, Cache};
use crate::config::MetricsSource;
use crate::db::{Database, ScalingPolicy};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Utilization figures reported with an application's metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utilization {
    /// CPU usage, e.g. `"42.3%"`
    pub cpu: String,
    /// Memory usage, e.g. `"61.0%"`
    pub memory: String,
    pub requests_per_min: u32,
}

impl Utilization {
    pub fn new(cpu: f64, memory: f64, requests_per_min: u32) -> Self {
        Self {
            cpu: format!("{:.1}%", cpu),
            memory: format!("{:.1}%", memory),
            requests_per_min,
        }
    }

    pub fn idle() -> Self {
        Self::new(0.0, 0.0, 0)
    }
}

/// Monitoring collaborator
#[async_trait]
pub trait UtilizationSource: Send + Sync {
    async fn utilization(&self, app_id: i64, instances: i32) -> Utilization;
}

/// Random figures for platforms without a monitoring backend
#[derive(Debug, Default)]
pub struct SimulatedUtilization;

#[async_trait]
impl UtilizationSource for SimulatedUtilization {
    async fn utilization(&self, _app_id: i64, instances: i32) -> Utilization {
        let mut rng = rand::thread_rng();
        let per_instance: u32 = rng.gen_range(50..500);
        Utilization::new(
            rng.gen_range(5.0..80.0),
            rng.gen_range(20.0..90.0),
            per_instance.saturating_mul(instances.max(0) as u32),
        )
    }
}

/// Always reports the same figures
#[derive(Debug, Clone)]
pub struct FixedUtilization(pub Utilization);

#[async_trait]
impl UtilizationSource for FixedUtilization {
    async fn utilization(&self, _app_id: i64, _instances: i32) -> Utilization {
        self.0.clone()
    }
}

/// Build the configured utilization source
pub fn utilization_source(source: &MetricsSource) -> Arc<dyn UtilizationSource> {
    match source {
        MetricsSource::Simulated => Arc::new(SimulatedUtilization),
        MetricsSource::Disabled => Arc::new(FixedUtilization(Utilization::idle())),
    }
}

/// Count, policy and utilization of one application
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub instances: i32,
    pub policy: ScalingPolicy,
    pub metrics: Utilization,
}

pub struct InstanceRegistry {
    db: Arc<Database>,
    cache: Arc<dyn Cache>,
    utilization: Arc<dyn UtilizationSource>,
    ttl: Duration,
}

impl InstanceRegistry {
    pub fn new(
        db: Arc<Database>,
        cache: Arc<dyn Cache>,
        utilization: Arc<dyn UtilizationSource>,
        ttl: Duration,
    ) -> Self {
        Self {
            db,
            cache,
            utilization,
            ttl,
        }
    }

    /// Target instance count (cache-aside, default 1)
    pub async fn get_count(&self, app_id: i64) -> Result<i32> {
        let key = instances_key(app_id);
        if let Some(cached) = self.cache.get(&key).await {
            match cached.parse::<i32>() {
                Ok(count) => return Ok(count),
                Err(_) => debug!(app_id, value = %cached, "Ignoring unparsable cached count"),
            }
        }

        let count = self.db.get_instances(app_id)?.unwrap_or(1);
        self.cache.set_ex(&key, &count.to_string(), self.ttl).await;
        Ok(count)
    }

    /// Store `requested` clamped into the scaling policy; returns the stored value
    pub async fn set_count(&self, app_id: i64, requested: i32) -> Result<i32> {
        let policy = self.policy(app_id)?;
        let clamped = policy.clamp(requested);

        self.db.set_instances(app_id, clamped)?;
        self.cache
            .set_ex(&instances_key(app_id), &clamped.to_string(), self.ttl)
            .await;

        if clamped != requested {
            info!(app_id, requested, clamped, min = policy.min, max = policy.max, "Instance count clamped");
        } else {
            debug!(app_id, instances = clamped, "Instance count set");
        }
        Ok(clamped)
    }

    pub async fn scale_up(&self, app_id: i64, delta: u32) -> Result<i32> {
        let current = self.get_count(app_id).await?;
        let delta = i32::try_from(delta).unwrap_or(i32::MAX);
        self.set_count(app_id, current.saturating_add(delta)).await
    }

    /// Like `scale_up` in reverse, but never below 1
    pub async fn scale_down(&self, app_id: i64, delta: u32) -> Result<i32> {
        let current = self.get_count(app_id).await?;
        let delta = i32::try_from(delta).unwrap_or(i32::MAX);
        self.set_count(app_id, current.saturating_sub(delta).max(1))
            .await
    }

    pub async fn metrics(&self, app_id: i64) -> Result<MetricsSnapshot> {
        let instances = self.get_count(app_id).await?;
        let policy = self.policy(app_id)?;
        let metrics = self.utilization.utilization(app_id, instances).await;
        Ok(MetricsSnapshot {
            instances,
            policy,
            metrics,
        })
    }

    fn policy(&self, app_id: i64) -> Result<ScalingPolicy> {
        Ok(self.db.get_scaling_policy(app_id)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::NewApp;

    fn registry_with(policy: Option<ScalingPolicy>) -> (InstanceRegistry, Arc<Database>, Arc<MemoryCache>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.create_app(&NewApp {
            id: Some(42),
            name: "web".to_string(),
            scaling_policy: policy,
            ..Default::default()
        })
        .unwrap();
        let cache = Arc::new(MemoryCache::new());
        let registry = InstanceRegistry::new(
            db.clone(),
            cache.clone(),
            Arc::new(FixedUtilization(Utilization::new(12.5, 40.0, 300))),
            Duration::from_secs(3600),
        );
        (registry, db, cache)
    }

    #[tokio::test]
    async fn test_get_count_defaults_and_populates_cache() {
        let (registry, _db, cache) = registry_with(None);
        assert_eq!(registry.get_count(42).await.unwrap(), 1);
        assert_eq!(cache.get("app:42:instances").await.as_deref(), Some("1"));

        // Unknown app also reads as 1
        assert_eq!(registry.get_count(999).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_count_prefers_cache() {
        let (registry, db, cache) = registry_with(None);
        db.set_instances(42, 4).unwrap();
        cache
            .set_ex("app:42:instances", "7", Duration::from_secs(60))
            .await;
        assert_eq!(registry.get_count(42).await.unwrap(), 7);

        cache.del("app:42:instances").await;
        assert_eq!(registry.get_count(42).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_set_count_clamps_to_policy() {
        let (registry, db, _cache) = registry_with(Some(ScalingPolicy { min: 2, max: 6 }));

        assert_eq!(registry.set_count(42, 1).await.unwrap(), 2);
        assert_eq!(registry.set_count(42, 20).await.unwrap(), 6);
        assert_eq!(registry.set_count(42, 4).await.unwrap(), 4);
        assert_eq!(db.get_instances(42).unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_set_count_default_policy() {
        let (registry, _db, _cache) = registry_with(None);
        assert_eq!(registry.set_count(42, 0).await.unwrap(), 1);
        assert_eq!(registry.set_count(42, 15).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_scale_up_and_down() {
        let (registry, _db, _cache) = registry_with(None);
        registry.set_count(42, 3).await.unwrap();

        assert_eq!(registry.scale_up(42, 1).await.unwrap(), 4);
        assert_eq!(registry.scale_up(42, 100).await.unwrap(), 10);
        assert_eq!(registry.scale_down(42, 3).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_scale_down_floors_at_one() {
        let (registry, _db, _cache) = registry_with(Some(ScalingPolicy { min: 0, max: 5 }));
        registry.set_count(42, 2).await.unwrap();

        assert_eq!(registry.scale_down(42, 5).await.unwrap(), 1);
        assert_eq!(registry.scale_down(42, 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let (registry, _db, _cache) = registry_with(None);
        registry.set_count(42, 3).await.unwrap();

        let snapshot = registry.metrics(42).await.unwrap();
        assert_eq!(snapshot.instances, 3);
        assert_eq!(snapshot.policy, ScalingPolicy { min: 1, max: 10 });
        assert_eq!(snapshot.metrics.cpu, "12.5%");

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["policy"]["max"], 10);
        assert_eq!(json["metrics"]["requests_per_min"], 300);
    }

    #[tokio::test]
    async fn test_simulated_utilization_is_well_formed() {
        let figures = SimulatedUtilization.utilization(1, 2).await;
        assert!(figures.cpu.ends_with('%'));
        assert!(figures.memory.ends_with('%'));
        assert!(figures.requests_per_min >= 100);
    }

    #[tokio::test]
    async fn test_disabled_source_reports_idle() {
        let source = utilization_source(&MetricsSource::Disabled);
        assert_eq!(source.utilization(1, 3).await, Utilization::idle());
    }
}
