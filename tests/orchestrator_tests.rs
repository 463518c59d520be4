//! Integration tests for the deploy / stop / scale / proxy workflows
//!
//! Runs the orchestrator against the in-process runtime and a recording proxy
//! control, with the store and proxy config directory on disk.

use flotilla::cache::MemoryCache;
use flotilla::config::Config;
use flotilla::db::{AppStatus, Database, NewApp, ScalingPolicy};
use flotilla::orchestrator::{DeployRequest, Orchestrator, WarningKind};
use flotilla::proxy::RecordingProxyControl;
use flotilla::runtime::MemoryRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    tmp: TempDir,
    config: Config,
    db: Arc<Database>,
    runtime: Arc<MemoryRuntime>,
    control: Arc<RecordingProxyControl>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.proxy.config_dir = tmp.path().join("nginx");
        config.store.path = tmp.path().join("flotilla.db");

        let db = Arc::new(Database::open(&config.store.path).unwrap());
        let runtime = Arc::new(MemoryRuntime::new());
        let control = Arc::new(RecordingProxyControl::new(true));
        let orchestrator = Orchestrator::assemble(
            &config,
            runtime.clone(),
            control.clone(),
            db.clone(),
            Arc::new(MemoryCache::new()),
        )
        .unwrap();

        Self {
            tmp,
            config,
            db,
            runtime,
            control,
            orchestrator,
        }
    }

    /// A second control plane over the same runtime and store, with an empty cache
    fn restarted(&self) -> Orchestrator {
        Orchestrator::assemble(
            &self.config,
            self.runtime.clone(),
            self.control.clone(),
            self.db.clone(),
            Arc::new(MemoryCache::new()),
        )
        .unwrap()
    }

    fn create_app(&self, id: i64, name: &str, policy: Option<ScalingPolicy>) {
        self.db
            .create_app(&NewApp {
                id: Some(id),
                name: name.to_string(),
                image: None,
                scaling_policy: policy,
            })
            .unwrap();
    }

    fn route_path(&self, app_id: i64) -> PathBuf {
        self.tmp.path().join("nginx").join(format!("app-{}.conf", app_id))
    }

    fn route(&self, app_id: i64) -> Option<String> {
        std::fs::read_to_string(self.route_path(app_id)).ok()
    }

    fn default_route_exists(&self) -> bool {
        self.tmp.path().join("nginx").join("00-default.conf").exists()
    }
}

fn deploy_request(instances: u32) -> DeployRequest {
    DeployRequest {
        instances: Some(instances),
        ..Default::default()
    }
}

// ============================================================================
// End-to-end
// ============================================================================

mod end_to_end_tests {
    use super::*;

    #[tokio::test]
    async fn test_deploy_metrics_stop_cycle() {
        let h = Harness::new();
        h.create_app(42, "shop", None);

        let deployed = h.orchestrator.deploy(42, deploy_request(3)).await.unwrap();
        assert_eq!(deployed.instances, 3);
        assert_eq!(deployed.status, AppStatus::Running);
        assert_eq!(
            deployed.containers.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec![
                "flotilla-app-42-instance-0",
                "flotilla-app-42-instance-1",
                "flotilla-app-42-instance-2",
            ]
        );
        assert!(deployed.containers.iter().all(|c| c.is_running()));

        // Deploy and listing report the same records
        let listed = h.orchestrator.list_containers(42).await.unwrap();
        assert_eq!(listed.containers, deployed.containers);
        assert!(deployed.warnings.is_empty());

        let json = serde_json::to_value(&deployed).unwrap();
        assert_eq!(json["status"], "running");
        assert!(json.get("warnings").is_none());

        let route = h.route(42).expect("route written");
        assert!(route.contains("server_name shop.flotilla.local;"));
        assert!(route.contains("least_conn;"));
        assert!(h.default_route_exists());

        let metrics = h.orchestrator.metrics(42).await.unwrap();
        assert_eq!(metrics.instances, 3);
        assert_eq!(metrics.policy, ScalingPolicy { min: 1, max: 10 });

        let stopped = h.orchestrator.stop(42).await.unwrap();
        assert_eq!(stopped.status, AppStatus::Stopped);
        assert_eq!(stopped.stopped, 3);
        assert!(h.route(42).is_none());
        assert!(h.default_route_exists());
        assert!(h.runtime.container_names().is_empty());
        assert_eq!(h.control.reload_count(), 2);

        let app = h.db.get_app(42).unwrap().unwrap();
        assert_eq!(app.status, AppStatus::Stopped);
    }

    #[tokio::test]
    async fn test_deploy_records_status_and_timestamp() {
        let h = Harness::new();
        h.create_app(7, "api", None);

        h.orchestrator.deploy(7, deploy_request(2)).await.unwrap();

        let app = h.db.get_app(7).unwrap().unwrap();
        assert_eq!(app.status, AppStatus::Running);
        assert_eq!(app.instances, 2);
        assert!(app.last_deployed.is_some());
    }

    #[tokio::test]
    async fn test_fresh_deploy_route_matches_count() {
        for n in 1..=10u32 {
            let h = Harness::new();
            h.create_app(1, "web", None);

            let deployed = h.orchestrator.deploy(1, deploy_request(n)).await.unwrap();
            assert_eq!(deployed.instances, n);

            let route = h.route(1).unwrap();
            if n == 1 {
                assert!(!route.contains("upstream"));
                assert!(route.contains("flotilla-app-1-instance-0:8080"));
            } else {
                assert!(route.contains("upstream app-1 {"));
                assert_eq!(route.matches(" resolve;").count(), n as usize);
            }
        }
    }

    #[tokio::test]
    async fn test_deploy_logs_each_instance() {
        let h = Harness::new();
        h.create_app(3, "web", None);
        h.runtime.fail_spawns_at([0]);

        h.orchestrator.deploy(3, deploy_request(3)).await.unwrap();

        let logs = h.orchestrator.logs(3, 10).unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs[0].message.starts_with("Failed to deploy instance 0"));
        assert!(logs[1].message.starts_with("Instance 2/3 deployed"));
        assert!(logs[2].message.starts_with("Instance 3/3 deployed"));
        assert_eq!(logs[2].instance_id.as_deref(), Some("app-3-instance-1"));
    }
}

// ============================================================================
// Redeploy and discovery
// ============================================================================

mod redeploy_tests {
    use super::*;

    #[tokio::test]
    async fn test_redeploy_replaces_previous_generation() {
        let h = Harness::new();
        h.create_app(42, "shop", None);

        h.orchestrator.deploy(42, deploy_request(3)).await.unwrap();
        let spawns_before = h.runtime.spawned_specs().len();

        let redeployed = h.orchestrator.deploy(42, deploy_request(2)).await.unwrap();
        assert_eq!(redeployed.instances, 2);
        assert_eq!(h.runtime.container_names().len(), 2);

        // Every old instance was removed before the first new spawn
        let events = h.runtime.events();
        let first_new_spawn = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.starts_with("spawn:"))
            .nth(spawns_before)
            .map(|(i, _)| i)
            .unwrap();
        let removes_before: Vec<_> = events[..first_new_spawn]
            .iter()
            .filter(|e| e.starts_with("remove:"))
            .collect();
        assert_eq!(removes_before.len(), 3);

        let route = h.route(42).unwrap();
        assert!(!route.contains("instance-2"));
    }

    #[tokio::test]
    async fn test_restarted_control_plane_sees_same_instances() {
        let h = Harness::new();
        h.create_app(42, "shop", None);
        h.orchestrator.deploy(42, deploy_request(3)).await.unwrap();

        let before = h.orchestrator.list_containers(42).await.unwrap();
        let restarted = h.restarted();
        let after = restarted.list_containers(42).await.unwrap();

        assert_eq!(before.count, 3);
        assert_eq!(
            before.containers.iter().map(|c| &c.name).collect::<Vec<_>>(),
            after.containers.iter().map(|c| &c.name).collect::<Vec<_>>()
        );

        let regenerated = restarted.regenerate_proxy(42).await.unwrap();
        assert_eq!(regenerated.instances, 3);
        assert_eq!(regenerated.ports, vec![8080, 8080, 8080]);
        assert_eq!(regenerated.app_url, "http://shop.flotilla.local");
    }

    #[tokio::test]
    async fn test_restarted_control_plane_stops_everything() {
        let h = Harness::new();
        h.create_app(42, "shop", None);
        h.orchestrator.deploy(42, deploy_request(2)).await.unwrap();

        let stopped = h.restarted().stop(42).await.unwrap();
        assert_eq!(stopped.stopped, 2);
        assert!(h.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_redeploy_after_restart_does_not_collide() {
        let h = Harness::new();
        h.create_app(42, "shop", None);
        h.orchestrator.deploy(42, deploy_request(2)).await.unwrap();

        let redeployed = h.restarted().deploy(42, deploy_request(2)).await.unwrap();
        assert_eq!(redeployed.instances, 2);
        assert!(redeployed.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_regenerate_skips_exited_instances() {
        let h = Harness::new();
        h.create_app(42, "shop", None);
        h.orchestrator.deploy(42, deploy_request(3)).await.unwrap();
        h.runtime.mark_exited("flotilla-app-42-instance-1");

        let regenerated = h.orchestrator.regenerate_proxy(42).await.unwrap();
        assert_eq!(regenerated.instances, 2);
        assert!(!h.route(42).unwrap().contains("instance-1"));

        let containers = h.orchestrator.list_containers(42).await.unwrap();
        assert_eq!(containers.count, 3);
    }
}

// ============================================================================
// Partial failures
// ============================================================================

mod partial_failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_partial_deploy_reports_achieved_count() {
        let h = Harness::new();
        h.create_app(5, "web", None);
        h.runtime.fail_spawns_at([1, 3]);

        let deployed = h.orchestrator.deploy(5, deploy_request(5)).await.unwrap();

        assert_eq!(deployed.instances, 3);
        assert_eq!(deployed.status, AppStatus::Running);
        let spawn_warnings: Vec<_> = deployed
            .warnings
            .iter()
            .filter(|w| w.kind == WarningKind::InstanceSpawnFailed)
            .collect();
        assert_eq!(spawn_warnings.len(), 2);
        assert!(spawn_warnings.iter().all(|w| w.instance.is_some()));

        assert_eq!(h.db.get_instances(5).unwrap(), Some(3));
        assert_eq!(h.route(5).unwrap().matches(" resolve;").count(), 3);
    }

    #[tokio::test]
    async fn test_all_spawns_failing_leaves_app_stopped() {
        let h = Harness::new();
        h.create_app(5, "web", None);
        h.runtime.fail_spawns_at([0, 1]);

        let deployed = h.orchestrator.deploy(5, deploy_request(2)).await.unwrap();

        assert_eq!(deployed.instances, 0);
        assert_eq!(deployed.status, AppStatus::Stopped);
        assert!(deployed.containers.is_empty());
        assert!(h.route(5).is_none());
        assert!(h.runtime.container_names().is_empty());
        assert!(!h.orchestrator.proxy_status(5).unwrap().config_generated);
    }

    #[tokio::test]
    async fn test_zero_target_left_by_failed_deploy_still_redeploys() {
        let h = Harness::new();
        h.create_app(5, "web", Some(ScalingPolicy { min: 0, max: 5 }));
        h.runtime.fail_spawns_at([0, 1]);

        let deployed = h.orchestrator.deploy(5, deploy_request(2)).await.unwrap();
        assert_eq!(deployed.instances, 0);
        assert_eq!(h.db.get_instances(5).unwrap(), Some(0));

        let redeployed = h
            .orchestrator
            .deploy(5, DeployRequest::default())
            .await
            .unwrap();
        assert_eq!(redeployed.instances, 1);
        assert_eq!(redeployed.status, AppStatus::Running);
        assert!(h.route(5).is_some());
    }

    #[tokio::test]
    async fn test_previous_route_removed_when_redeploy_yields_nothing() {
        let h = Harness::new();
        h.create_app(5, "web", None);
        h.orchestrator.deploy(5, deploy_request(2)).await.unwrap();
        assert!(h.route(5).is_some());

        h.runtime.fail_spawns_at([2, 3]);
        let deployed = h.orchestrator.deploy(5, deploy_request(2)).await.unwrap();
        assert_eq!(deployed.instances, 0);
        assert!(h.route(5).is_none());
    }

    #[tokio::test]
    async fn test_stop_failure_is_a_warning() {
        let h = Harness::new();
        h.create_app(5, "web", None);
        h.orchestrator.deploy(5, deploy_request(2)).await.unwrap();
        h.runtime.fail_stop_of("flotilla-app-5-instance-0");

        let stopped = h.orchestrator.stop(5).await.unwrap();
        assert_eq!(stopped.status, AppStatus::Stopped);
        assert_eq!(stopped.stopped, 1);
        assert_eq!(stopped.warnings.len(), 1);
        assert_eq!(stopped.warnings[0].kind, WarningKind::InstanceStopFailed);
        assert!(h.route(5).is_none());
    }

    #[tokio::test]
    async fn test_proxy_not_running_does_not_fail_deploy() {
        let h = Harness::new();
        h.create_app(5, "web", None);
        h.control.set_running(false);

        let deployed = h.orchestrator.deploy(5, deploy_request(1)).await.unwrap();
        assert_eq!(deployed.instances, 1);
        assert!(deployed
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::ProxyNotRunning));
        assert!(h.route(5).is_some());
        assert_eq!(h.control.reload_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_proxy_config_is_not_reloaded() {
        let h = Harness::new();
        h.create_app(5, "web", None);
        h.control.fail_validation("nginx: [emerg] host not found");

        let deployed = h.orchestrator.deploy(5, deploy_request(2)).await.unwrap();
        assert_eq!(deployed.instances, 2);
        assert!(deployed
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::ProxyValidationFailed));
        assert_eq!(h.control.reload_count(), 0);
    }
}

// ============================================================================
// App names
// ============================================================================

mod app_name_tests {
    use super::*;
    use flotilla::error::ErrorCode;

    #[tokio::test]
    async fn test_names_differing_only_in_case_cannot_share_a_hostname() {
        let h = Harness::new();
        let first = h.orchestrator.create_app("Web", None, None).unwrap();
        assert_eq!(first.name, "web");

        let err = h.orchestrator.create_app("web", None, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert!(h.orchestrator.create_app("WEB", None, None).is_err());
        assert_eq!(h.orchestrator.list_apps().unwrap().len(), 1);

        let second = h.orchestrator.create_app("Api", None, None).unwrap();
        h.orchestrator.deploy(first.id, deploy_request(1)).await.unwrap();
        h.orchestrator.deploy(second.id, deploy_request(1)).await.unwrap();

        let first_route = h.route(first.id).unwrap();
        let second_route = h.route(second.id).unwrap();
        assert!(first_route.contains("server_name web.flotilla.local;"));
        assert!(second_route.contains("server_name api.flotilla.local;"));
    }

    #[test]
    fn test_store_rejects_case_insensitive_duplicates() {
        let h = Harness::new();
        h.create_app(1, "shop", None);
        let duplicate = h.db.create_app(&NewApp {
            id: Some(2),
            name: "Shop".to_string(),
            image: None,
            scaling_policy: None,
        });
        assert!(duplicate.is_err());
    }
}

// ============================================================================
// Scaling
// ============================================================================

mod scaling_tests {
    use super::*;

    #[tokio::test]
    async fn test_scale_clamps_to_policy() {
        let h = Harness::new();
        h.create_app(9, "web", Some(ScalingPolicy { min: 2, max: 6 }));

        assert_eq!(h.orchestrator.scale(9, 1).await.unwrap().instances, 2);
        assert_eq!(h.orchestrator.scale(9, 20).await.unwrap().instances, 6);

        let response = h.orchestrator.scale(9, 4).await.unwrap();
        assert_eq!(response.instances, 4);
        assert_eq!(response.status, "success");
        assert_eq!(h.db.get_instances(9).unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_scale_down_never_below_one() {
        let h = Harness::new();
        h.create_app(9, "web", None);
        h.orchestrator.scale(9, 2).await.unwrap();

        let response = h.orchestrator.scale_down(9, 5).await.unwrap();
        assert_eq!(response.instances, 1);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["action"], "scale_down");
    }

    #[tokio::test]
    async fn test_scale_up_then_deploy_uses_target() {
        let h = Harness::new();
        h.create_app(9, "web", None);

        let response = h.orchestrator.scale_up(9, 2).await.unwrap();
        assert_eq!(response.instances, 3);

        let deployed = h
            .orchestrator
            .deploy(9, DeployRequest::default())
            .await
            .unwrap();
        assert_eq!(deployed.instances, 3);
    }

    #[tokio::test]
    async fn test_scale_does_not_touch_running_instances() {
        let h = Harness::new();
        h.create_app(9, "web", None);
        h.orchestrator.deploy(9, deploy_request(2)).await.unwrap();

        h.orchestrator.scale(9, 5).await.unwrap();
        assert_eq!(h.runtime.container_names().len(), 2);
        assert_eq!(h.orchestrator.metrics(9).await.unwrap().instances, 5);
    }
}

// ============================================================================
// Proxy status
// ============================================================================

mod proxy_status_tests {
    use super::*;
    use flotilla::orchestrator::RouteStatus;

    #[tokio::test]
    async fn test_status_follows_route_file() {
        let h = Harness::new();
        h.create_app(11, "blog", None);

        let status = h.orchestrator.proxy_status(11).unwrap();
        assert_eq!(status.status, RouteStatus::Pending);
        assert_eq!(status.app_url, "http://blog.flotilla.local");

        h.orchestrator.deploy(11, deploy_request(1)).await.unwrap();
        let status = h.orchestrator.proxy_status(11).unwrap();
        assert_eq!(status.status, RouteStatus::Active);
        assert!(status.config_generated);

        h.orchestrator.stop(11).await.unwrap();
        assert_eq!(
            h.orchestrator.proxy_status(11).unwrap().status,
            RouteStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_regenerate_without_instances_is_empty() {
        let h = Harness::new();
        h.create_app(11, "blog", None);

        let regenerated = h.orchestrator.regenerate_proxy(11).await.unwrap();
        assert_eq!(regenerated.instances, 0);
        assert!(regenerated.ports.is_empty());
        assert!(h.default_route_exists());
    }
}
