use std::rc::Rc;
use std::time::Duration;

use tokio::task::LocalSet;

use crate::common::config::GridManagerConfig;
use crate::job::{JobEventKind, JobId, JobStatus};
use crate::manager::{GridManager, TransportFactory, create_manager_service};
use crate::queue::attrs::*;
use crate::queue::{AttrValue, JobAttributes, JobQueueRef, MemoryJobQueue, queue_ref};
use crate::WrappedRcRefCell;
use crate::tests::utils::{MockRemote, MockScheduler, init_test_logging, mock_remote_transport};

fn mock_transports(remote: WrappedRcRefCell<MockRemote>) -> TransportFactory {
    Box::new(move |_| Ok(("mock".to_string(), mock_remote_transport(remote.clone()))))
}

fn gce_attrs() -> JobAttributes {
    let mut attrs = JobAttributes::default();
    attrs.insert(
        GRID_RESOURCE.to_string(),
        "gce https://gce.example.com project-key".into(),
    );
    attrs.insert(JOB_STATUS.to_string(), JobStatus::Idle.code().into());
    attrs.insert("GceImage".to_string(), "debian-12".into());
    attrs
}

fn with(mut attrs: JobAttributes, name: &str, value: AttrValue) -> JobAttributes {
    attrs.insert(name.to_string(), value);
    attrs
}

fn create_manager(
    config: GridManagerConfig,
    remote: &WrappedRcRefCell<MockRemote>,
) -> (GridManager, JobQueueRef) {
    init_test_logging();
    let queue = queue_ref(MemoryJobQueue::default());
    let manager = GridManager::new(
        config,
        queue.clone(),
        mock_transports(remote.clone()),
        Rc::new(MockScheduler::default()),
    )
    .unwrap();
    (manager, queue)
}

fn status_of(queue: &JobQueueRef, job: JobId) -> Option<JobStatus> {
    queue
        .get()
        .lookup(job, JOB_STATUS)
        .and_then(|v| v.as_int())
        .and_then(JobStatus::from_code)
}

#[tokio::test(start_paused = true)]
async fn test_scan_selects_grid_jobs() {
    LocalSet::new()
        .run_until(async move {
            let remote = WrappedRcRefCell::wrap(MockRemote::default());
            let (mut manager, queue) = create_manager(GridManagerConfig::default(), &remote);
            {
                let mut q = queue.get_mut();
                q.add_job(JobId::new(1, 0), gce_attrs());
                let mut local = gce_attrs();
                local.remove(GRID_RESOURCE);
                q.add_job(JobId::new(2, 0), local);
                q.add_job(
                    JobId::new(3, 0),
                    with(gce_attrs(), MANAGED, MANAGED_DONE.into()),
                );
                q.add_job(
                    JobId::new(4, 0),
                    with(gce_attrs(), JOB_STATUS, JobStatus::Held.code().into()),
                );
                q.add_job(
                    JobId::new(5, 0),
                    with(gce_attrs(), MANAGED, MANAGED_SCHEDD.into()),
                );
            }

            assert_eq!(manager.scan(), 1);
            assert!(manager.is_managed(JobId::new(1, 0)));
            assert_eq!(
                queue.get().lookup(JobId::new(1, 0), MANAGED),
                Some(MANAGED_EXTERNAL.into())
            );
            let status = manager.status();
            assert_eq!(status.jobs, 1);
            assert_eq!(status.resources, 1);
            assert_eq!(status.helpers, 1);
            assert_eq!(status.staging_servers, 0);

            // Already managed jobs are not picked up twice
            assert_eq!(manager.scan(), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_constraint_limits_managed_jobs() {
    LocalSet::new()
        .run_until(async move {
            let remote = WrappedRcRefCell::wrap(MockRemote::default());
            let config = GridManagerConfig {
                constraint: Some("Owner == \"alice\"".to_string()),
                ..Default::default()
            };
            let (mut manager, queue) = create_manager(config, &remote);
            queue.get_mut().add_job(
                JobId::new(1, 0),
                with(gce_attrs(), "Owner", "alice".into()),
            );
            queue
                .get_mut()
                .add_job(JobId::new(2, 0), with(gce_attrs(), "Owner", "bob".into()));

            assert_eq!(manager.scan(), 1);
            assert!(manager.is_managed(JobId::new(1, 0)));
            assert!(!manager.is_managed(JobId::new(2, 0)));

            // Widening the constraint picks up the remaining job
            manager.reconfig(GridManagerConfig::default()).unwrap();
            assert_eq!(manager.scan(), 1);
            assert!(manager.is_managed(JobId::new(2, 0)));
        })
        .await;
}

#[test]
fn test_invalid_constraint() {
    let config = GridManagerConfig {
        constraint: Some("Owner".to_string()),
        ..Default::default()
    };
    let queue = queue_ref(MemoryJobQueue::default());
    let remote = WrappedRcRefCell::wrap(MockRemote::default());
    assert!(
        GridManager::new(
            config,
            queue,
            mock_transports(remote),
            Rc::new(MockScheduler::default())
        )
        .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn test_helper_creation_failure_postpones_jobs() {
    LocalSet::new()
        .run_until(async move {
            init_test_logging();
            let queue = queue_ref(MemoryJobQueue::default());
            queue.get_mut().add_job(JobId::new(1, 0), gce_attrs());
            let mut manager = GridManager::new(
                GridManagerConfig::default(),
                queue.clone(),
                Box::new(|_| Err(anyhow::anyhow!("no helper configured"))),
                Rc::new(MockScheduler::default()),
            )
            .unwrap();
            assert_eq!(manager.scan(), 0);
            assert!(!manager.is_managed(JobId::new(1, 0)));
            assert_eq!(queue.get().lookup(JobId::new(1, 0), MANAGED), None);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_job_is_managed_until_removed() {
    LocalSet::new()
        .run_until(async move {
            init_test_logging();
            let remote = WrappedRcRefCell::wrap(MockRemote::default());
            let queue = queue_ref(MemoryJobQueue::default());
            let job = JobId::new(7, 0);
            queue.get_mut().add_job(job, gce_attrs());

            let (service, process) = create_manager_service(
                GridManagerConfig::default(),
                queue.clone(),
                mock_transports(remote.clone()),
                Rc::new(MockScheduler::default()),
            )
            .unwrap();
            let handle = tokio::task::spawn_local(process);

            tokio::time::sleep(Duration::from_secs(300)).await;
            assert_eq!(remote.get().count("_INSERT"), 1);
            assert_eq!(status_of(&queue, job), Some(JobStatus::Running));
            assert!(queue.get().lookup(job, GRID_JOB_ID).is_some());
            let status = service.status().await.unwrap();
            assert_eq!(status.jobs, 1);
            assert_eq!(status.resources, 1);

            service.remove_job(job);
            tokio::time::sleep(Duration::from_secs(120)).await;
            assert_eq!(remote.get().count("_DELETE"), 1);
            assert_eq!(status_of(&queue, job), Some(JobStatus::Removed));
            assert_eq!(queue.get().lookup(job, MANAGED), Some(MANAGED_DONE.into()));

            let status = service.status().await.unwrap();
            assert_eq!(status.jobs, 0);
            assert_eq!(status.resources, 0);

            service.quit();
            handle.await.unwrap();
            assert!(service.status().await.is_err());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_quit_stops_jobs_and_flushes_queue() {
    LocalSet::new()
        .run_until(async move {
            init_test_logging();
            let remote = WrappedRcRefCell::wrap(MockRemote::default());
            let queue = queue_ref(MemoryJobQueue::default());
            let job = JobId::new(1, 0);
            queue.get_mut().add_job(job, gce_attrs());

            let (service, process) = create_manager_service(
                GridManagerConfig::default(),
                queue.clone(),
                mock_transports(remote.clone()),
                Rc::new(MockScheduler::default()),
            )
            .unwrap();
            let handle = tokio::task::spawn_local(process);
            tokio::time::sleep(Duration::from_secs(300)).await;
            assert_eq!(status_of(&queue, job), Some(JobStatus::Running));

            service.quit();
            handle.await.unwrap();

            // The remote job keeps running and is picked up by the next grid manager
            assert_eq!(remote.get().count("_DELETE"), 0);
            assert_eq!(
                queue.get().lookup(job, MANAGED),
                Some(MANAGED_EXTERNAL.into())
            );
            assert!(queue.get().lookup(job, GRID_JOB_ID).is_some());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_events_are_reported_once() {
    LocalSet::new()
        .run_until(async move {
            let dir = tempfile::TempDir::with_prefix("gm").unwrap();
            let report = dir.path().join("events.jsonl");
            let remote = WrappedRcRefCell::wrap(MockRemote::default());
            let (manager, _queue) = create_manager(GridManagerConfig::default(), &remote);

            manager.events().get_mut().add(
                JobId::new(1, 0),
                JobEventKind::Submit,
                "gce https://gce.example.com".to_string(),
            );
            manager
                .events()
                .get_mut()
                .add(JobId::new(1, 0), JobEventKind::Execute, String::new());
            assert_eq!(manager.report_events(&report).unwrap(), 2);
            assert_eq!(manager.report_events(&report).unwrap(), 0);

            manager
                .events()
                .get_mut()
                .add(JobId::new(1, 0), JobEventKind::Terminated, String::new());
            assert_eq!(manager.report_events(&report).unwrap(), 1);

            let text = std::fs::read_to_string(&report).unwrap();
            let kinds: Vec<JobEventKind> = text
                .lines()
                .map(|line| {
                    serde_json::from_str::<crate::job::JobEventRecord>(line)
                        .unwrap()
                        .kind
                })
                .collect();
            assert_eq!(
                kinds,
                vec![
                    JobEventKind::Submit,
                    JobEventKind::Execute,
                    JobEventKind::Terminated
                ]
            );
        })
        .await;
}
