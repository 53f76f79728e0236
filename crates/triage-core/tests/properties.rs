//! Properties every diagnosis must hold regardless of cluster state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use cluster_probe::fakes::{ClusterSnapshot, Fault, InMemoryCluster, Operation};
use cluster_probe::{Collaborators, ProbeError};
use triage_core::{
    Action, DiagnosticRequest, EvidenceSource, ReportStatus, TimeWindow, TriageConfig,
    TriageEngine, TriageError, ValidationError,
};

const SNAPSHOT: &str = r#"{
  "clusters": [{"name": "shop-prod", "status": "ACTIVE"}, {"name": "billing", "status": "ACTIVE"}],
  "stacks": [{"description": {"name": "shop", "status": "UPDATE_COMPLETE"}}],
  "services": [
    {"description": {"cluster": "shop-prod", "name": "shop-web", "status": "ACTIVE",
                     "desired_count": 2, "running_count": 1, "task_definition": "web:2"}},
    {"description": {"cluster": "billing", "name": "invoices", "status": "ACTIVE",
                     "desired_count": 1, "running_count": 1}},
    {"description": {"cluster": "billing", "name": "payments", "status": "ACTIVE",
                     "desired_count": 1, "running_count": 1}}
  ],
  "tasks": [
    {"cluster": "shop-prod", "task_arn": "arn:aws:ecs:r:1:task/shop-prod/9f8e",
     "task_definition_arn": "web:2", "group": "service:shop-web", "last_status": "STOPPED",
     "stopped_at": "2026-10-18T10:30:00Z", "stopped_reason": "Essential container in task exited",
     "containers": [{"name": "web", "exit_code": 137, "reason": "OutOfMemoryError: Container killed due to memory usage"}]},
    {"cluster": "shop-prod", "task_arn": "arn:aws:ecs:r:1:task/shop-prod/7a6b",
     "task_definition_arn": "web:2", "group": "service:shop-web", "last_status": "RUNNING"}
  ],
  "log_groups": [{
    "name": "/ecs/shop-prod/shop",
    "events": [
      {"timestamp": "2026-10-18T10:29:00Z", "stream": "ecs/web/9f8e", "message": "ERROR heap exhausted"},
      {"timestamp": "2026-10-18T10:29:30Z", "stream": "ecs/web/7a6b", "message": "served 200"}
    ]
  }]
}"#;

fn fake() -> Arc<InMemoryCluster> {
    Arc::new(InMemoryCluster::new(
        ClusterSnapshot::from_json(SNAPSHOT).expect("snapshot parses"),
    ))
}

fn window() -> TimeWindow {
    TimeWindow::new(
        Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap(),
    )
    .unwrap()
}

fn engine_with(fake: &Arc<InMemoryCluster>, config: TriageConfig) -> TriageEngine {
    TriageEngine::new(Collaborators::uniform(fake.clone()), config)
}

#[tokio::test]
async fn missing_identifiers_fail_before_any_call() {
    let fake = fake();
    let engine = engine_with(&fake, TriageConfig::default());

    for action in Action::ALL {
        let err = engine
            .diagnose(&DiagnosticRequest::new(action).with_symptom("broken"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, TriageError::Validation(ValidationError::MissingIdentifiers)),
            "{action}: {err}"
        );
    }

    let err = engine
        .diagnose(&DiagnosticRequest::new(Action::Service).with_cluster("shop-prod"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TriageError::Validation(ValidationError::MissingIdentifier { .. })
    ));
    assert_eq!(fake.total_calls(), 0);
}

#[tokio::test]
async fn supporting_evidence_always_resolves() {
    let fake = fake();
    let engine = engine_with(&fake, TriageConfig::default());
    let requests = [
        DiagnosticRequest::guidance("web keeps restarting").with_app_name("shop"),
        DiagnosticRequest::new(Action::Task).with_app_name("shop"),
        DiagnosticRequest::new(Action::Logs).with_app_name("shop"),
        DiagnosticRequest::new(Action::Stack).with_app_name("shop"),
        DiagnosticRequest::new(Action::Network)
            .with_cluster("billing")
            .with_service("payments"),
    ];

    for request in requests {
        let report = engine
            .diagnose(&request.with_time_window(window()))
            .await
            .unwrap();
        assert!(report.dangling_references().is_empty());
        for h in report.hypotheses() {
            assert!((0.0..=1.0).contains(&h.confidence));
            for id in &h.supporting_evidence {
                assert!(report.evidence_by_id(id).is_some());
            }
        }
    }
}

#[tokio::test]
async fn repeated_runs_rank_identically() {
    let fake = fake();
    let engine = engine_with(&fake, TriageConfig::default());
    let request = DiagnosticRequest::guidance("web keeps restarting")
        .with_app_name("shop")
        .with_time_window(window());

    let first = engine.diagnose(&request).await.unwrap();
    for _ in 0..3 {
        let again = engine.diagnose(&request).await.unwrap();
        assert_eq!(again.hypotheses(), first.hypotheses());
        assert_eq!(again.path_taken(), first.path_taken());
        assert_ne!(again.session_id(), first.session_id());
    }
}

#[tokio::test]
async fn app_name_discovers_cluster_and_service() {
    let fake = fake();
    let engine = engine_with(&fake, TriageConfig::default());
    let request = DiagnosticRequest::guidance("web keeps restarting")
        .with_app_name("shop")
        .with_time_window(window());

    let plan = engine.plan(&request).await.unwrap();
    assert_eq!(plan.target.cluster, "shop-prod");
    assert_eq!(plan.target.service.as_deref(), Some("shop-web"));
    assert_eq!(plan.target.stack_name.as_deref(), Some("shop"));
    assert_eq!(plan.steps, vec![EvidenceSource::Service, EvidenceSource::Task]);

    let report = engine.diagnose(&request).await.unwrap();
    assert_eq!(
        report.top_hypothesis().unwrap().cause_code,
        triage_core::CauseCode::OutOfMemory
    );
}

#[tokio::test]
async fn unknown_app_falls_back_to_conventional_cluster() {
    let fake = fake();
    let engine = engine_with(&fake, TriageConfig::default());
    let plan = engine
        .plan(&DiagnosticRequest::guidance("down").with_app_name("ledger"))
        .await
        .unwrap();
    assert_eq!(plan.target.cluster, "ledger-cluster");
    assert_eq!(plan.steps, vec![EvidenceSource::Stack, EvidenceSource::Service]);
}

#[tokio::test]
async fn cluster_with_several_services_is_swept() {
    let fake = fake();
    let engine = engine_with(&fake, TriageConfig::default());
    let request = DiagnosticRequest::guidance("slow")
        .with_cluster("billing")
        .with_time_window(window());

    let plan = engine.plan(&request).await.unwrap();
    assert_eq!(plan.branch, triage_core::Branch::BroadSweep);
    assert_eq!(plan.target.service, None);
    assert!(
        plan.warnings.iter().any(|w| w.contains("has 2 services")),
        "{:?}",
        plan.warnings
    );

    let report = engine.diagnose(&request).await.unwrap();
    assert!(report.warnings().iter().any(|w| w.contains("has 2 services")));
    assert_ne!(report.status(), ReportStatus::Resolved);
}

fn quick_retries() -> TriageConfig {
    let mut config = TriageConfig::default();
    config.fetch.backoff_base_ms = 1;
    config.fetch.backoff_max_ms = 2;
    config
}

#[tokio::test]
async fn failed_service_listing_is_a_warning_not_an_error() {
    let fake = fake();
    fake.inject_always(
        Operation::ListServices,
        Fault::Fail(ProbeError::unavailable("ecs:ListServices", "503")),
    );
    let engine = engine_with(&fake, quick_retries());

    let report = engine
        .diagnose(
            &DiagnosticRequest::guidance("slow")
                .with_cluster("shop-prod")
                .with_time_window(window()),
        )
        .await
        .unwrap();
    assert!(
        report.warnings().iter().any(|w| w.contains("ecs:ListServices")),
        "{:?}",
        report.warnings()
    );
}

#[tokio::test]
async fn failed_cluster_listing_falls_back_with_warning() {
    let fake = fake();
    fake.inject_always(
        Operation::ListClusters,
        Fault::Fail(ProbeError::unavailable("ecs:ListClusters", "503")),
    );
    let engine = engine_with(&fake, quick_retries());

    let plan = engine
        .plan(&DiagnosticRequest::guidance("down").with_app_name("shop"))
        .await
        .unwrap();
    assert_eq!(plan.target.cluster, "shop-cluster");
    assert!(
        plan.warnings.iter().any(|w| w.contains("ecs:ListClusters")),
        "{:?}",
        plan.warnings
    );
}

#[tokio::test]
async fn image_words_inside_other_words_do_not_route_to_image_pull() {
    let fake = fake();
    let engine = engine_with(&fake, TriageConfig::default());
    let plan = engine
        .plan(
            &DiagnosticRequest::guidance("secrets not loading after tagline change")
                .with_cluster("billing")
                .with_service("payments"),
        )
        .await
        .unwrap();
    assert_ne!(plan.branch, triage_core::Branch::ImageSymptom);
    assert_ne!(plan.steps.first(), Some(&EvidenceSource::ImagePull));
}

#[tokio::test]
async fn slow_fetcher_is_named_in_warnings() {
    let fake = fake();
    fake.inject_always(
        Operation::FilterLogEvents,
        Fault::Delay(Duration::from_secs(5)),
    );
    let mut config = TriageConfig::default();
    config.fetch.call_timeout_ms = 50;
    let engine = engine_with(&fake, config);

    let report = engine
        .diagnose(
            &DiagnosticRequest::new(Action::Logs)
                .with_app_name("shop")
                .with_time_window(window()),
        )
        .await
        .unwrap();
    assert!(
        report.warnings().iter().any(|w| w.contains("fetcher logs")),
        "{:?}",
        report.warnings()
    );
    assert_ne!(report.status(), ReportStatus::Resolved);
}

#[tokio::test]
async fn session_timeout_degrades_report() {
    let fake = fake();
    fake.inject_always(
        Operation::ListStackResources,
        Fault::Delay(Duration::from_secs(5)),
    );
    let mut config = TriageConfig::default();
    config.session.timeout_ms = 200;
    let engine = engine_with(&fake, config);

    let report = engine
        .diagnose(
            &DiagnosticRequest::new(Action::Stack)
                .with_app_name("shop")
                .with_time_window(window()),
        )
        .await
        .unwrap();
    assert_eq!(report.status(), ReportStatus::Degraded);
    assert_eq!(report.path_taken(), &[EvidenceSource::Stack]);
    assert!(report.warnings().iter().any(|w| w.contains("fetcher stack")));
    // stack status was read before resources stalled
    assert!(report
        .evidence_from(EvidenceSource::Stack)
        .any(|e| matches!(e.finding(), triage_core::Finding::StackHealthy { .. })));
}

#[tokio::test]
async fn throttling_is_retried_then_recovered() {
    let fake = fake();
    for _ in 0..2 {
        fake.inject(
            Operation::DescribeService,
            Fault::Fail(ProbeError::throttled("ecs:DescribeServices")),
        );
    }
    let mut config = TriageConfig::default();
    config.fetch.backoff_base_ms = 1;
    config.fetch.backoff_max_ms = 2;
    let engine = engine_with(&fake, config);

    let report = engine
        .diagnose(
            &DiagnosticRequest::new(Action::Service)
                .with_cluster("billing")
                .with_service("payments")
                .with_time_window(window()),
        )
        .await
        .unwrap();
    assert!(report.warnings().is_empty(), "{:?}", report.warnings());
    assert_eq!(fake.calls(Operation::DescribeService), 3);
}

#[tokio::test]
async fn access_denied_becomes_error_evidence() {
    let fake = fake();
    fake.inject_always(
        Operation::DescribeService,
        Fault::Fail(ProbeError::access_denied(
            "ecs:DescribeServices",
            "not authorized to perform ecs:DescribeServices",
        )),
    );
    let engine = engine_with(&fake, TriageConfig::default());

    let report = engine
        .diagnose(
            &DiagnosticRequest::new(Action::Service)
                .with_cluster("billing")
                .with_service("payments")
                .with_time_window(window()),
        )
        .await
        .unwrap();
    assert_eq!(fake.calls(Operation::DescribeService), 1);
    assert_eq!(report.evidence().len(), 1);
    assert_eq!(
        report.top_hypothesis().unwrap().cause_code,
        triage_core::CauseCode::PermissionDenied
    );
}
