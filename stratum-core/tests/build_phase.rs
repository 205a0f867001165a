//! Integration tests for the build phase.
//!
//! These tests drive the full orchestration path (digest calculation, cache
//! lookup, locking, atomic publication, report assembly) over the in-tree
//! filesystem stages storage and a scripted container backend.

mod common;

use common::*;
use std::sync::Arc;
use stratum_core::{
    run_phase, BuildPhase, BuildPhaseOptions, Conveyor, Image, ImageOptions, ImagesReport,
    ReportFormat, Result, Stage, StageKind, StratumError,
};
use tempfile::TempDir;

async fn run_build(
    conveyor: &Arc<Conveyor>,
    opts: BuildPhaseOptions,
) -> (Arc<ImagesReport>, Result<()>) {
    let phase = BuildPhase::new(Arc::clone(conveyor), opts);
    let report = phase.images_report();
    let result = run_phase(conveyor, Box::new(phase)).await;
    (report, result)
}

#[tokio::test]
async fn test_cold_build_single_image() {
    let root = TempDir::new().unwrap();
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());

    let img = two_stage_image("app", "ubuntu:22.04", "make all");
    let conveyor =
        ConveyorBuilder::new(vec![Arc::clone(&img)], Arc::clone(&backend)).build(root.path(), &events);

    let report_path = root.path().join("images-report.json");
    let opts = BuildPhaseOptions {
        report_path: Some(report_path.clone()),
        report_format: ReportFormat::Json,
        ..Default::default()
    };

    let (report, result) = run_build(&conveyor, opts).await;
    result.unwrap();

    // Both stages were built and stored exactly once.
    assert_eq!(backend.build_count(), 2);
    assert_eq!(count_events(&events, "store-image:"), 2);

    // One report entry whose name is the published "build" stage name.
    assert_eq!(report.len(), 1);
    let record = report.get_image_record("app").unwrap();
    let last_stage_name = img.last_non_empty_stage().unwrap().image().unwrap().name();
    assert_eq!(record.werf_image_name, last_stage_name);
    assert!(record.werf_image_name.starts_with("testproj-stages:"));
    assert!(record.docker_image_id.starts_with("sha256:"));

    // The report file is valid JSON with the declared shape and a trailing
    // newline.
    let data = std::fs::read_to_string(&report_path).unwrap();
    assert!(data.ends_with('\n'));
    assert!(!data.ends_with("\n\n"));
    let parsed: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(
        parsed["Images"]["app"]["WerfImageName"].as_str().unwrap(),
        record.werf_image_name
    );
    assert_eq!(parsed["Images"]["app"]["DockerImageID"].as_str().unwrap(), record.docker_image_id);

    // The base image was fetched for the "from" stage.
    assert_eq!(count_events(&events, "fetch-base:ubuntu:22.04"), 1);
}

#[tokio::test]
async fn test_warm_rebuild_hits_cache_everywhere() {
    let root = TempDir::new().unwrap();

    // Cold build.
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());
    let img = two_stage_image("app", "ubuntu:22.04", "make all");
    let conveyor = ConveyorBuilder::new(vec![img], Arc::clone(&backend)).build(root.path(), &events);
    let (first_report, result) = run_build(&conveyor, BuildPhaseOptions::default()).await;
    result.unwrap();
    assert_eq!(backend.build_count(), 2);

    // Warm rebuild with identical inputs: fresh conveyor over the same
    // storage root.
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());
    let img = two_stage_image("app", "ubuntu:22.04", "make all");
    let conveyor = ConveyorBuilder::new(vec![img], Arc::clone(&backend)).build(root.path(), &events);
    let (second_report, result) = run_build(&conveyor, BuildPhaseOptions::default()).await;
    result.unwrap();

    // Zero container builds, zero new storage entries, identical report.
    assert_eq!(backend.build_count(), 0);
    assert_eq!(count_events(&events, "store-image:"), 0);
    assert_eq!(
        first_report.get_image_record("app").unwrap(),
        second_report.get_image_record("app").unwrap()
    );
}

#[tokio::test]
async fn test_base_change_cascades_downstream() {
    let root = TempDir::new().unwrap();

    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());
    let img = two_stage_image("app", "base cache-version=1", "make all");
    let conveyor = ConveyorBuilder::new(vec![Arc::clone(&img)], Arc::clone(&backend))
        .build(root.path(), &events);
    let (first_report, result) = run_build(&conveyor, BuildPhaseOptions::default()).await;
    result.unwrap();
    let first_from_digest = img.stages()[0].digest().unwrap();
    let first_build_digest = img.stages()[1].digest().unwrap();

    // The base stage's inputs change; its digest and every downstream digest
    // must change, forcing a full rebuild.
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());
    let img = two_stage_image("app", "base cache-version=2", "make all");
    let conveyor = ConveyorBuilder::new(vec![Arc::clone(&img)], Arc::clone(&backend))
        .build(root.path(), &events);
    let (second_report, result) = run_build(&conveyor, BuildPhaseOptions::default()).await;
    result.unwrap();

    assert_ne!(img.stages()[0].digest().unwrap(), first_from_digest);
    assert_ne!(img.stages()[1].digest().unwrap(), first_build_digest);
    assert_eq!(backend.build_count(), 2);
    assert_eq!(count_events(&events, "store-image:"), 2);
    assert_ne!(
        first_report.get_image_record("app").unwrap().werf_image_name,
        second_report.get_image_record("app").unwrap().werf_image_name
    );
}

#[tokio::test]
async fn test_should_be_built_mode_with_cold_cache() {
    let root = TempDir::new().unwrap();
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());

    let img = two_stage_image("app", "ubuntu:22.04", "make all");
    let conveyor = ConveyorBuilder::new(vec![img], Arc::clone(&backend)).build(root.path(), &events);

    let opts = BuildPhaseOptions { should_be_built_mode: true, ..Default::default() };
    let (_, result) = run_build(&conveyor, opts).await;

    let err = result.unwrap_err();
    assert!(matches!(err, StratumError::StagesRequired));
    assert_eq!(err.to_string(), "stages required");

    // Strict mode never builds or stores anything.
    assert_eq!(backend.build_count(), 0);
    assert_eq!(count_events(&events, "store-image:"), 0);
}

#[tokio::test]
async fn test_should_be_built_mode_with_warm_cache() {
    let root = TempDir::new().unwrap();

    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());
    let img = two_stage_image("app", "ubuntu:22.04", "make all");
    let conveyor = ConveyorBuilder::new(vec![img], Arc::clone(&backend)).build(root.path(), &events);
    run_build(&conveyor, BuildPhaseOptions::default()).await.1.unwrap();

    // All stages in cache: strict mode succeeds without building.
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());
    let img = two_stage_image("app", "ubuntu:22.04", "make all");
    let conveyor = ConveyorBuilder::new(vec![img], Arc::clone(&backend)).build(root.path(), &events);
    let opts = BuildPhaseOptions { should_be_built_mode: true, ..Default::default() };
    run_build(&conveyor, opts).await.1.unwrap();

    assert_eq!(backend.build_count(), 0);
}

#[tokio::test]
async fn test_artifact_image_is_absent_from_report() {
    let root = TempDir::new().unwrap();
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());

    let artifact_stages = vec![
        Stage::new(StageKind::From, "builder", FixedDriver::new("golang:1.21")),
        Stage::new(StageKind::User("build".to_string()), "builder", FixedDriver::new("go build")),
    ];
    let artifact = Image::new(
        "builder",
        artifact_stages,
        ImageOptions {
            is_artifact: true,
            base_image_name: Some("golang:1.21".to_string()),
            ..Default::default()
        },
    );
    let app = two_stage_image("app", "alpine:3.19", "cp /artifact/bin .");

    let conveyor = ConveyorBuilder::new(vec![artifact, app], Arc::clone(&backend))
        .build(root.path(), &events);

    let (report, result) = run_build(&conveyor, BuildPhaseOptions::default()).await;
    result.unwrap();

    // The artifact participates in the build but not in the report, and it
    // never becomes a managed image.
    assert_eq!(backend.build_count(), 4);
    assert_eq!(report.len(), 1);
    assert!(report.get_image_record("builder").is_none());
    assert!(report.get_image_record("app").is_some());

    let managed = events_with_prefix(&events, "add-managed:");
    assert_eq!(managed, vec!["add-managed:app"]);
}

#[tokio::test]
async fn test_managed_image_record_only_after_new_builds() {
    let root = TempDir::new().unwrap();

    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());
    let img = two_stage_image("app", "ubuntu:22.04", "make all");
    let conveyor = ConveyorBuilder::new(vec![img], Arc::clone(&backend)).build(root.path(), &events);
    run_build(&conveyor, BuildPhaseOptions::default()).await.1.unwrap();
    assert_eq!(count_events(&events, "add-managed:"), 1);

    // A fully cached rebuild registers nothing.
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());
    let img = two_stage_image("app", "ubuntu:22.04", "make all");
    let conveyor = ConveyorBuilder::new(vec![img], Arc::clone(&backend)).build(root.path(), &events);
    run_build(&conveyor, BuildPhaseOptions::default()).await.1.unwrap();
    assert_eq!(count_events(&events, "add-managed:"), 0);
}

#[tokio::test]
async fn test_image_metadata_publish_is_idempotent() {
    let root = TempDir::new().unwrap();

    let run = |events: EventLog, backend: Arc<ScriptedBackend>| {
        let img = two_stage_image("app", "ubuntu:22.04", "make all");
        let mut builder = ConveyorBuilder::new(vec![img], backend);
        builder.git_repo = Some(Arc::new(FixedGitRepo("0123abcd".to_string())));
        builder.build(root.path(), &events)
    };

    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());
    let conveyor = run(events.clone(), Arc::clone(&backend));
    run_build(&conveyor, BuildPhaseOptions::default()).await.1.unwrap();
    assert_eq!(
        events_with_prefix(&events, "put-metadata:"),
        vec!["put-metadata:app:0123abcd"]
    );

    // Same commit, same stage id: the pair is already published.
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());
    let conveyor = run(events.clone(), Arc::clone(&backend));
    run_build(&conveyor, BuildPhaseOptions::default()).await.1.unwrap();
    assert_eq!(count_events(&events, "put-metadata:"), 0);
}

#[tokio::test]
async fn test_service_labels_applied_to_built_stages() {
    let root = TempDir::new().unwrap();
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());

    let img = two_stage_image("app", "ubuntu:22.04", "make all");
    let conveyor = ConveyorBuilder::new(vec![Arc::clone(&img)], Arc::clone(&backend))
        .build(root.path(), &events);
    run_build(&conveyor, BuildPhaseOptions::default()).await.1.unwrap();

    let build_stage = &img.stages()[1];
    let labels = build_stage.image().unwrap().container().service_commit_changes.labels;

    assert_eq!(labels.get("werf").map(String::as_str), Some("testproj"));
    assert_eq!(labels.get("werf-image").map(String::as_str), Some("false"));
    assert_eq!(
        labels.get("werf-stage-digest").cloned(),
        build_stage.digest()
    );
    assert_eq!(
        labels.get("werf-stage-content-digest").cloned(),
        build_stage.content_digest()
    );
    assert!(labels.contains_key("werf-version"));
    assert!(labels.contains_key("werf-cache-version"));
    assert!(labels.contains_key("werf-docker-image-name"));

    // Stage digests are 56-char lowercase hex SHA3-224.
    let digest = build_stage.digest().unwrap();
    assert_eq!(digest.len(), 56);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[tokio::test]
async fn test_dockerfile_image_gets_label_build_args() {
    let root = TempDir::new().unwrap();
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());

    let stage = Stage::new(StageKind::Dockerfile, "web", FixedDriver::new("dockerfile-checksum"));
    let img = Image::new(
        "web",
        vec![Arc::clone(&stage)],
        ImageOptions { is_dockerfile_image: true, ..Default::default() },
    );

    let conveyor = ConveyorBuilder::new(vec![img], Arc::clone(&backend)).build(root.path(), &events);
    run_build(&conveyor, BuildPhaseOptions::default()).await.1.unwrap();

    // Dockerfile stages receive service labels as --label build args instead
    // of commit changes.
    let image = stage.image().unwrap();
    let args = image.dockerfile_build_args();
    assert!(args.iter().any(|a| a.starts_with("--label=werf-stage-digest=")));
    assert!(args.iter().any(|a| a == "--label=werf-image=false"));
    assert!(image.container().service_commit_changes.labels.is_empty());
}

#[tokio::test]
async fn test_ssh_auth_sock_is_forwarded() {
    let root = TempDir::new().unwrap();
    let events = new_event_log();
    let backend = ScriptedBackend::new(events.clone());

    let img = two_stage_image("app", "ubuntu:22.04", "make all");
    let mut builder = ConveyorBuilder::new(vec![Arc::clone(&img)], Arc::clone(&backend));
    builder.ssh_auth_sock = Some("/run/user/1000/ssh-agent.sock".to_string());
    let conveyor = builder.build(root.path(), &events);

    run_build(&conveyor, BuildPhaseOptions::default()).await.1.unwrap();

    let container = img.stages()[1].image().unwrap().container();
    assert!(container.run_options.env.contains_key("SSH_AUTH_SOCK"));
    assert_eq!(container.run_options.volumes.len(), 1);
}
