//! Integration tests for complete batch workflows
//!
//! These run the orchestrator end to end against mock sessions, so no model
//! files or ONNX Runtime are needed.

mod common;

use common::{
    cpu_services, file_names, orchestrator, write_square, CancelAfter, FixedProbe, FlakyMatting,
    NamedFactory, NoFiles, StallOnceFactory,
};
use cutout_pipeline::{
    processor::ImageStatus, services::ProgressEvent, ArtifactKind, ChannelProgressReporter,
    InferenceServices, MattingStatus, MemoryConfigStore, OrchestratorConfig, PipelineOrchestrator,
    PipelineStage, ProgressReporter, ProgressUpdate, ProviderKind,
};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[test]
fn test_full_batch_with_every_optional_stage() {
    let dir = TempDir::new().unwrap();
    let first = write_square(dir.path(), "mug.png");
    let second = write_square(dir.path(), "lamp.png");
    let store = MemoryConfigStore::with_overrides(json!({
        "image_cropping": {"enabled": true},
        "solid_background": {"enabled": true, "color": "#FFFFFF"},
        "image_processing": {"jpg_export": {"enabled": true, "quality": 85}}
    }));
    let (reporter, events) = ChannelProgressReporter::new();
    let mut pipeline =
        orchestrator(store, NamedFactory::accepting(&["isnet-general-use"])).with_reporter(Arc::new(reporter));

    let summary = pipeline.run_batch(&[first, second]);
    assert_eq!(summary.completed(), 2);
    assert!(summary.is_success());

    for (outcome, stem) in summary.outcomes.iter().zip(["mug", "lamp"]) {
        let jpg = dir.path().join("JPG").join(format!("{stem}.jpg"));
        assert!(jpg.exists(), "missing {}", jpg.display());
        assert_eq!(outcome.final_output.as_deref(), Some(jpg.as_path()));
        assert_eq!(
            outcome.completed_stages().last(),
            Some(&PipelineStage::Completed)
        );
        assert_eq!(outcome.model.as_deref(), Some("isnet-general-use"));
    }

    // Masks are gone; only transparent and solid background PNGs remain
    let png = file_names(&dir.path().join("PNG"));
    assert_eq!(png.len(), 4, "{png:?}");
    assert!(png.iter().all(|f| f.contains("_transparent_") || f.contains("_solid_background_")));

    let events: Vec<ProgressEvent> = events.try_iter().collect();
    let finished = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Finished { .. }))
        .count();
    assert_eq!(finished, 1);
}

#[test]
fn test_explicit_output_directory() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let source = write_square(dir.path(), "vase.png");
    let config = OrchestratorConfig::builder()
        .alpha_matting(false)
        .warm_up(false)
        .output_dir(&out)
        .build()
        .unwrap();
    let mut pipeline = PipelineOrchestrator::new(
        config,
        cpu_services(NamedFactory::accepting(&["isnet-general-use"])),
        Arc::new(MemoryConfigStore::new()),
    )
    .unwrap();

    let summary = pipeline.run_batch(&[source]);
    assert_eq!(summary.completed(), 1);
    let files = file_names(&out);
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("vase_transparent_"));
    assert!(!dir.path().join("PNG").exists());
}

#[test]
fn test_matting_retries_then_succeeds() {
    let dir = TempDir::new().unwrap();
    let source = write_square(dir.path(), "chair.png");
    let config = OrchestratorConfig::builder().warm_up(false).build().unwrap();
    let matting = Arc::new(FlakyMatting::failing_first(2));
    let mut pipeline = PipelineOrchestrator::new(
        config,
        cpu_services(NamedFactory::accepting(&["isnet-general-use"])),
        Arc::new(MemoryConfigStore::new()),
    )
    .unwrap()
    .with_matting_backend(matting.clone());

    let summary = pipeline.run_batch(&[source]);
    let outcome = &summary.outcomes[0];
    assert!(outcome.is_completed());
    match outcome.matting.as_ref().unwrap() {
        MattingStatus::Applied {
            attempt,
            prior_failures,
            ..
        } => {
            assert_eq!(*attempt, 3);
            assert_eq!(prior_failures.len(), 2);
        },
        other => panic!("unexpected matting status {other:?}"),
    }
}

#[test]
fn test_matting_exhausted_still_produces_cutout() {
    let dir = TempDir::new().unwrap();
    let source = write_square(dir.path(), "chair.png");
    let config = OrchestratorConfig::builder().warm_up(false).build().unwrap();
    let mut pipeline = PipelineOrchestrator::new(
        config,
        cpu_services(NamedFactory::accepting(&["isnet-general-use"])),
        Arc::new(MemoryConfigStore::new()),
    )
    .unwrap()
    .with_matting_backend(Arc::new(FlakyMatting::failing_first(usize::MAX)));

    let summary = pipeline.run_batch(&[source]);
    let outcome = &summary.outcomes[0];
    assert!(outcome.is_completed());
    assert!(matches!(
        outcome.matting,
        Some(MattingStatus::Unavailable { ref failures }) if failures.len() == 5
    ));
    assert!(outcome.artifact(ArtifactKind::Transparent).is_some());
}

#[test]
fn test_timeout_is_bounded_and_batch_continues() {
    let dir = TempDir::new().unwrap();
    let inputs = vec![
        write_square(dir.path(), "a.png"),
        write_square(dir.path(), "b.png"),
    ];
    let config = OrchestratorConfig::builder()
        .alpha_matting(false)
        .warm_up(false)
        .inference_timeout(Duration::from_millis(60))
        .build()
        .unwrap();
    let factory = NamedFactory::accepting(&["isnet-general-use"]).with_delay(Duration::from_millis(500));
    let mut pipeline =
        PipelineOrchestrator::new(config, cpu_services(factory), Arc::new(MemoryConfigStore::new()))
            .unwrap();

    let started = Instant::now();
    let summary = pipeline.run_batch(&inputs);
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(summary.outcomes.len(), 2);
    for outcome in &summary.outcomes {
        assert!(matches!(
            outcome.status,
            ImageStatus::Failed {
                stage: PipelineStage::Inference,
                timed_out: true,
                ..
            }
        ));
    }
}

#[test]
fn test_image_after_timeout_gets_a_fresh_session() {
    let dir = TempDir::new().unwrap();
    let inputs = vec![
        write_square(dir.path(), "stuck.png"),
        write_square(dir.path(), "next.png"),
    ];
    let config = OrchestratorConfig::builder()
        .alpha_matting(false)
        .warm_up(false)
        .inference_timeout(Duration::from_millis(150))
        .build()
        .unwrap();
    let factory = Arc::new(StallOnceFactory::new(Duration::from_secs(3)));
    let services = InferenceServices::new(
        Arc::new(FixedProbe::new(vec![ProviderKind::Cpu])),
        factory.clone(),
        Arc::new(NoFiles),
    );
    let mut pipeline =
        PipelineOrchestrator::new(config, services, Arc::new(MemoryConfigStore::new())).unwrap();

    let started = Instant::now();
    let summary = pipeline.run_batch(&inputs);
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(matches!(
        summary.outcomes[0].status,
        ImageStatus::Failed { timed_out: true, .. }
    ));
    assert!(summary.outcomes[1].is_completed(), "{:?}", summary.outcomes[1].status);
    assert_eq!(factory.sessions_created.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cancel_between_images() {
    let dir = TempDir::new().unwrap();
    let inputs = vec![
        write_square(dir.path(), "one.png"),
        write_square(dir.path(), "two.png"),
        write_square(dir.path(), "three.png"),
    ];
    let mut pipeline = orchestrator(
        MemoryConfigStore::new(),
        NamedFactory::accepting(&["isnet-general-use"]),
    );
    let reporter = Arc::new(CancelAfter {
        after: 1,
        cancel: pipeline.cancel_handle(),
        completed: AtomicUsize::new(0),
    });
    pipeline = pipeline.with_reporter(reporter);

    let summary = pipeline.run_batch(&inputs);
    assert_eq!(summary.completed(), 1);
    assert_eq!(summary.cancelled(), 2);
    for outcome in &summary.outcomes[1..] {
        assert_eq!(outcome.status, ImageStatus::Cancelled { after: None });
        assert!(outcome.stage_results.is_empty());
    }
}

/// Cancels as soon as the cutout stage is announced
struct CancelAtCutout(cutout_pipeline::CancelHandle);

impl ProgressReporter for CancelAtCutout {
    fn on_progress(&self, update: ProgressUpdate) {
        if update.stage == PipelineStage::CutoutGenerated {
            self.0.request_cancel();
        }
    }

    fn on_file_completed(&self, _image_path: &Path) {}

    fn on_finished(&self, _elapsed_seconds: f64, _file_count: usize) {}
}

#[test]
fn test_cancel_mid_image_keeps_completed_output() {
    let dir = TempDir::new().unwrap();
    let source = write_square(dir.path(), "desk.png");
    let mut pipeline = orchestrator(
        MemoryConfigStore::new(),
        NamedFactory::accepting(&["isnet-general-use"]),
    );
    let cancel = pipeline.cancel_handle();
    pipeline = pipeline.with_reporter(Arc::new(CancelAtCutout(cancel)));

    let summary = pipeline.run_batch(&[source]);
    let outcome = &summary.outcomes[0];
    assert_eq!(
        outcome.status,
        ImageStatus::Cancelled {
            after: Some(PipelineStage::CutoutGenerated)
        }
    );
    let raw = outcome.artifact(ArtifactKind::RawCutout).unwrap();
    assert!(raw.path.exists());
    assert_eq!(outcome.final_output.as_deref(), Some(raw.path.as_path()));
    assert!(outcome.artifact(ArtifactKind::Transparent).is_none());
}

#[test]
fn test_spawned_batch_can_be_cancelled() {
    let dir = TempDir::new().unwrap();
    let inputs: Vec<_> = (0..4)
        .map(|i| write_square(dir.path(), &format!("item{i}.png")))
        .collect();
    let config = OrchestratorConfig::builder()
        .alpha_matting(false)
        .warm_up(false)
        .build()
        .unwrap();
    let factory = NamedFactory::accepting(&["isnet-general-use"]).with_delay(Duration::from_millis(100));
    let pipeline =
        PipelineOrchestrator::new(config, cpu_services(factory), Arc::new(MemoryConfigStore::new()))
            .unwrap();

    let handle = pipeline.spawn(inputs).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    handle.request_cancel();
    let summary = handle.join().unwrap();

    assert_eq!(summary.outcomes.len(), 4);
    assert!(summary.cancelled() >= 3, "{:?}", summary.outcomes);
    assert_eq!(summary.failed(), 0);
}
