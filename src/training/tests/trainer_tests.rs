//! Tests for trainer functionality

use tokio::sync::mpsc;

use crate::error::Error;
use crate::models::{MeanPoolClassifier, SequenceClassifier, TrainableClassifier};
use crate::training::config::{DistillationConfig, TrainingConfig};
use crate::training::metrics::{AccuracyMetric, ClassificationMetrics, MetricEngine, MetricRecord, MockMetricEngine};
use crate::training::trainer::{DistillationTrainer, TrainingEvent, TrainingPhase};

use super::fixtures::{
    classifier, loader, separable_examples, snapshot, FixedLogitsClassifier, PoisonedStudent,
    TrainingTestFixture,
};

fn trainer<S: TrainableClassifier>(
    config: TrainingConfig,
    distillation: DistillationConfig,
    student: S,
    teacher: Option<Box<dyn SequenceClassifier>>,
    metric_engine: Box<dyn MetricEngine>,
) -> crate::error::Result<DistillationTrainer<S>> {
    DistillationTrainer::new(
        config,
        distillation,
        student,
        teacher,
        loader(separable_examples(8), 4, true),
        loader(separable_examples(4), 4, false),
        metric_engine,
    )
}

fn teacher() -> Option<Box<dyn SequenceClassifier>> {
    Some(Box::new(classifier("teacher", 16, 7)))
}

fn scripted_metrics(accuracies: Vec<f64>) -> Box<dyn MetricEngine> {
    let mut engine = MockMetricEngine::new();
    let mut calls = 0;
    engine
        .expect_compute()
        .times(accuracies.len())
        .returning(move |_, _| {
            let mut record = MetricRecord::new();
            record.insert("accuracy", accuracies[calls]);
            calls += 1;
            Ok(record)
        });
    Box::new(engine)
}

/// Fresh student holding the weights of a checkpoint directory
fn weights_of(path: &std::path::Path) -> Vec<(String, Vec<f32>)> {
    let mut model = classifier("student", 8, 1234);
    crate::training::checkpoints::CheckpointManager::load_weights(path, model.varmap_mut()).unwrap();
    snapshot(model.varmap())
}

#[test]
fn test_distillation_run_completes() {
    let fixture = TrainingTestFixture::new(3, 4);
    let mut trainer = trainer(
        fixture.config.clone(),
        DistillationConfig::distillation(0.5, 2.0),
        classifier("student", 8, 1),
        teacher(),
        Box::new(ClassificationMetrics::new(2)),
    )
    .unwrap();

    let result = trainer.train().unwrap();

    assert_eq!(result.history.len(), 3);
    assert_eq!(result.total_steps, 6);
    assert_eq!(trainer.state().phase, TrainingPhase::Completed);
    for record in &result.history {
        assert!(record.get("accuracy").is_some());
        assert!(record.get("f1_macro").is_some());
        assert!(record.get("eval_loss").unwrap().is_finite());
        assert!(record.get("train_loss").unwrap().is_finite());
    }

    let best_seen = result
        .history
        .iter()
        .map(|r| r.get("accuracy").unwrap())
        .fold(f64::MIN, f64::max);
    assert_eq!(result.best_metric, best_seen);
    assert_eq!(result.final_metrics.get("accuracy"), Some(best_seen));

    let output_dir = &fixture.config.checkpointing.output_dir;
    let metrics_log = std::fs::read_to_string(output_dir.join("metrics.jsonl")).unwrap();
    assert_eq!(metrics_log.lines().count(), 3);
}

#[test]
fn test_supervised_run_needs_no_teacher() {
    let fixture = TrainingTestFixture::new(2, 4);
    let mut trainer = trainer(
        fixture.config.clone(),
        DistillationConfig::supervised(),
        classifier("student", 8, 1),
        None,
        Box::new(AccuracyMetric),
    )
    .unwrap();

    let result = trainer.train().unwrap();
    assert_eq!(result.history.len(), 2);
}

#[test]
fn test_best_checkpoint_is_restored_at_end() {
    let fixture = TrainingTestFixture::new(3, 4);
    let mut trainer = trainer(
        fixture.config.clone(),
        DistillationConfig::distillation(0.5, 2.0),
        classifier("student", 8, 1),
        teacher(),
        scripted_metrics(vec![0.5, 0.9, 0.6]),
    )
    .unwrap();

    let result = trainer.train().unwrap();

    let best_dir = fixture.config.checkpointing.output_dir.join("checkpoint-1");
    assert_eq!(result.best_checkpoint, best_dir);
    assert_eq!(result.best_metric, 0.9);
    assert_eq!(snapshot(trainer.student().varmap()), weights_of(&best_dir));

    let last_dir = fixture.config.checkpointing.output_dir.join("checkpoint-2");
    assert_ne!(snapshot(trainer.student().varmap()), weights_of(&last_dir));
}

#[test]
fn test_non_finite_loss_aborts_before_update() {
    let fixture = TrainingTestFixture::new(3, 4);
    // Third training forward pass: epoch 1, batch 0
    let student = PoisonedStudent::new(classifier("student", 8, 1), 2);
    let mut trainer = trainer(
        fixture.config.clone(),
        DistillationConfig::distillation(0.5, 2.0),
        student,
        teacher(),
        Box::new(AccuracyMetric),
    )
    .unwrap();

    let err = trainer.train().unwrap_err();

    match &err {
        Error::Aborted { epoch, step, .. } => assert_eq!((*epoch, *step), (1, 0)),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(
        err.root(),
        Error::NumericalInstability { epoch: 1, step: 0, value } if value.is_nan()
    ));
    assert!(matches!(trainer.state().phase, TrainingPhase::Failed { .. }));

    // Completed epochs stay on disk and the poisoned batch changed nothing
    assert_eq!(fixture.checkpoint_dirs(), vec!["checkpoint-0".to_string()]);
    let checkpoint = fixture.config.checkpointing.output_dir.join("checkpoint-0");
    assert_eq!(snapshot(trainer.student().varmap()), weights_of(&checkpoint));
}

#[test]
fn test_metric_engine_failure_aborts_run() {
    let fixture = TrainingTestFixture::new(2, 4);
    let mut engine = MockMetricEngine::new();
    engine
        .expect_compute()
        .times(1)
        .returning(|_, _| Err(Error::evaluation("metric backend unavailable")));

    let mut trainer = trainer(
        fixture.config.clone(),
        DistillationConfig::distillation(0.5, 2.0),
        classifier("student", 8, 1),
        teacher(),
        Box::new(engine),
    )
    .unwrap();

    let err = trainer.train().unwrap_err();
    assert!(matches!(err, Error::EpochAborted { epoch: 0, phase: "evaluating", .. }));
    assert!(matches!(err.root(), Error::Evaluation(_)));
    assert!(fixture.checkpoint_dirs().is_empty());
}

#[test]
fn test_checkpoint_failure_reports_epoch() {
    let fixture = TrainingTestFixture::new(2, 4);
    let mut trainer = trainer(
        fixture.config.clone(),
        DistillationConfig::distillation(0.5, 2.0),
        classifier("student", 8, 1),
        teacher(),
        Box::new(AccuracyMetric),
    )
    .unwrap();

    // A plain file where the first checkpoint directory should go
    let output_dir = &fixture.config.checkpointing.output_dir;
    std::fs::write(output_dir.join("checkpoint-0"), b"occupied").unwrap();

    let err = trainer.train().unwrap_err();
    assert!(matches!(err, Error::EpochAborted { epoch: 0, phase: "checkpointing", .. }));
    assert!(matches!(err.root(), Error::Io(_)));
    assert!(matches!(trainer.state().phase, TrainingPhase::Failed { .. }));
}

#[test]
fn test_missing_designated_metric_aborts_run() {
    let fixture = TrainingTestFixture::new(2, 4);
    let mut engine = MockMetricEngine::new();
    engine.expect_compute().returning(|_, _| {
        let mut record = MetricRecord::new();
        record.insert("f1_macro", 0.5);
        Ok(record)
    });

    let mut trainer = trainer(
        fixture.config.clone(),
        DistillationConfig::distillation(0.5, 2.0),
        classifier("student", 8, 1),
        teacher(),
        Box::new(engine),
    )
    .unwrap();

    let err = trainer.train().unwrap_err();
    assert_eq!(err.epoch(), Some(0));
    assert!(matches!(err.root(), Error::Evaluation(msg) if msg.contains("accuracy")));
}

#[test]
fn test_logit_shape_mismatch_aborts_at_first_batch() {
    let fixture = TrainingTestFixture::new(2, 4);
    let lying_teacher: Box<dyn SequenceClassifier> = Box::new(FixedLogitsClassifier::zeros("teacher", 3));
    let mut trainer = trainer(
        fixture.config.clone(),
        DistillationConfig::distillation(0.5, 2.0),
        classifier("student", 8, 1),
        Some(lying_teacher),
        Box::new(AccuracyMetric),
    )
    .unwrap();

    let err = trainer.train().unwrap_err();
    assert!(matches!(err, Error::Aborted { epoch: 0, step: 0, .. }));
    assert!(matches!(err.root(), Error::ShapeMismatch { .. }));
    assert!(fixture.checkpoint_dirs().is_empty());
}

#[test]
fn test_label_mapping_mismatch_is_rejected() {
    let fixture = TrainingTestFixture::new(1, 4);
    let mut config = super::fixtures::classifier_config("teacher", 16);
    config.id2label.reverse();
    let reversed = MeanPoolClassifier::new_seeded(config, &candle_core::Device::Cpu, candle_core::DType::F32, 0).unwrap();

    let result = trainer(
        fixture.config.clone(),
        DistillationConfig::distillation(0.5, 2.0),
        classifier("student", 8, 1),
        Some(Box::new(reversed)),
        Box::new(AccuracyMetric),
    );
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[test]
fn test_distillation_without_teacher_is_rejected() {
    let fixture = TrainingTestFixture::new(1, 4);
    let result = trainer(
        fixture.config.clone(),
        DistillationConfig::distillation(0.5, 2.0),
        classifier("student", 8, 1),
        None,
        Box::new(AccuracyMetric),
    );
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[test]
fn test_events_follow_phase_order() {
    let fixture = TrainingTestFixture::new(2, 4);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = trainer(
        fixture.config.clone(),
        DistillationConfig::distillation(0.5, 2.0),
        classifier("student", 8, 1),
        teacher(),
        Box::new(AccuracyMetric),
    )
    .unwrap()
    .with_event_monitoring(tx);

    trainer.train().unwrap();

    let mut phases = Vec::new();
    let mut steps = 0;
    let mut restored = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            TrainingEvent::PhaseChanged { phase } => phases.push(phase),
            TrainingEvent::StepCompleted { .. } => steps += 1,
            TrainingEvent::BestModelRestored { .. } => restored = true,
            _ => {}
        }
    }

    use TrainingPhase::*;
    assert_eq!(
        phases,
        vec![Training, Evaluating, Checkpointing, Training, Evaluating, Checkpointing, Completed]
    );
    assert_eq!(steps, 4);
    assert!(restored);
}

#[test]
fn test_evaluation_does_not_mutate_student() {
    let fixture = TrainingTestFixture::new(1, 4);
    let trainer = trainer(
        fixture.config.clone(),
        DistillationConfig::distillation(0.5, 2.0),
        classifier("student", 8, 1),
        teacher(),
        Box::new(AccuracyMetric),
    )
    .unwrap();

    let before = snapshot(trainer.student().varmap());
    let held_out = loader(separable_examples(6), 4, false);
    let record = trainer.evaluate_split(&held_out).unwrap();
    assert!(record.get("eval_loss").is_some());
    assert_eq!(snapshot(trainer.student().varmap()), before);
}
