//! Integration tests for single grade changes: ledger write, aggregate
//! refresh and cache invalidation as one unit of work.

use gradebook_core::{
    AcademicStanding, EngineConfig, InvalidationPolicy, SemesterId, StudentId, SubjectCode,
};
use gradebook_storage::{AggregateStore, GradeLedger};
use gradebook_test_utils::assertions::{assert_close, assert_err_code};
use gradebook_test_utils::fixtures::seeded_ledger;
use gradebook_test_utils::{FlakyCacheBackend, GatedLedger};
use std::sync::Arc;
use std::time::Duration;

#[path = "support/engine.rs"]
mod engine_support;
use engine_support::{engine_over_ledger, seeded_engine, seeded_engine_with_cache};

fn math101() -> SubjectCode {
    SubjectCode::from("MATH101")
}

#[tokio::test]
async fn test_grade_change_refreshes_cached_performance_report() {
    let engine = seeded_engine(EngineConfig::default()).await;
    let reports = engine.reports();

    let before = reports.student_performance(StudentId(1), None).await.unwrap();
    assert!(before.was_cache_miss());
    assert_eq!(before.value().weighted_average, 80.5);
    assert!(reports
        .student_performance(StudentId(1), None)
        .await
        .unwrap()
        .was_cache_hit());

    let result = engine
        .gateway()
        .apply_grade_change(StudentId(1), SemesterId(1), math101(), 85)
        .await
        .unwrap();
    assert_eq!(result.new_grade, 85);
    assert!(result.modified);
    assert_eq!(result.weighted_average, 83.13);
    assert_eq!(result.gpa, 2.50);
    assert_eq!(result.academic_standing, AcademicStanding::Warning);
    let invalidation = result.invalidation.unwrap();
    assert!(invalidation.succeeded());
    assert!(invalidation.removed >= 1);

    let after = reports.student_performance(StudentId(1), None).await.unwrap();
    assert!(after.was_cache_miss());
    let report = after.into_value();
    let math = report
        .subjects
        .iter()
        .find(|s| s.subject_code == math101())
        .unwrap();
    assert_eq!(math.grade, 85);
    assert_eq!(math.class_average, Some(80.0));
    assert_eq!(report.weighted_average, 83.13);
    assert_eq!(report.gpa, 2.50);
}

#[tokio::test]
async fn test_out_of_range_grade_is_rejected_before_any_write() {
    let engine = seeded_engine(EngineConfig::default()).await;
    let ctx = engine.context();
    let before = ctx.ledger().get(StudentId(1), SemesterId(1)).await.unwrap();

    for value in [150, -1, 101] {
        let result = engine
            .gateway()
            .apply_grade_change(StudentId(1), SemesterId(1), math101(), value)
            .await;
        assert_err_code(&result, "INVALID_GRADE");
    }

    let after = ctx.ledger().get(StudentId(1), SemesterId(1)).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_unknown_record_and_subject_surface_not_found() {
    let engine = seeded_engine(EngineConfig::default()).await;
    let gateway = engine.gateway();

    let missing_student = gateway
        .apply_grade_change(StudentId(99), SemesterId(1), math101(), 80)
        .await;
    assert_err_code(&missing_student, "STUDENT_NOT_FOUND");

    let missing_subject = gateway
        .apply_grade_change(StudentId(1), SemesterId(1), SubjectCode::from("ART999"), 80)
        .await;
    assert_err_code(&missing_subject, "SUBJECT_NOT_FOUND");
}

#[tokio::test]
async fn test_unchanged_grade_still_succeeds() {
    let engine = seeded_engine(EngineConfig::default()).await;
    let result = engine
        .gateway()
        .apply_grade_change(StudentId(1), SemesterId(1), math101(), 78)
        .await
        .unwrap();
    assert!(!result.modified);
    assert_eq!(result.weighted_average, 80.5);
    assert_eq!(result.gpa, 2.25);
}

#[tokio::test]
async fn test_class_and_semester_aggregates_follow_the_change() {
    let engine = seeded_engine(EngineConfig::default()).await;
    engine
        .gateway()
        .apply_grade_change(StudentId(3), SemesterId(1), math101(), 90)
        .await
        .unwrap();

    let aggregates = engine.context().aggregates();
    let class = aggregates
        .class_average(&math101(), SemesterId(1))
        .await
        .unwrap()
        .unwrap();
    // 78, 95, 90 over finalized records; the pending record is excluded.
    assert_eq!(class.total_students(), 3);
    assert_close(class.statistics.average_grade, 87.67);
    assert_eq!(class.statistics.passing_rate, 100.0);

    let metrics = aggregates.semester_metrics(SemesterId(1)).await.unwrap().unwrap();
    assert_eq!(metrics.statistics.count, 9);
    assert_eq!(metrics.statistics.top_grade, 97);

    let rollup = aggregates.student_gpa(StudentId(3), None).await.unwrap().unwrap();
    assert_close(rollup.weighted_average, 81.5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_edits_to_one_record_are_both_kept() {
    let engine = seeded_engine(EngineConfig::default()).await;

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .gateway()
                .apply_grade_change(StudentId(1), SemesterId(1), math101(), 85)
                .await
        })
    };
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .gateway()
                .apply_grade_change(StudentId(1), SemesterId(1), SubjectCode::from("ENG101"), 95)
                .await
        })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let ctx = engine.context();
    let record = ctx.ledger().get(StudentId(1), SemesterId(1)).await.unwrap().unwrap();
    assert_eq!(record.grade_of(&math101()).unwrap().value(), 85);
    assert_eq!(record.grade_of(&SubjectCode::from("ENG101")).unwrap().value(), 95);

    // (85*3 + 95*3 + 70*2) / 8
    let gpa = ctx
        .aggregates()
        .student_gpa(StudentId(1), Some(SemesterId(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(gpa.weighted_average, 85.0);
    assert_eq!(gpa.gpa, 2.00);
    assert!(ctx.record_locks().is_empty());
}

/// Block until the ledger holds `grade` for the subject of one record.
async fn committed(ledger: &GatedLedger, student: u32, semester: u32, code: &str, grade: u8) {
    let key = (StudentId(student), SemesterId(semester));
    let code = SubjectCode::from(code);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let record = ledger.get(key.0, key.1).await.unwrap().unwrap();
            if record.grade_of(&code).map(|g| g.value()) == Some(grade) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second write committed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writers_on_one_class_leave_latest_class_average() {
    let ledger = Arc::new(GatedLedger::new(seeded_ledger().await));
    let engine = engine_over_ledger(EngineConfig::default(), ledger.clone()).await;

    // The first writer stops right after reading its class snapshot.
    ledger.gate_next_class_scan();
    let first = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .gateway()
                .apply_grade_change(StudentId(1), SemesterId(1), math101(), 85)
                .await
        })
    };
    ledger.wait_paused().await;

    let second = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .gateway()
                .apply_grade_change(StudentId(2), SemesterId(1), math101(), 60)
                .await
        })
    };
    committed(&ledger, 2, 1, "MATH101", 60).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    ledger.resume();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let aggregates = engine.context().aggregates();
    let class = aggregates
        .class_average(&math101(), SemesterId(1))
        .await
        .unwrap()
        .unwrap();
    // 85, 60, 60
    assert_close(class.statistics.average_grade, 68.33);
    assert_eq!(class.statistics.top_grade, 85);

    let metrics = aggregates.semester_metrics(SemesterId(1)).await.unwrap().unwrap();
    assert_close(metrics.statistics.average_grade, 78.67);
    assert!(engine.context().aggregate_locks().classes.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writers_on_two_semesters_leave_latest_rollup() {
    let ledger = Arc::new(GatedLedger::new(seeded_ledger().await));
    let engine = engine_over_ledger(EngineConfig::default(), ledger.clone()).await;

    // The first writer stops right after reading the student's records.
    ledger.gate_next_student_scan();
    let first = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .gateway()
                .apply_grade_change(StudentId(1), SemesterId(1), math101(), 85)
                .await
        })
    };
    ledger.wait_paused().await;

    let second = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .gateway()
                .apply_grade_change(StudentId(1), SemesterId(2), SubjectCode::from("MATH102"), 60)
                .await
        })
    };
    committed(&ledger, 1, 2, "MATH102", 60).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    ledger.resume();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    // Mean of 83.125 (semester 1) and 74.0 (semester 2).
    let rollup = engine
        .context()
        .aggregates()
        .student_gpa(StudentId(1), None)
        .await
        .unwrap()
        .unwrap();
    assert_close(rollup.weighted_average, 78.56);
    assert!(engine.context().aggregate_locks().rollups.is_empty());
}

#[tokio::test]
async fn test_dependency_policy_keeps_unrelated_reports() {
    let engine = seeded_engine(EngineConfig::default()).await;
    let reports = engine.reports();
    reports.student_performance(StudentId(2), Some(SemesterId(2))).await.unwrap();
    reports.student_performance(StudentId(1), Some(SemesterId(1))).await.unwrap();

    engine
        .gateway()
        .apply_grade_change(StudentId(1), SemesterId(1), math101(), 85)
        .await
        .unwrap();

    assert!(reports
        .student_performance(StudentId(2), Some(SemesterId(2)))
        .await
        .unwrap()
        .was_cache_hit());
    assert!(reports
        .student_performance(StudentId(1), Some(SemesterId(1)))
        .await
        .unwrap()
        .was_cache_miss());
}

#[tokio::test]
async fn test_flush_policy_drops_every_report() {
    let config = EngineConfig::default().with_invalidation_policy(InvalidationPolicy::FlushAll);
    let engine = seeded_engine(config).await;
    let reports = engine.reports();
    reports.student_performance(StudentId(2), Some(SemesterId(2))).await.unwrap();

    let result = engine
        .gateway()
        .apply_grade_change(StudentId(1), SemesterId(1), math101(), 85)
        .await
        .unwrap();
    assert_eq!(
        result.invalidation.unwrap().policy,
        InvalidationPolicy::FlushAll
    );

    assert!(reports
        .student_performance(StudentId(2), Some(SemesterId(2)))
        .await
        .unwrap()
        .was_cache_miss());
}

#[tokio::test]
async fn test_invalidation_failure_is_reported_not_raised() {
    let backend = Arc::new(FlakyCacheBackend::new());
    let engine = seeded_engine_with_cache(EngineConfig::default(), backend.clone()).await;
    backend.fail_next_invalidations(10);

    let result = engine
        .gateway()
        .apply_grade_change(StudentId(1), SemesterId(1), math101(), 85)
        .await
        .unwrap();
    assert_eq!(result.gpa, 2.50);

    let invalidation = result.invalidation.unwrap();
    let failure = invalidation.failure.unwrap();
    // One attempt plus the default two retries.
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.code, "CACHE_ERROR");
    assert_eq!(backend.failed_calls(), 3);

    // The ledger write and aggregates are committed regardless.
    let record = engine
        .context()
        .ledger()
        .get(StudentId(1), SemesterId(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.grade_of(&math101()).unwrap().value(), 85);
}

#[tokio::test]
async fn test_transient_invalidation_failure_is_retried() {
    let backend = Arc::new(FlakyCacheBackend::new());
    let engine = seeded_engine_with_cache(EngineConfig::default(), backend.clone()).await;
    backend.fail_next_invalidations(1);

    let result = engine
        .gateway()
        .apply_grade_change(StudentId(1), SemesterId(1), math101(), 85)
        .await
        .unwrap();
    let invalidation = result.invalidation.unwrap();
    assert!(invalidation.succeeded());
    assert_eq!(invalidation.attempts, 2);
}

#[tokio::test]
async fn test_result_serializes_as_structured_payload() {
    let engine = seeded_engine(EngineConfig::default()).await;
    let result = engine
        .gateway()
        .apply_grade_change(StudentId(1), SemesterId(1), math101(), 85)
        .await
        .unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["student_id"], 1);
    assert_eq!(json["subject_code"], "MATH101");
    assert_eq!(json["academic_standing"], "warning");
    assert_eq!(json["invalidation"]["policy"], "dependency_index");
}
