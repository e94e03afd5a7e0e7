//! GRADEBOOK Test Utilities
//!
//! Shared test infrastructure for the gradebook workspace:
//! - Proptest generators for grades and records
//! - A seeded in-memory ledger
//! - A cache backend that fails on demand
//! - A ledger that pauses inside aggregate scans
//! - Assertions on `GradebookResult`

pub use gradebook_core::{
    GradeRecord, GradeStatus, GradebookError, GradebookResult, Semester, SemesterId, StudentId,
    Subject, SubjectCode, Term,
};
pub use gradebook_storage::InMemoryLedger;

use async_trait::async_trait;
use gradebook_core::{CacheError, GradeUpdates, StatusFilter};
use gradebook_storage::{
    CacheBackend, CacheStats, CachedPayload, DependencyTag, Fingerprint, GradeLedger,
    InMemoryCacheBackend, PutOutcome, Watermark,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::Notify;

// ============================================================================
// MOCK CACHE BACKEND
// ============================================================================

/// In-memory cache backend whose invalidations fail on demand.
///
/// Reads and puts always reach the inner backend.
#[derive(Debug, Default)]
pub struct FlakyCacheBackend {
    inner: InMemoryCacheBackend,
    failures_left: AtomicU32,
    failed_calls: AtomicU32,
}

impl FlakyCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` invalidating calls fail.
    pub fn fail_next_invalidations(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Invalidating calls that failed so far.
    pub fn failed_calls(&self) -> u32 {
        self.failed_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryCacheBackend {
        &self.inner
    }

    fn maybe_fail(&self) -> GradebookResult<()> {
        let armed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            return Err(CacheError::Backend {
                reason: "injected invalidation failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for FlakyCacheBackend {
    async fn get(&self, fingerprint: &Fingerprint) -> GradebookResult<Option<CachedPayload>> {
        self.inner.get(fingerprint).await
    }

    async fn put(
        &self,
        fingerprint: Fingerprint,
        payload: CachedPayload,
        observed: Watermark,
    ) -> GradebookResult<PutOutcome> {
        self.inner.put(fingerprint, payload, observed).await
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> GradebookResult<bool> {
        self.maybe_fail()?;
        self.inner.invalidate(fingerprint).await
    }

    async fn invalidate_tags(&self, tags: &[DependencyTag]) -> GradebookResult<u64> {
        self.maybe_fail()?;
        self.inner.invalidate_tags(tags).await
    }

    async fn invalidate_endpoint(&self, endpoint: &str) -> GradebookResult<u64> {
        self.maybe_fail()?;
        self.inner.invalidate_endpoint(endpoint).await
    }

    async fn invalidate_all(&self) -> GradebookResult<u64> {
        self.maybe_fail()?;
        self.inner.invalidate_all().await
    }

    async fn current_watermark(&self) -> GradebookResult<Watermark> {
        self.inner.current_watermark().await
    }

    async fn stats(&self) -> GradebookResult<CacheStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// GATED LEDGER
// ============================================================================

/// In-memory ledger that can hold one scan open after it has read.
///
/// Arm a gate, start a writer, [`wait_paused`](Self::wait_paused) until the
/// writer sits on its snapshot, act, then [`resume`](Self::resume). Each
/// gate fires once.
#[derive(Debug, Default)]
pub struct GatedLedger {
    inner: InMemoryLedger,
    class_scan_gate: AtomicBool,
    student_scan_gate: AtomicBool,
    paused: Notify,
    resumed: Notify,
}

impl GatedLedger {
    pub fn new(inner: InMemoryLedger) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Pause the next `find_by_subject_and_semester` after it has read.
    pub fn gate_next_class_scan(&self) {
        self.class_scan_gate.store(true, Ordering::SeqCst);
    }

    /// Pause the next `find_by_student` after it has read.
    pub fn gate_next_student_scan(&self) {
        self.student_scan_gate.store(true, Ordering::SeqCst);
    }

    /// Wait until a gated scan holds its snapshot.
    pub async fn wait_paused(&self) {
        self.paused.notified().await;
    }

    /// Let the paused scan return.
    pub fn resume(&self) {
        self.resumed.notify_one();
    }

    pub fn inner(&self) -> &InMemoryLedger {
        &self.inner
    }

    async fn pause_if_gated(&self, gate: &AtomicBool) {
        if gate.swap(false, Ordering::SeqCst) {
            self.paused.notify_one();
            self.resumed.notified().await;
        }
    }
}

#[async_trait]
impl GradeLedger for GatedLedger {
    async fn get(
        &self,
        student_id: StudentId,
        semester_id: SemesterId,
    ) -> GradebookResult<Option<GradeRecord>> {
        self.inner.get(student_id, semester_id).await
    }

    async fn insert(&self, record: GradeRecord) -> GradebookResult<()> {
        self.inner.insert(record).await
    }

    async fn replace_grades(
        &self,
        student_id: StudentId,
        semester_id: SemesterId,
        updates: &GradeUpdates,
    ) -> GradebookResult<usize> {
        self.inner
            .replace_grades(student_id, semester_id, updates)
            .await
    }

    async fn find_by_subject_and_semester(
        &self,
        subject_code: &SubjectCode,
        semester_id: SemesterId,
        filter: StatusFilter,
    ) -> GradebookResult<Vec<GradeRecord>> {
        let records = self
            .inner
            .find_by_subject_and_semester(subject_code, semester_id, filter)
            .await?;
        self.pause_if_gated(&self.class_scan_gate).await;
        Ok(records)
    }

    async fn find_by_student(&self, student_id: StudentId) -> GradebookResult<Vec<GradeRecord>> {
        let records = self.inner.find_by_student(student_id).await?;
        self.pause_if_gated(&self.student_scan_gate).await;
        Ok(records)
    }

    async fn find_by_semester(
        &self,
        semester_id: SemesterId,
        filter: StatusFilter,
    ) -> GradebookResult<Vec<GradeRecord>> {
        self.inner.find_by_semester(semester_id, filter).await
    }

    async fn list_students(&self) -> GradebookResult<Vec<StudentId>> {
        self.inner.list_students().await
    }

    async fn subject(&self, code: &SubjectCode) -> GradebookResult<Option<Subject>> {
        self.inner.subject(code).await
    }

    async fn semester(&self, semester_id: SemesterId) -> GradebookResult<Option<Semester>> {
        self.inner.semester(semester_id).await
    }

    async fn semesters(&self) -> GradebookResult<Vec<Semester>> {
        self.inner.semesters().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for gradebook entity types.

    use super::*;
    use gradebook_core::{Grade, GradeEntry};
    use proptest::prelude::*;
    use proptest::sample::subsequence;

    /// Subject codes drawn by the record generators.
    pub const SUBJECT_POOL: [&str; 8] = [
        "MATH101", "MATH102", "ENG101", "ENG102", "SCI101", "SCI102", "HIST101", "PE101",
    ];

    /// A raw grade inside `[0, 100]`.
    pub fn arb_grade_value() -> impl Strategy<Value = i64> {
        0i64..=100
    }

    /// A raw grade outside `[0, 100]`.
    pub fn arb_invalid_grade_value() -> impl Strategy<Value = i64> {
        prop_oneof![i64::MIN..0i64, 101i64..=i64::MAX]
    }

    pub fn arb_grade() -> impl Strategy<Value = Grade> {
        (0u8..=100).prop_map(|v| Grade::new(i64::from(v)).expect("in range"))
    }

    pub fn arb_units() -> impl Strategy<Value = u8> {
        1u8..=5
    }

    pub fn arb_student_id() -> impl Strategy<Value = StudentId> {
        (1u32..=500).prop_map(StudentId)
    }

    pub fn arb_semester_id() -> impl Strategy<Value = SemesterId> {
        (1u32..=6).prop_map(SemesterId)
    }

    pub fn arb_grade_status() -> impl Strategy<Value = GradeStatus> {
        prop_oneof![
            Just(GradeStatus::Pending),
            Just(GradeStatus::Finalized),
            Just(GradeStatus::Appealed),
        ]
    }

    /// One to eight entries with distinct subject codes.
    pub fn arb_grade_entries() -> impl Strategy<Value = Vec<GradeEntry>> {
        subsequence(SUBJECT_POOL.to_vec(), 1..=SUBJECT_POOL.len()).prop_flat_map(|codes| {
            let n = codes.len();
            (
                Just(codes),
                proptest::collection::vec(arb_grade(), n),
                proptest::collection::vec(arb_units(), n),
            )
                .prop_map(|(codes, grades, units)| {
                    codes
                        .into_iter()
                        .zip(grades)
                        .zip(units)
                        .map(|((code, grade), units)| GradeEntry {
                            subject_code: SubjectCode::from(code),
                            grade,
                            units,
                        })
                        .collect()
                })
        })
    }

    pub fn arb_grade_record() -> impl Strategy<Value = GradeRecord> {
        (
            arb_student_id(),
            arb_semester_id(),
            arb_grade_entries(),
            arb_grade_status(),
        )
            .prop_map(|(student_id, semester_id, entries, status)| {
                GradeRecord::new(student_id, semester_id, entries, status).expect("valid entries")
            })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built ledger contents for common scenarios.
    //!
    //! Catalog: semesters 1 and 2 are the first and second semesters of
    //! SY 2023, semester 3 is the first semester of SY 2024.
    //!
    //! | student | semester | status    | grades (units)                           |
    //! |---------|----------|-----------|------------------------------------------|
    //! | 1       | 1        | finalized | MATH101 78 (3), ENG101 90 (3), SCI101 70 (2) |
    //! | 1       | 2        | finalized | MATH102 85 (3), ENG102 88 (3)            |
    //! | 2       | 1        | finalized | MATH101 95 (3), ENG101 97 (3), SCI101 92 (2) |
    //! | 2       | 2        | finalized | MATH102 72 (3), ENG102 91 (3)            |
    //! | 3       | 1        | finalized | MATH101 60 (3), ENG101 74 (3), SCI101 80 (2) |
    //! | 4       | 1        | pending   | MATH101 88 (3), ENG101 70 (3), SCI101 82 (2) |

    use super::*;

    /// Build a record from `(code, grade, units)` triples.
    pub fn grade_record(
        student_id: u32,
        semester_id: u32,
        lines: &[(&str, i64, i64)],
        status: GradeStatus,
    ) -> GradeRecord {
        GradeRecord::from_parallel(
            StudentId(student_id),
            SemesterId(semester_id),
            lines.iter().map(|(code, _, _)| SubjectCode::from(*code)).collect(),
            lines.iter().map(|(_, grade, _)| *grade).collect(),
            lines.iter().map(|(_, _, units)| *units).collect(),
            status,
        )
        .expect("fixture record must be valid")
    }

    pub fn subjects() -> Vec<Subject> {
        [
            ("MATH101", "College Algebra", 3),
            ("MATH102", "Trigonometry", 3),
            ("ENG101", "Purposive Communication", 3),
            ("ENG102", "Technical Writing", 3),
            ("SCI101", "General Chemistry", 2),
        ]
        .into_iter()
        .map(|(code, description, units)| Subject {
            code: SubjectCode::from(code),
            description: description.to_string(),
            units,
        })
        .collect()
    }

    pub fn semesters() -> Vec<Semester> {
        vec![
            Semester {
                semester_id: SemesterId(1),
                term: Term::First,
                school_year: 2023,
            },
            Semester {
                semester_id: SemesterId(2),
                term: Term::Second,
                school_year: 2023,
            },
            Semester {
                semester_id: SemesterId(3),
                term: Term::First,
                school_year: 2024,
            },
        ]
    }

    pub fn records() -> Vec<GradeRecord> {
        use GradeStatus::*;
        type Line = (&'static str, i64, i64);
        let first = |math, eng, sci| -> [Line; 3] {
            [("MATH101", math, 3), ("ENG101", eng, 3), ("SCI101", sci, 2)]
        };
        let second = |math, eng| -> [Line; 2] { [("MATH102", math, 3), ("ENG102", eng, 3)] };
        vec![
            grade_record(1, 1, &first(78, 90, 70), Finalized),
            grade_record(1, 2, &second(85, 88), Finalized),
            grade_record(2, 1, &first(95, 97, 92), Finalized),
            grade_record(2, 2, &second(72, 91), Finalized),
            grade_record(3, 1, &first(60, 74, 80), Finalized),
            grade_record(4, 1, &first(88, 70, 82), Pending),
        ]
    }

    /// Ledger holding the catalogs and records above.
    pub async fn seeded_ledger() -> InMemoryLedger {
        use gradebook_storage::GradeLedger;

        let ledger = InMemoryLedger::new();
        for subject in subjects() {
            ledger.put_subject(subject).await;
        }
        for semester in semesters() {
            ledger.put_semester(semester).await;
        }
        for record in records() {
            ledger
                .insert(record)
                .await
                .expect("fixture keys are unique");
        }
        ledger
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on gradebook results.

    use super::*;

    /// Assert that a GradebookResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &GradebookResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a GradebookResult is Err.
    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &GradebookResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert that a GradebookResult failed with the given error code.
    #[track_caller]
    pub fn assert_err_code<T: std::fmt::Debug>(result: &GradebookResult<T>, code: &str) {
        match result {
            Err(e) => assert_eq!(e.code(), code, "Wrong error code for {:?}", e),
            other => panic!("Expected {} error, got: {:?}", code, other),
        }
    }

    /// Assert that a GradebookResult is a ledger not-found error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &GradebookResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("Expected not-found error, got: {:?}", other),
        }
    }

    /// Assert two averages agree to two decimal places.
    #[track_caller]
    pub fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 0.005,
            "Expected {:.2}, got {:.4}",
            expected,
            actual
        );
    }
}

#[cfg(test)]
mod tests {
    use super::assertions::*;
    use super::fixtures::*;
    use super::generators::*;
    use super::*;
    use gradebook_storage::GradeLedger;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_seeded_ledger_contents() {
        let ledger = seeded_ledger().await;
        assert_eq!(ledger.record_count().await, 6);
        assert_eq!(ledger.semesters().await.unwrap().len(), 3);
        let record = ledger.get(StudentId(1), SemesterId(1)).await.unwrap().unwrap();
        assert_eq!(record.grade_of(&SubjectCode::from("MATH101")).unwrap().value(), 78);
    }

    #[tokio::test]
    async fn test_flaky_backend_fails_requested_times() {
        let backend = FlakyCacheBackend::new();
        backend.fail_next_invalidations(2);
        assert_err_code(&backend.invalidate_all().await, "CACHE_ERROR");
        assert_err(&backend.invalidate_tags(&[DependencyTag::AnyGrade]).await);
        assert_ok(&backend.invalidate_all().await);
        assert_eq!(backend.failed_calls(), 2);
    }

    #[tokio::test]
    async fn test_gated_ledger_pauses_one_scan() {
        let ledger = std::sync::Arc::new(GatedLedger::new(seeded_ledger().await));
        ledger.gate_next_student_scan();
        let scan = {
            let ledger = std::sync::Arc::clone(&ledger);
            tokio::spawn(async move { ledger.find_by_student(StudentId(1)).await })
        };

        ledger.wait_paused().await;
        assert!(!scan.is_finished());
        ledger.resume();
        assert_eq!(scan.await.unwrap().unwrap().len(), 2);

        // The gate fires once.
        assert_eq!(ledger.find_by_student(StudentId(1)).await.unwrap().len(), 2);
    }

    proptest! {
        #[test]
        fn prop_generated_records_are_valid(record in arb_grade_record()) {
            prop_assert!(!record.entries().is_empty());
            prop_assert!(record.entries().iter().all(|e| e.units > 0 && e.grade.value() <= 100));
        }

        #[test]
        fn prop_invalid_grades_are_rejected(value in arb_invalid_grade_value()) {
            prop_assert!(gradebook_core::Grade::new(value).is_err());
        }
    }
}
