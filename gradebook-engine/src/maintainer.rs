//! Aggregate maintainer: recomputes derived tables from the ledger.
//!
//! Every recompute is a pure function of the ledger's current contents.
//! When the freshly computed aggregate has the same content as the stored
//! one, nothing is written, so the stored row (timestamp included) stays
//! byte-identical across repeated runs.
//!
//! Rollup, class and semester recomputes hold that aggregate's lock from
//! the ledger read to the upsert. Semester-level student aggregates rely on
//! the caller holding the record lock.

use chrono::Utc;
use gradebook_core::{
    standing_for_average, weighted_average, Aggregate, ClassAverage, GpaScale, GradeRecord,
    GradeStatistics, GradebookResult, SemesterId, SemesterMetrics, StatusFilter, StudentAverage,
    StudentGpa, StudentId, SubjectCode,
};
use gradebook_storage::{AggregateStore, GradeLedger};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::context::EngineContext;

/// Why a recompute had nothing to compute from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoRecord,
    NoFinalizedGrades,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoRecord => f.write_str("no grade record"),
            SkipReason::NoFinalizedGrades => f.write_str("no finalized grades"),
        }
    }
}

/// Result of one recompute. `Skipped` is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum RecomputeOutcome {
    Updated,
    Unchanged,
    Skipped(SkipReason),
}

impl RecomputeOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, RecomputeOutcome::Skipped(_))
    }

    fn merge(self, other: RecomputeOutcome) -> RecomputeOutcome {
        match (self, other) {
            (RecomputeOutcome::Updated, _) | (_, RecomputeOutcome::Updated) => {
                RecomputeOutcome::Updated
            }
            (RecomputeOutcome::Skipped(reason), RecomputeOutcome::Skipped(_)) => {
                RecomputeOutcome::Skipped(reason)
            }
            _ => RecomputeOutcome::Unchanged,
        }
    }
}

/// Counts of a full rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildSummary {
    pub student_records: u32,
    pub students: u32,
    pub classes: u32,
    pub semesters: u32,
    pub skipped: u32,
}

// ============================================================================
// PURE COMPUTATIONS
// ============================================================================

/// Semester-level average and GPA of one record.
pub fn student_aggregates(record: &GradeRecord, scale: GpaScale) -> (StudentAverage, StudentGpa) {
    let now = Utc::now();
    let avg = weighted_average(record.entries());
    let average = StudentAverage {
        student_id: record.student_id,
        semester_id: Some(record.semester_id),
        weighted_average: avg.value,
        total_units: avg.total_units,
        subjects_taken: avg.subjects,
        updated_at: now,
    };
    let gpa = gpa_for(record.student_id, Some(record.semester_id), avg.value, scale);
    (average, gpa)
}

/// Student rollup over all of a student's records: the mean of the
/// semester averages, with units and subjects summed. `None` without records.
pub fn rollup_aggregates(
    student_id: StudentId,
    records: &[GradeRecord],
    scale: GpaScale,
) -> Option<(StudentAverage, StudentGpa)> {
    if records.is_empty() {
        return None;
    }

    let mut sum = 0.0;
    let mut total_units = 0;
    let mut subjects_taken = 0;
    for record in records {
        let avg = weighted_average(record.entries());
        sum += avg.value;
        total_units += avg.total_units;
        subjects_taken += avg.subjects;
    }
    let mean = sum / records.len() as f64;

    let average = StudentAverage {
        student_id,
        semester_id: None,
        weighted_average: mean,
        total_units,
        subjects_taken,
        updated_at: Utc::now(),
    };
    let gpa = gpa_for(student_id, None, mean, scale);
    Some((average, gpa))
}

fn gpa_for(
    student_id: StudentId,
    semester_id: Option<SemesterId>,
    weighted_average: f64,
    scale: GpaScale,
) -> StudentGpa {
    StudentGpa {
        student_id,
        semester_id,
        weighted_average,
        gpa: scale.gpa_of(weighted_average),
        academic_standing: standing_for_average(scale, weighted_average),
        updated_at: Utc::now(),
    }
}

/// Statistics of one subject over the given records.
pub fn class_statistics(
    records: &[GradeRecord],
    subject_code: &SubjectCode,
) -> Option<GradeStatistics> {
    GradeStatistics::from_grades(records.iter().filter_map(|r| r.grade_of(subject_code)))
}

/// Statistics over every grade of the given records.
pub fn semester_statistics(records: &[GradeRecord]) -> Option<GradeStatistics> {
    GradeStatistics::from_grades(
        records
            .iter()
            .flat_map(|r| r.entries().iter().map(|e| e.grade)),
    )
}

/// Write `fresh` only if its content differs from `stored`.
async fn upsert_if_changed<T, W>(
    stored: Option<T>,
    fresh: T,
    write: W,
) -> GradebookResult<RecomputeOutcome>
where
    T: Aggregate,
    W: std::future::Future<Output = GradebookResult<()>>,
{
    match stored {
        Some(existing) if existing.same_content(&fresh) => Ok(RecomputeOutcome::Unchanged),
        _ => {
            write.await?;
            Ok(RecomputeOutcome::Updated)
        }
    }
}

// ============================================================================
// MAINTAINER
// ============================================================================

/// Sole writer of the aggregate store.
#[derive(Debug, Clone)]
pub struct AggregateMaintainer {
    ctx: EngineContext,
}

impl AggregateMaintainer {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    fn scale(&self) -> GpaScale {
        self.ctx.config().gpa_scale
    }

    /// Refresh the semester average and GPA of one record, then the
    /// student's rollup.
    pub async fn recompute_student(
        &self,
        student_id: StudentId,
        semester_id: SemesterId,
    ) -> GradebookResult<RecomputeOutcome> {
        let Some(record) = self.ctx.ledger().get(student_id, semester_id).await? else {
            tracing::debug!(%student_id, %semester_id, "Student recompute skipped: no record");
            return Ok(RecomputeOutcome::Skipped(SkipReason::NoRecord));
        };

        let (average, gpa) = student_aggregates(&record, self.scale());
        let outcome = self.store_student(average, gpa).await?;
        let rollup = self.recompute_student_rollup(student_id).await?;
        let outcome = outcome.merge(rollup);

        tracing::debug!(%student_id, %semester_id, ?outcome, "Student aggregates recomputed");
        Ok(outcome)
    }

    /// Refresh the student-level rollup (`semester_id = None`).
    pub async fn recompute_student_rollup(
        &self,
        student_id: StudentId,
    ) -> GradebookResult<RecomputeOutcome> {
        let _guard = self.ctx.aggregate_locks().rollups.lock(student_id).await;
        let records = self.ctx.ledger().find_by_student(student_id).await?;
        match rollup_aggregates(student_id, &records, self.scale()) {
            Some((average, gpa)) => self.store_student(average, gpa).await,
            None => Ok(RecomputeOutcome::Skipped(SkipReason::NoRecord)),
        }
    }

    async fn store_student(
        &self,
        average: StudentAverage,
        gpa: StudentGpa,
    ) -> GradebookResult<RecomputeOutcome> {
        let aggregates = self.ctx.aggregates();
        let (student_id, semester_id) = (average.student_id, average.semester_id);

        let stored = aggregates.student_average(student_id, semester_id).await?;
        let avg_outcome =
            upsert_if_changed(stored, average.clone(), aggregates.upsert_student_average(average))
                .await?;

        let stored = aggregates.student_gpa(student_id, semester_id).await?;
        let gpa_outcome =
            upsert_if_changed(stored, gpa.clone(), aggregates.upsert_student_gpa(gpa)).await?;

        Ok(avg_outcome.merge(gpa_outcome))
    }

    /// Refresh class statistics of one subject in one semester.
    ///
    /// Without finalized grades the stored row is left as it is.
    pub async fn recompute_class(
        &self,
        subject_code: &SubjectCode,
        semester_id: SemesterId,
    ) -> GradebookResult<RecomputeOutcome> {
        let _guard = self
            .ctx
            .aggregate_locks()
            .classes
            .lock((subject_code.clone(), semester_id))
            .await;
        let records = self
            .ctx
            .ledger()
            .find_by_subject_and_semester(subject_code, semester_id, StatusFilter::finalized())
            .await?;
        let Some(statistics) = class_statistics(&records, subject_code) else {
            tracing::debug!(
                %subject_code,
                %semester_id,
                "Class recompute skipped: no finalized grades"
            );
            return Ok(RecomputeOutcome::Skipped(SkipReason::NoFinalizedGrades));
        };

        let subject_description = self
            .ctx
            .ledger()
            .subject(subject_code)
            .await?
            .map(|s| s.description)
            .unwrap_or_default();

        let fresh = ClassAverage {
            subject_code: subject_code.clone(),
            semester_id,
            subject_description,
            statistics,
            updated_at: Utc::now(),
        };
        let aggregates = self.ctx.aggregates();
        let stored = aggregates.class_average(subject_code, semester_id).await?;
        let outcome =
            upsert_if_changed(stored, fresh.clone(), aggregates.upsert_class_average(fresh)).await?;

        tracing::debug!(%subject_code, %semester_id, ?outcome, "Class average recomputed");
        Ok(outcome)
    }

    /// Refresh statistics over every finalized grade of a semester.
    pub async fn recompute_semester(
        &self,
        semester_id: SemesterId,
    ) -> GradebookResult<RecomputeOutcome> {
        let _guard = self.ctx.aggregate_locks().semesters.lock(semester_id).await;
        let records = self
            .ctx
            .ledger()
            .find_by_semester(semester_id, StatusFilter::finalized())
            .await?;
        let Some(statistics) = semester_statistics(&records) else {
            tracing::debug!(%semester_id, "Semester recompute skipped: no finalized grades");
            return Ok(RecomputeOutcome::Skipped(SkipReason::NoFinalizedGrades));
        };

        let fresh = SemesterMetrics {
            semester_id,
            statistics,
            updated_at: Utc::now(),
        };
        let aggregates = self.ctx.aggregates();
        let stored = aggregates.semester_metrics(semester_id).await?;
        upsert_if_changed(stored, fresh.clone(), aggregates.upsert_semester_metrics(fresh)).await
    }

    /// Recompute every aggregate the ledger can produce.
    pub async fn rebuild_all(&self) -> GradebookResult<RebuildSummary> {
        let ledger = self.ctx.ledger();
        let mut summary = RebuildSummary::default();

        for student_id in ledger.list_students().await? {
            summary.students += 1;
            for record in ledger.find_by_student(student_id).await? {
                let outcome = self.recompute_student(student_id, record.semester_id).await?;
                summary.student_records += 1;
                if outcome.is_skipped() {
                    summary.skipped += 1;
                }
            }
        }

        for semester in ledger.semesters().await? {
            let records = ledger
                .find_by_semester(semester.semester_id, StatusFilter::Any)
                .await?;
            let subjects: BTreeSet<SubjectCode> = records
                .iter()
                .flat_map(|r| r.entries().iter().map(|e| e.subject_code.clone()))
                .collect();
            for subject_code in &subjects {
                summary.classes += 1;
                if self.recompute_class(subject_code, semester.semester_id).await?.is_skipped() {
                    summary.skipped += 1;
                }
            }
            summary.semesters += 1;
            if self.recompute_semester(semester.semester_id).await?.is_skipped() {
                summary.skipped += 1;
            }
        }

        tracing::info!(
            students = summary.students,
            classes = summary.classes,
            semesters = summary.semesters,
            skipped = summary.skipped,
            "Aggregates rebuilt"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradebook_core::{EngineConfig, GradeStatus, Semester, Subject, Term};
    use gradebook_storage::{GradeLedger, InMemoryLedger};

    fn record(
        student: u32,
        semester: u32,
        lines: &[(&str, i64, i64)],
        status: GradeStatus,
    ) -> GradeRecord {
        GradeRecord::from_parallel(
            StudentId(student),
            SemesterId(semester),
            lines.iter().map(|(c, _, _)| SubjectCode::from(*c)).collect(),
            lines.iter().map(|(_, g, _)| *g).collect(),
            lines.iter().map(|(_, _, u)| *u).collect(),
            status,
        )
        .unwrap()
    }

    async fn setup() -> (EngineContext, InMemoryLedger) {
        let ledger = InMemoryLedger::new();
        ledger
            .put_subject(Subject {
                code: SubjectCode::from("A"),
                description: "Subject A".to_string(),
                units: 3,
            })
            .await;
        ledger
            .put_semester(Semester {
                semester_id: SemesterId(1),
                term: Term::First,
                school_year: 2023,
            })
            .await;
        ledger
            .insert(record(1, 1, &[("A", 70, 3), ("B", 90, 2)], GradeStatus::Finalized))
            .await
            .unwrap();
        ledger
            .insert(record(2, 1, &[("A", 95, 3)], GradeStatus::Finalized))
            .await
            .unwrap();
        ledger
            .insert(record(3, 1, &[("A", 60, 3)], GradeStatus::Pending))
            .await
            .unwrap();
        let ctx = EngineContext::in_memory(EngineConfig::default(), ledger.clone()).unwrap();
        (ctx, ledger)
    }

    #[tokio::test]
    async fn test_recompute_student_weighted_average() {
        let (ctx, _) = setup().await;
        let maintainer = AggregateMaintainer::new(ctx.clone());

        let outcome = maintainer
            .recompute_student(StudentId(1), SemesterId(1))
            .await
            .unwrap();
        assert_eq!(outcome, RecomputeOutcome::Updated);

        let gpa = ctx
            .aggregates()
            .student_gpa(StudentId(1), Some(SemesterId(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gpa.weighted_average, 78.0);
        assert_eq!(gpa.gpa, 2.50);

        let rollup = ctx
            .aggregates()
            .student_average(StudentId(1), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rollup.weighted_average, 78.0);
        assert_eq!(rollup.total_units, 5);
    }

    #[tokio::test]
    async fn test_recompute_student_is_idempotent() {
        let (ctx, _) = setup().await;
        let maintainer = AggregateMaintainer::new(ctx.clone());
        maintainer.recompute_student(StudentId(1), SemesterId(1)).await.unwrap();
        let first = serde_json::to_vec(
            &ctx.aggregates().student_gpa(StudentId(1), Some(SemesterId(1))).await.unwrap(),
        )
        .unwrap();

        let outcome = maintainer.recompute_student(StudentId(1), SemesterId(1)).await.unwrap();
        assert_eq!(outcome, RecomputeOutcome::Unchanged);
        let second = serde_json::to_vec(
            &ctx.aggregates().student_gpa(StudentId(1), Some(SemesterId(1))).await.unwrap(),
        )
        .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_recompute_student_without_record_is_skipped() {
        let (ctx, _) = setup().await;
        let maintainer = AggregateMaintainer::new(ctx.clone());
        let outcome = maintainer.recompute_student(StudentId(42), SemesterId(1)).await.unwrap();
        assert_eq!(outcome, RecomputeOutcome::Skipped(SkipReason::NoRecord));
        assert!(ctx
            .aggregates()
            .student_average(StudentId(42), Some(SemesterId(1)))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_recompute_class_counts_only_finalized() {
        let (ctx, _) = setup().await;
        let maintainer = AggregateMaintainer::new(ctx.clone());
        let a = SubjectCode::from("A");
        assert_eq!(
            maintainer.recompute_class(&a, SemesterId(1)).await.unwrap(),
            RecomputeOutcome::Updated
        );

        let class = ctx.aggregates().class_average(&a, SemesterId(1)).await.unwrap().unwrap();
        assert_eq!(class.total_students(), 2);
        assert_eq!(class.statistics.average_grade, 82.5);
        assert_eq!(class.statistics.passing_rate, 50.0);
        assert_eq!(class.statistics.at_risk_rate, 50.0);
        assert_eq!(class.statistics.top_grade, 95);
        assert_eq!(class.subject_description, "Subject A");
    }

    #[tokio::test]
    async fn test_recompute_class_without_finalized_is_skipped() {
        let (ctx, ledger) = setup().await;
        let maintainer = AggregateMaintainer::new(ctx.clone());
        ledger
            .insert(record(4, 2, &[("C", 88, 3)], GradeStatus::Appealed))
            .await
            .unwrap();
        let c = SubjectCode::from("C");
        assert_eq!(
            maintainer.recompute_class(&c, SemesterId(2)).await.unwrap(),
            RecomputeOutcome::Skipped(SkipReason::NoFinalizedGrades)
        );
        assert_eq!(ctx.aggregates().class_average(&c, SemesterId(2)).await.unwrap(), None);
        assert_eq!(
            maintainer.recompute_semester(SemesterId(2)).await.unwrap(),
            RecomputeOutcome::Skipped(SkipReason::NoFinalizedGrades)
        );
    }

    #[tokio::test]
    async fn test_class_description_empty_without_catalog_entry() {
        let (ctx, _) = setup().await;
        let maintainer = AggregateMaintainer::new(ctx.clone());
        let b = SubjectCode::from("B");
        maintainer.recompute_class(&b, SemesterId(1)).await.unwrap();
        let class = ctx.aggregates().class_average(&b, SemesterId(1)).await.unwrap().unwrap();
        assert_eq!(class.subject_description, "");
    }

    #[tokio::test]
    async fn test_recompute_semester_and_rebuild() {
        let (ctx, _) = setup().await;
        let maintainer = AggregateMaintainer::new(ctx.clone());
        let summary = maintainer.rebuild_all().await.unwrap();
        assert_eq!(summary.students, 3);
        assert_eq!(summary.student_records, 3);
        assert_eq!(summary.semesters, 1);
        assert_eq!(summary.classes, 2);

        let metrics = ctx.aggregates().semester_metrics(SemesterId(1)).await.unwrap().unwrap();
        // Finalized grades only: 70, 90, 95.
        assert_eq!(metrics.statistics.count, 3);
        assert_eq!(metrics.statistics.top_grade, 95);

        assert_eq!(
            maintainer.recompute_semester(SemesterId(1)).await.unwrap(),
            RecomputeOutcome::Unchanged
        );
    }

    #[test]
    fn test_rollup_is_mean_of_semester_averages() {
        let records = vec![
            record(1, 1, &[("A", 70, 3), ("B", 90, 2)], GradeStatus::Finalized),
            record(1, 2, &[("C", 90, 1)], GradeStatus::Finalized),
        ];
        let (average, gpa) =
            rollup_aggregates(StudentId(1), &records, GpaScale::Philippine).unwrap();
        assert_eq!(average.weighted_average, 84.0);
        assert_eq!(average.total_units, 6);
        assert_eq!(average.subjects_taken, 3);
        assert_eq!(gpa.gpa, 2.00);
        assert!(rollup_aggregates(StudentId(1), &[], GpaScale::Philippine).is_none());
    }

    #[test]
    fn test_outcome_merge() {
        use RecomputeOutcome::*;
        assert_eq!(Unchanged.merge(Updated), Updated);
        assert_eq!(Unchanged.merge(Unchanged), Unchanged);
        assert_eq!(Unchanged.merge(Skipped(SkipReason::NoRecord)), Unchanged);
        assert_eq!(
            Skipped(SkipReason::NoRecord).merge(Skipped(SkipReason::NoRecord)),
            Skipped(SkipReason::NoRecord)
        );
    }
}
