//! Mutation gateway: the single entry point for grade changes.
//!
//! A change is validated, written to the ledger under the record's write
//! lock, and then drives aggregate recomputation and cache invalidation.
//! Recompute skips are logged only. Invalidation failures are reported in
//! the result and never fail the write.

use gradebook_core::{
    round2, AcademicStanding, Grade, GradeUpdates, GradebookError, GradebookResult, LedgerError,
    RecordKey, SemesterId, StudentGpa, StudentId, SubjectCode,
};
use gradebook_storage::{AggregateStore, GradeLedger};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::context::EngineContext;
use crate::coordinator::{AffectedKeys, InvalidationCoordinator, InvalidationReport};
use crate::maintainer::{student_aggregates, AggregateMaintainer, RecomputeOutcome};

/// Refreshed standing of the student after a grade change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeChangeResult {
    pub student_id: StudentId,
    pub semester_id: SemesterId,
    pub subject_code: SubjectCode,
    pub new_grade: u8,
    pub weighted_average: f64,
    pub gpa: f64,
    pub academic_standing: AcademicStanding,
    /// False when the record already held `new_grade`, or when a later
    /// batch item replaced this one.
    pub modified: bool,
    /// Index of the later batch item whose grade for the same subject was
    /// stored instead. `new_grade` then reports the stored grade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<usize>,
    /// Set for single changes; batch invalidation is reported once per batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidation: Option<InvalidationReport>,
}

/// One item of a batch grade change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeChangeItem {
    pub student_id: StudentId,
    pub subject_code: SubjectCode,
    pub semester_id: SemesterId,
    /// Signed so that out-of-range input survives deserialization and is
    /// rejected per item.
    pub new_grade: i64,
}

impl GradeChangeItem {
    pub fn new(
        student_id: StudentId,
        subject_code: impl Into<SubjectCode>,
        semester_id: SemesterId,
        new_grade: i64,
    ) -> Self {
        Self {
            student_id,
            subject_code: subject_code.into(),
            semester_id,
            new_grade,
        }
    }

    fn key(&self) -> RecordKey {
        RecordKey::new(self.student_id, self.semester_id)
    }
}

/// Error of one batch item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItemError {
    /// Position of the item in the request.
    pub index: usize,
    pub student_id: StudentId,
    pub semester_id: SemesterId,
    pub subject_code: SubjectCode,
    pub code: String,
    pub message: String,
}

impl BatchItemError {
    fn new(index: usize, item: &GradeChangeItem, err: &GradebookError) -> Self {
        Self {
            index,
            student_id: item.student_id,
            semester_id: item.semester_id,
            subject_code: item.subject_code.clone(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of a batch grade change. Results and errors are in request order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub results: Vec<GradeChangeResult>,
    pub errors: Vec<BatchItemError>,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidation: Option<InvalidationReport>,
}

/// Batch item that reached the ledger.
struct Applied {
    index: usize,
    item: GradeChangeItem,
    /// Grade stored for the item's subject once its group is written.
    grade: Grade,
    modified: bool,
    superseded_by: Option<usize>,
}

/// Point earlier items at the last item of the group with the same subject.
/// `applied` is in request order.
fn mark_superseded(applied: &mut [Applied]) {
    let mut last: HashMap<SubjectCode, (usize, Grade)> = HashMap::new();
    for a in applied.iter() {
        last.insert(a.item.subject_code.clone(), (a.index, a.grade));
    }
    for a in applied.iter_mut() {
        if let Some(&(index, grade)) = last.get(&a.item.subject_code) {
            if index != a.index {
                a.superseded_by = Some(index);
                a.grade = grade;
                a.modified = false;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutationGateway {
    ctx: EngineContext,
    maintainer: AggregateMaintainer,
    coordinator: InvalidationCoordinator,
}

impl MutationGateway {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            maintainer: AggregateMaintainer::new(ctx.clone()),
            coordinator: InvalidationCoordinator::new(ctx.clone()),
            ctx,
        }
    }

    pub fn maintainer(&self) -> &AggregateMaintainer {
        &self.maintainer
    }

    pub fn coordinator(&self) -> &InvalidationCoordinator {
        &self.coordinator
    }

    /// Change one grade and return the student's refreshed standing.
    ///
    /// Fails with `InvalidGrade` before any write, or with
    /// `StudentNotFound`/`SubjectNotFound` from the ledger, leaving the
    /// record unchanged. Once the ledger write commits, recomputation and
    /// invalidation both run; a recompute error is returned after the cache
    /// has been invalidated.
    #[tracing::instrument(skip(self), fields(subject_code = %subject_code))]
    pub async fn apply_grade_change(
        &self,
        student_id: StudentId,
        semester_id: SemesterId,
        subject_code: SubjectCode,
        new_grade: i64,
    ) -> GradebookResult<GradeChangeResult> {
        let grade = Grade::new(new_grade)?;
        let mut updates = GradeUpdates::new();
        updates.insert(subject_code.clone(), new_grade);

        let mut first_error = None;
        let modified = {
            let _guard = self
                .ctx
                .record_locks()
                .lock(RecordKey::new(student_id, semester_id))
                .await;
            let modified = self
                .ctx
                .ledger()
                .replace_grades(student_id, semester_id, &updates)
                .await?;
            // Student aggregates are refreshed under the record lock so that
            // two writers to one record cannot store an outdated average last.
            note_recompute(
                self.maintainer.recompute_student(student_id, semester_id).await,
                "student",
                &mut first_error,
            );
            modified
        };
        tracing::debug!(modified, "Grade written");

        note_recompute(
            self.maintainer.recompute_class(&subject_code, semester_id).await,
            "class",
            &mut first_error,
        );
        note_recompute(
            self.maintainer.recompute_semester(semester_id).await,
            "semester",
            &mut first_error,
        );

        let affected = AffectedKeys::new(student_id, semester_id, subject_code.clone());
        let invalidation = self.coordinator.on_grade_changed(&affected).await;

        if let Some(err) = first_error {
            return Err(err);
        }

        let gpa = self.refreshed_gpa(student_id, semester_id).await?;
        tracing::info!(
            gpa = gpa.gpa,
            standing = %gpa.academic_standing,
            removed = invalidation.removed,
            "Grade change applied"
        );
        Ok(GradeChangeResult {
            student_id,
            semester_id,
            subject_code,
            new_grade: grade.value(),
            weighted_average: round2(gpa.weighted_average),
            gpa: gpa.gpa,
            academic_standing: gpa.academic_standing,
            modified: modified > 0,
            superseded_by: None,
            invalidation: Some(invalidation),
        })
    }

    /// Apply many grade changes. Never fails as a whole: every item ends up
    /// in either `results` or `errors`.
    ///
    /// Items are grouped per record and each group is written with a single
    /// ledger call. A group the ledger rejects is retried item by item so
    /// only the offending items are reported. Aggregates are recomputed once
    /// per touched key and the whole cache is flushed once.
    #[tracing::instrument(skip(self, items), fields(items = items.len()))]
    pub async fn apply_grade_change_batch(&self, items: Vec<GradeChangeItem>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut errors = Vec::new();

        // Group valid items per record, in first-seen order.
        let mut groups: Vec<(RecordKey, Vec<(usize, GradeChangeItem, Grade)>)> = Vec::new();
        let mut positions: HashMap<RecordKey, usize> = HashMap::new();
        for (index, item) in items.into_iter().enumerate() {
            let grade = match Grade::new(item.new_grade) {
                Ok(grade) => grade,
                Err(e) => {
                    errors.push(BatchItemError::new(index, &item, &e.into()));
                    continue;
                }
            };
            let key = item.key();
            let position = *positions.entry(key).or_insert_with(|| {
                groups.push((key, Vec::new()));
                groups.len() - 1
            });
            groups[position].1.push((index, item, grade));
        }

        let mut applied = Vec::new();
        for (key, group) in groups {
            let (ok, failed) = self.apply_group(key, group).await;
            applied.extend(ok);
            errors.extend(failed);
        }

        // Recompute once per touched key.
        let students: BTreeSet<RecordKey> = applied.iter().map(|a| a.item.key()).collect();
        let classes: BTreeSet<(SubjectCode, SemesterId)> = applied
            .iter()
            .map(|a| (a.item.subject_code.clone(), a.item.semester_id))
            .collect();
        let semesters: BTreeSet<SemesterId> = applied.iter().map(|a| a.item.semester_id).collect();

        let mut failed_students: HashMap<RecordKey, GradebookError> = HashMap::new();
        for key in students {
            let result = {
                let _guard = self.ctx.record_locks().lock(key).await;
                self.maintainer
                    .recompute_student(key.student_id, key.semester_id)
                    .await
            };
            if let Err(e) = result {
                tracing::warn!(%key, error = %e, "Student recompute failed in batch");
                failed_students.insert(key, e);
            }
        }
        for (subject_code, semester_id) in &classes {
            if let Err(e) = self.maintainer.recompute_class(subject_code, *semester_id).await {
                tracing::warn!(
                    %subject_code,
                    %semester_id,
                    error = %e,
                    "Class recompute failed in batch"
                );
            }
        }
        for semester_id in semesters {
            if let Err(e) = self.maintainer.recompute_semester(semester_id).await {
                tracing::warn!(%semester_id, error = %e, "Semester recompute failed in batch");
            }
        }

        if !applied.is_empty() {
            let report = self.coordinator.invalidate_all("batch grade change").await;
            outcome.invalidation = Some(report);
        }

        let mut results = Vec::with_capacity(applied.len());
        for applied in applied {
            let key = applied.item.key();
            if let Some(err) = failed_students.get(&key) {
                errors.push(BatchItemError::new(applied.index, &applied.item, err));
                continue;
            }
            match self.refreshed_gpa(key.student_id, key.semester_id).await {
                Ok(gpa) => results.push((
                    applied.index,
                    GradeChangeResult {
                        student_id: applied.item.student_id,
                        semester_id: applied.item.semester_id,
                        subject_code: applied.item.subject_code,
                        new_grade: applied.grade.value(),
                        weighted_average: round2(gpa.weighted_average),
                        gpa: gpa.gpa,
                        academic_standing: gpa.academic_standing,
                        modified: applied.modified,
                        superseded_by: applied.superseded_by,
                        invalidation: None,
                    },
                )),
                Err(e) => errors.push(BatchItemError::new(applied.index, &applied.item, &e)),
            }
        }

        results.sort_by_key(|(index, _)| *index);
        outcome.results = results.into_iter().map(|(_, result)| result).collect();
        errors.sort_by_key(|e| e.index);
        outcome.errors = errors;
        outcome.succeeded = outcome.results.len();
        outcome.failed = outcome.errors.len();
        tracing::info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Batch grade change applied"
        );
        outcome
    }

    /// Write one record's group of items under its lock.
    async fn apply_group(
        &self,
        key: RecordKey,
        group: Vec<(usize, GradeChangeItem, Grade)>,
    ) -> (Vec<Applied>, Vec<BatchItemError>) {
        let _guard = self.ctx.record_locks().lock(key).await;
        let ledger = self.ctx.ledger();

        let before = match ledger.get(key.student_id, key.semester_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                let err: GradebookError = LedgerError::StudentNotFound {
                    student_id: key.student_id,
                    semester_id: key.semester_id,
                }
                .into();
                let errors = group
                    .iter()
                    .map(|(index, item, _)| BatchItemError::new(*index, item, &err))
                    .collect();
                return (Vec::new(), errors);
            }
            Err(e) => {
                let errors = group
                    .iter()
                    .map(|(index, item, _)| BatchItemError::new(*index, item, &e))
                    .collect();
                return (Vec::new(), errors);
            }
        };

        // Later items overwrite earlier ones for the same subject.
        let updates: GradeUpdates = group
            .iter()
            .map(|(_, item, _)| (item.subject_code.clone(), item.new_grade))
            .collect();
        match ledger
            .replace_grades(key.student_id, key.semester_id, &updates)
            .await
        {
            Ok(_) => {
                let mut applied: Vec<Applied> = group
                    .into_iter()
                    .map(|(index, item, grade)| Applied {
                        modified: before.grade_of(&item.subject_code) != Some(grade),
                        index,
                        item,
                        grade,
                        superseded_by: None,
                    })
                    .collect();
                mark_superseded(&mut applied);
                return (applied, Vec::new());
            }
            Err(e) if group.len() == 1 => {
                let errors = group
                    .iter()
                    .map(|(index, item, _)| BatchItemError::new(*index, item, &e))
                    .collect();
                return (Vec::new(), errors);
            }
            Err(e) => {
                tracing::debug!(%key, error = %e, "Group rejected, retrying items one by one");
            }
        }

        let mut applied = Vec::new();
        let mut errors = Vec::new();
        for (index, item, grade) in group {
            let mut single = GradeUpdates::new();
            single.insert(item.subject_code.clone(), item.new_grade);
            match ledger
                .replace_grades(key.student_id, key.semester_id, &single)
                .await
            {
                Ok(modified) => applied.push(Applied {
                    index,
                    item,
                    grade,
                    modified: modified > 0,
                    superseded_by: None,
                }),
                Err(e) => errors.push(BatchItemError::new(index, &item, &e)),
            }
        }
        mark_superseded(&mut applied);
        (applied, errors)
    }

    /// Semester GPA from the aggregate store, or computed from the ledger
    /// when the store has none.
    async fn refreshed_gpa(
        &self,
        student_id: StudentId,
        semester_id: SemesterId,
    ) -> GradebookResult<StudentGpa> {
        if let Some(gpa) = self
            .ctx
            .aggregates()
            .student_gpa(student_id, Some(semester_id))
            .await?
        {
            return Ok(gpa);
        }
        let record = self
            .ctx
            .ledger()
            .get(student_id, semester_id)
            .await?
            .ok_or(LedgerError::StudentNotFound {
                student_id,
                semester_id,
            })?;
        Ok(student_aggregates(&record, self.ctx.config().gpa_scale).1)
    }
}

fn note_recompute(
    result: GradebookResult<RecomputeOutcome>,
    what: &'static str,
    first_error: &mut Option<GradebookError>,
) {
    match result {
        Ok(RecomputeOutcome::Skipped(reason)) => {
            tracing::debug!(aggregate = what, %reason, "Recompute skipped");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(aggregate = what, error = %e, "Recompute failed");
            first_error.get_or_insert(e);
        }
    }
}
