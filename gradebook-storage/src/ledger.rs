//! Grade ledger: the authoritative store of grade records and catalogs.

use async_trait::async_trait;
use gradebook_core::{
    GradeRecord, GradeUpdates, GradebookResult, LedgerError, RecordKey, Semester, SemesterId,
    StatusFilter, StudentId, Subject, SubjectCode,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Async adapter contract for the grade ledger.
///
/// Implementations must make `replace_grades` atomic per record key: either
/// every update in the map is applied or the record is left untouched.
#[async_trait]
pub trait GradeLedger: Send + Sync {
    // ========================================================================
    // GRADE RECORDS
    // ========================================================================

    /// Point lookup of one record.
    async fn get(
        &self,
        student_id: StudentId,
        semester_id: SemesterId,
    ) -> GradebookResult<Option<GradeRecord>>;

    /// Insert a new record. Fails with `InsertFailed` if the key exists.
    async fn insert(&self, record: GradeRecord) -> GradebookResult<()>;

    /// Replace grades of one record and return how many entries changed.
    async fn replace_grades(
        &self,
        student_id: StudentId,
        semester_id: SemesterId,
        updates: &GradeUpdates,
    ) -> GradebookResult<usize>;

    /// Records of a semester that list the subject.
    async fn find_by_subject_and_semester(
        &self,
        subject_code: &SubjectCode,
        semester_id: SemesterId,
        filter: StatusFilter,
    ) -> GradebookResult<Vec<GradeRecord>>;

    /// Every record of a student, ordered by semester.
    async fn find_by_student(&self, student_id: StudentId) -> GradebookResult<Vec<GradeRecord>>;

    /// Every record of a semester, ordered by student.
    async fn find_by_semester(
        &self,
        semester_id: SemesterId,
        filter: StatusFilter,
    ) -> GradebookResult<Vec<GradeRecord>>;

    /// Distinct students with at least one record, ascending.
    async fn list_students(&self) -> GradebookResult<Vec<StudentId>>;

    // ========================================================================
    // CATALOGS
    // ========================================================================

    async fn subject(&self, code: &SubjectCode) -> GradebookResult<Option<Subject>>;

    async fn semester(&self, semester_id: SemesterId) -> GradebookResult<Option<Semester>>;

    /// Semester catalog, ascending by id.
    async fn semesters(&self) -> GradebookResult<Vec<Semester>>;
}

/// In-memory ledger for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    records: Arc<RwLock<BTreeMap<RecordKey, GradeRecord>>>,
    subjects: Arc<RwLock<BTreeMap<SubjectCode, Subject>>>,
    semesters: Arc<RwLock<BTreeMap<SemesterId, Semester>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subject catalog entry.
    pub async fn put_subject(&self, subject: Subject) {
        self.subjects
            .write()
            .await
            .insert(subject.code.clone(), subject);
    }

    /// Add or replace a semester catalog entry.
    pub async fn put_semester(&self, semester: Semester) {
        self.semesters
            .write()
            .await
            .insert(semester.semester_id, semester);
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl GradeLedger for InMemoryLedger {
    async fn get(
        &self,
        student_id: StudentId,
        semester_id: SemesterId,
    ) -> GradebookResult<Option<GradeRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&RecordKey::new(student_id, semester_id)).cloned())
    }

    async fn insert(&self, record: GradeRecord) -> GradebookResult<()> {
        let mut records = self.records.write().await;
        let key = record.key();
        if records.contains_key(&key) {
            return Err(LedgerError::InsertFailed {
                student_id: key.student_id,
                semester_id: key.semester_id,
                reason: "a grade record already exists for this key".to_string(),
            }
            .into());
        }
        records.insert(key, record);
        Ok(())
    }

    async fn replace_grades(
        &self,
        student_id: StudentId,
        semester_id: SemesterId,
        updates: &GradeUpdates,
    ) -> GradebookResult<usize> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&RecordKey::new(student_id, semester_id))
            .ok_or(LedgerError::StudentNotFound {
                student_id,
                semester_id,
            })?;
        record.apply_grade_updates(updates)
    }

    async fn find_by_subject_and_semester(
        &self,
        subject_code: &SubjectCode,
        semester_id: SemesterId,
        filter: StatusFilter,
    ) -> GradebookResult<Vec<GradeRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.semester_id == semester_id)
            .filter(|r| filter.matches(r.status))
            .filter(|r| r.references(subject_code))
            .cloned()
            .collect())
    }

    async fn find_by_student(&self, student_id: StudentId) -> GradebookResult<Vec<GradeRecord>> {
        let records = self.records.read().await;
        let start = RecordKey::new(student_id, SemesterId(u32::MIN));
        let end = RecordKey::new(student_id, SemesterId(u32::MAX));
        Ok(records.range(start..=end).map(|(_, r)| r.clone()).collect())
    }

    async fn find_by_semester(
        &self,
        semester_id: SemesterId,
        filter: StatusFilter,
    ) -> GradebookResult<Vec<GradeRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.semester_id == semester_id && filter.matches(r.status))
            .cloned()
            .collect())
    }

    async fn list_students(&self) -> GradebookResult<Vec<StudentId>> {
        let records = self.records.read().await;
        let students: BTreeSet<StudentId> = records.keys().map(|k| k.student_id).collect();
        Ok(students.into_iter().collect())
    }

    async fn subject(&self, code: &SubjectCode) -> GradebookResult<Option<Subject>> {
        Ok(self.subjects.read().await.get(code).cloned())
    }

    async fn semester(&self, semester_id: SemesterId) -> GradebookResult<Option<Semester>> {
        Ok(self.semesters.read().await.get(&semester_id).cloned())
    }

    async fn semesters(&self) -> GradebookResult<Vec<Semester>> {
        Ok(self.semesters.read().await.values().cloned().collect())
    }
}
