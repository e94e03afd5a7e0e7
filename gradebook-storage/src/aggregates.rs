//! Aggregate store: denormalized tables derived from the grade ledger.

use async_trait::async_trait;
use gradebook_core::{
    ClassAverage, GradebookResult, SemesterId, SemesterMetrics, StudentAverage, StudentGpa,
    StudentId, SubjectCode,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Key of per-student aggregates. `None` semester is the student rollup.
pub type StudentAggregateKey = (StudentId, Option<SemesterId>);

/// Async adapter contract for the aggregate store.
///
/// Every write is an upsert keyed by the aggregate's identity: a key never
/// holds more than one row.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    // ========================================================================
    // STUDENT AGGREGATES
    // ========================================================================

    async fn upsert_student_average(&self, average: StudentAverage) -> GradebookResult<()>;

    async fn student_average(
        &self,
        student_id: StudentId,
        semester_id: Option<SemesterId>,
    ) -> GradebookResult<Option<StudentAverage>>;

    /// Semester-level averages of a student, ascending by semester. Excludes the rollup.
    async fn student_semester_averages(
        &self,
        student_id: StudentId,
    ) -> GradebookResult<Vec<StudentAverage>>;

    async fn upsert_student_gpa(&self, gpa: StudentGpa) -> GradebookResult<()>;

    async fn student_gpa(
        &self,
        student_id: StudentId,
        semester_id: Option<SemesterId>,
    ) -> GradebookResult<Option<StudentGpa>>;

    // ========================================================================
    // CLASS AND SEMESTER AGGREGATES
    // ========================================================================

    async fn upsert_class_average(&self, average: ClassAverage) -> GradebookResult<()>;

    async fn class_average(
        &self,
        subject_code: &SubjectCode,
        semester_id: SemesterId,
    ) -> GradebookResult<Option<ClassAverage>>;

    /// Class averages of a subject across semesters, ascending by semester.
    async fn class_averages_for_subject(
        &self,
        subject_code: &SubjectCode,
    ) -> GradebookResult<Vec<ClassAverage>>;

    async fn upsert_semester_metrics(&self, metrics: SemesterMetrics) -> GradebookResult<()>;

    async fn semester_metrics(
        &self,
        semester_id: SemesterId,
    ) -> GradebookResult<Option<SemesterMetrics>>;
}

/// In-memory aggregate store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAggregateStore {
    student_averages: Arc<RwLock<BTreeMap<StudentAggregateKey, StudentAverage>>>,
    student_gpas: Arc<RwLock<BTreeMap<StudentAggregateKey, StudentGpa>>>,
    class_averages: Arc<RwLock<BTreeMap<(SubjectCode, SemesterId), ClassAverage>>>,
    semester_metrics: Arc<RwLock<BTreeMap<SemesterId, SemesterMetrics>>>,
}

impl InMemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn student_average_count(&self) -> usize {
        self.student_averages.read().await.len()
    }

    pub async fn class_average_count(&self) -> usize {
        self.class_averages.read().await.len()
    }
}

#[async_trait]
impl AggregateStore for InMemoryAggregateStore {
    async fn upsert_student_average(&self, average: StudentAverage) -> GradebookResult<()> {
        let key = (average.student_id, average.semester_id);
        self.student_averages.write().await.insert(key, average);
        Ok(())
    }

    async fn student_average(
        &self,
        student_id: StudentId,
        semester_id: Option<SemesterId>,
    ) -> GradebookResult<Option<StudentAverage>> {
        Ok(self
            .student_averages
            .read()
            .await
            .get(&(student_id, semester_id))
            .cloned())
    }

    async fn student_semester_averages(
        &self,
        student_id: StudentId,
    ) -> GradebookResult<Vec<StudentAverage>> {
        let averages = self.student_averages.read().await;
        let first = (student_id, Some(SemesterId(u32::MIN)));
        let last = (student_id, Some(SemesterId(u32::MAX)));
        Ok(averages
            .range(first..=last)
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn upsert_student_gpa(&self, gpa: StudentGpa) -> GradebookResult<()> {
        let key = (gpa.student_id, gpa.semester_id);
        self.student_gpas.write().await.insert(key, gpa);
        Ok(())
    }

    async fn student_gpa(
        &self,
        student_id: StudentId,
        semester_id: Option<SemesterId>,
    ) -> GradebookResult<Option<StudentGpa>> {
        Ok(self
            .student_gpas
            .read()
            .await
            .get(&(student_id, semester_id))
            .cloned())
    }

    async fn upsert_class_average(&self, average: ClassAverage) -> GradebookResult<()> {
        let key = (average.subject_code.clone(), average.semester_id);
        self.class_averages.write().await.insert(key, average);
        Ok(())
    }

    async fn class_average(
        &self,
        subject_code: &SubjectCode,
        semester_id: SemesterId,
    ) -> GradebookResult<Option<ClassAverage>> {
        Ok(self
            .class_averages
            .read()
            .await
            .get(&(subject_code.clone(), semester_id))
            .cloned())
    }

    async fn class_averages_for_subject(
        &self,
        subject_code: &SubjectCode,
    ) -> GradebookResult<Vec<ClassAverage>> {
        let averages = self.class_averages.read().await;
        Ok(averages
            .values()
            .filter(|a| &a.subject_code == subject_code)
            .cloned()
            .collect())
    }

    async fn upsert_semester_metrics(&self, metrics: SemesterMetrics) -> GradebookResult<()> {
        self.semester_metrics
            .write()
            .await
            .insert(metrics.semester_id, metrics);
        Ok(())
    }

    async fn semester_metrics(
        &self,
        semester_id: SemesterId,
    ) -> GradebookResult<Option<SemesterMetrics>> {
        Ok(self.semester_metrics.read().await.get(&semester_id).cloned())
    }
}
