//! Invalidation coordinator: removes cached reports made stale by a write.

use gradebook_core::{
    GradebookError, GradebookResult, InvalidationPolicy, SemesterId, StudentId, SubjectCode,
};
use gradebook_storage::{DependencyTag, GradeLedger};
use serde::Serialize;

use crate::context::EngineContext;

/// Ledger keys touched by one grade change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffectedKeys {
    pub student_id: StudentId,
    pub semester_id: SemesterId,
    pub subject_code: SubjectCode,
}

impl AffectedKeys {
    pub fn new(student_id: StudentId, semester_id: SemesterId, subject_code: SubjectCode) -> Self {
        Self {
            student_id,
            semester_id,
            subject_code,
        }
    }
}

/// An invalidation that still failed after every retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheInvalidationFailure {
    pub attempts: u32,
    pub code: String,
    pub message: String,
}

impl CacheInvalidationFailure {
    fn from_error(attempts: u32, err: &GradebookError) -> Self {
        Self {
            attempts,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// What one invalidation pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub policy: InvalidationPolicy,
    /// Tags purged; empty for a flush.
    pub tags: Vec<DependencyTag>,
    pub removed: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<CacheInvalidationFailure>,
}

impl InvalidationReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Sole remover of cache entries.
#[derive(Debug, Clone)]
pub struct InvalidationCoordinator {
    ctx: EngineContext,
}

impl InvalidationCoordinator {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Purge every cached report that may depend on `affected`.
    ///
    /// Never fails: errors are retried, then logged and reported.
    pub async fn on_grade_changed(&self, affected: &AffectedKeys) -> InvalidationReport {
        let policy = self.ctx.config().invalidation_policy;
        if policy == InvalidationPolicy::FlushAll {
            return self.flush(policy, "grade change").await;
        }

        let school_year = match self.ctx.ledger().semester(affected.semester_id).await {
            Ok(semester) => semester.map(|s| s.school_year),
            Err(e) => {
                // SchoolYear tags go unmatched; AnyGrade still covers the
                // school-year listing.
                tracing::warn!(
                    semester_id = %affected.semester_id,
                    error = %e,
                    "Semester lookup failed during invalidation"
                );
                None
            }
        };
        let tags = DependencyTag::for_grade_change(
            affected.student_id,
            affected.semester_id,
            &affected.subject_code,
            school_year,
        );

        let cache = self.ctx.cache();
        let (result, attempts) = self.with_retries(|| cache.invalidate_tags(&tags)).await;
        match result {
            Ok(removed) => {
                tracing::debug!(
                    student_id = %affected.student_id,
                    semester_id = %affected.semester_id,
                    subject_code = %affected.subject_code,
                    removed,
                    attempts,
                    "Cache invalidated by tags"
                );
                InvalidationReport {
                    policy,
                    tags,
                    removed,
                    attempts,
                    failure: None,
                }
            }
            Err(e) => {
                tracing::warn!(
                    student_id = %affected.student_id,
                    semester_id = %affected.semester_id,
                    subject_code = %affected.subject_code,
                    attempts,
                    error = %e,
                    "Cache invalidation failed"
                );
                InvalidationReport {
                    policy,
                    tags,
                    removed: 0,
                    attempts,
                    failure: Some(CacheInvalidationFailure::from_error(attempts, &e)),
                }
            }
        }
    }

    /// Remove every cached report.
    pub async fn invalidate_all(&self, reason: &str) -> InvalidationReport {
        self.flush(InvalidationPolicy::FlushAll, reason).await
    }

    async fn flush(&self, policy: InvalidationPolicy, reason: &str) -> InvalidationReport {
        let cache = self.ctx.cache();
        let (result, attempts) = self.with_retries(|| cache.invalidate_all()).await;
        match result {
            Ok(removed) => {
                tracing::debug!(reason, removed, attempts, "Cache flushed");
                InvalidationReport {
                    policy,
                    tags: Vec::new(),
                    removed,
                    attempts,
                    failure: None,
                }
            }
            Err(e) => {
                tracing::warn!(reason, attempts, error = %e, "Cache flush failed");
                InvalidationReport {
                    policy,
                    tags: Vec::new(),
                    removed: 0,
                    attempts,
                    failure: Some(CacheInvalidationFailure::from_error(attempts, &e)),
                }
            }
        }
    }

    async fn with_retries<F, Fut>(&self, mut op: F) -> (GradebookResult<u64>, u32)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = GradebookResult<u64>>,
    {
        let max_attempts = self.ctx.config().invalidation_retries + 1;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(removed) => return (Ok(removed), attempts),
                Err(e) if attempts >= max_attempts => return (Err(e), attempts),
                Err(e) => {
                    tracing::debug!(attempts, error = %e, "Retrying cache invalidation");
                }
            }
        }
    }
}
