//! Error types for gradebook operations

use crate::{SemesterId, StudentId, SubjectCode};
use thiserror::Error;

/// Grade ledger errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Student not found: no record for student {student_id} in semester {semester_id}")]
    StudentNotFound {
        student_id: StudentId,
        semester_id: SemesterId,
    },

    #[error(
        "Subject not found: {subject_code} is not in the record of student {student_id} \
         for semester {semester_id}"
    )]
    SubjectNotFound {
        student_id: StudentId,
        semester_id: SemesterId,
        subject_code: SubjectCode,
    },

    #[error("Insert failed for student {student_id} in semester {semester_id}: {reason}")]
    InsertFailed {
        student_id: StudentId,
        semester_id: SemesterId,
        reason: String,
    },

    #[error("Ledger backend error: {reason}")]
    Backend { reason: String },
}

/// Aggregate store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("Aggregate store backend error: {reason}")]
    Backend { reason: String },
}

/// Validation errors, raised before anything is written.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid grade {value}: grades must be integers between 0 and 100")]
    InvalidGrade { value: i64 },

    #[error("Invalid units {value} for subject {subject_code}: units must be positive")]
    InvalidUnits { subject_code: SubjectCode, value: i64 },

    #[error("Parallel lists differ: {subject_codes} codes, {grades} grades, {units} units")]
    LengthMismatch {
        subject_codes: usize,
        grades: usize,
        units: usize,
    },

    #[error("Grade record must list at least one subject")]
    EmptyRecord,

    #[error("Subject {subject_code} appears more than once in one record")]
    DuplicateSubject { subject_code: SubjectCode },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Query result cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend error: {reason}")]
    Backend { reason: String },

    #[error("Cache payload serialization failed for {endpoint}: {reason}")]
    Serialization { endpoint: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all gradebook errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GradebookError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Aggregate error: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl GradebookError {
    /// Stable machine-readable code for structured error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            GradebookError::Ledger(LedgerError::StudentNotFound { .. }) => "STUDENT_NOT_FOUND",
            GradebookError::Ledger(LedgerError::SubjectNotFound { .. }) => "SUBJECT_NOT_FOUND",
            GradebookError::Ledger(LedgerError::InsertFailed { .. }) => "INSERT_FAILED",
            GradebookError::Ledger(_) => "LEDGER_ERROR",
            GradebookError::Aggregate(_) => "AGGREGATE_ERROR",
            GradebookError::Validation(ValidationError::InvalidGrade { .. }) => "INVALID_GRADE",
            GradebookError::Validation(_) => "VALIDATION_ERROR",
            GradebookError::Cache(_) => "CACHE_ERROR",
            GradebookError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// True for the not-found family surfaced by the ledger.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GradebookError::Ledger(
                LedgerError::StudentNotFound { .. } | LedgerError::SubjectNotFound { .. }
            )
        )
    }
}

/// Result type alias for gradebook operations.
pub type GradebookResult<T> = Result<T, GradebookError>;

// =============================================================================
// TESTS
// =============================================================================
