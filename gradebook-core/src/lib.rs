//! GRADEBOOK Core - Entity Types
//!
//! Grade ledger records, derived aggregates, the grading policy, errors and
//! configuration. Every other crate depends on this one.

mod config;
mod entities;
mod error;
mod identity;
mod policy;

pub use config::{EngineConfig, InvalidationPolicy};
pub use entities::{
    Aggregate, ClassAverage, Grade, GradeEntry, GradeRecord, GradeStatus, GradeUpdates, Semester,
    SemesterMetrics, StatusFilter, StudentAverage, StudentGpa, Subject, Term,
};
pub use error::{
    AggregateError, CacheError, ConfigError, GradebookError, GradebookResult, LedgerError,
    ValidationError,
};
pub use identity::{RecordKey, SemesterId, StudentId, SubjectCode, Timestamp};
pub use policy::{
    gpa_of, round2, standing_for_average, standing_of, weighted_average, AcademicStanding,
    GpaScale, GradeDistribution, GradeStatistics, WeightedAverage, PASSING_GRADE,
};
