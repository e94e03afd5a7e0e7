//! Entity types: the grade ledger record, catalogs, and derived aggregates.

use crate::{
    AcademicStanding, GradeStatistics, GradebookResult, LedgerError, SemesterId, StudentId,
    SubjectCode, Timestamp, ValidationError,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// GRADES
// ============================================================================

/// A single grade, always an integer in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Grade(u8);

impl Grade {
    pub const MIN: u8 = 0;
    pub const MAX: u8 = 100;

    /// Validate a raw value. Anything outside `[0, 100]` is `InvalidGrade`.
    pub fn new(value: i64) -> Result<Self, ValidationError> {
        if (i64::from(Self::MIN)..=i64::from(Self::MAX)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(ValidationError::InvalidGrade { value })
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Grade {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Grade> for u8 {
    fn from(grade: Grade) -> Self {
        grade.0
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Review status of a grade record. Only finalized records feed class statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeStatus {
    Pending,
    #[default]
    Finalized,
    Appealed,
}

impl GradeStatus {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            GradeStatus::Pending => "pending",
            GradeStatus::Finalized => "finalized",
            GradeStatus::Appealed => "appealed",
        }
    }
}

impl fmt::Display for GradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for GradeStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(GradeStatus::Pending),
            "finalized" => Ok(GradeStatus::Finalized),
            "appealed" => Ok(GradeStatus::Appealed),
            other => Err(ValidationError::InvalidValue {
                field: "status".to_string(),
                reason: format!("unknown grade status '{}'", other),
            }),
        }
    }
}

/// Filter for ledger range scans by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    Any,
    Only(GradeStatus),
}

impl StatusFilter {
    pub fn finalized() -> Self {
        Self::Only(GradeStatus::Finalized)
    }

    pub fn matches(&self, status: GradeStatus) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::Only(wanted) => *wanted == status,
        }
    }
}

/// Grade edits for one record: subject code to raw (not yet validated) grade.
pub type GradeUpdates = BTreeMap<SubjectCode, i64>;

// ============================================================================
// GRADE RECORD
// ============================================================================

/// One subject line of a grade record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeEntry {
    pub subject_code: SubjectCode,
    pub grade: Grade,
    pub units: u8,
}

/// Authoritative grades of one student for one semester.
///
/// Invariants: at least one entry, unique subject codes, positive units.
/// Stored as parallel lists (`subject_codes`, `grades`, `units`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GradeRecordDocument", into = "GradeRecordDocument")]
pub struct GradeRecord {
    pub student_id: StudentId,
    pub semester_id: SemesterId,
    entries: Vec<GradeEntry>,
    pub status: GradeStatus,
    pub updated_at: Timestamp,
    pub last_modified_by: Option<String>,
}

impl GradeRecord {
    /// Build a record from already-typed entries.
    pub fn new(
        student_id: StudentId,
        semester_id: SemesterId,
        entries: Vec<GradeEntry>,
        status: GradeStatus,
    ) -> Result<Self, ValidationError> {
        if entries.is_empty() {
            return Err(ValidationError::EmptyRecord);
        }

        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if entry.units == 0 {
                return Err(ValidationError::InvalidUnits {
                    subject_code: entry.subject_code.clone(),
                    value: 0,
                });
            }
            if !seen.insert(&entry.subject_code) {
                return Err(ValidationError::DuplicateSubject {
                    subject_code: entry.subject_code.clone(),
                });
            }
        }

        Ok(Self {
            student_id,
            semester_id,
            entries,
            status,
            updated_at: Utc::now(),
            last_modified_by: None,
        })
    }

    /// Build a record from the parallel-list representation of the document store.
    pub fn from_parallel(
        student_id: StudentId,
        semester_id: SemesterId,
        subject_codes: Vec<SubjectCode>,
        grades: Vec<i64>,
        units: Vec<i64>,
        status: GradeStatus,
    ) -> Result<Self, ValidationError> {
        if subject_codes.len() != grades.len() || grades.len() != units.len() {
            return Err(ValidationError::LengthMismatch {
                subject_codes: subject_codes.len(),
                grades: grades.len(),
                units: units.len(),
            });
        }

        let entries = subject_codes
            .into_iter()
            .zip(grades)
            .zip(units)
            .map(|((subject_code, grade), units)| {
                let grade = Grade::new(grade)?;
                let units = u8::try_from(units)
                    .ok()
                    .filter(|u| *u > 0)
                    .ok_or_else(|| ValidationError::InvalidUnits {
                        subject_code: subject_code.clone(),
                        value: units,
                    })?;
                Ok(GradeEntry {
                    subject_code,
                    grade,
                    units,
                })
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;

        Self::new(student_id, semester_id, entries, status)
    }

    pub fn key(&self) -> crate::RecordKey {
        crate::RecordKey::new(self.student_id, self.semester_id)
    }

    pub fn entries(&self) -> &[GradeEntry] {
        &self.entries
    }

    pub fn entry(&self, subject_code: &SubjectCode) -> Option<&GradeEntry> {
        self.entries.iter().find(|e| &e.subject_code == subject_code)
    }

    pub fn grade_of(&self, subject_code: &SubjectCode) -> Option<Grade> {
        self.entry(subject_code).map(|e| e.grade)
    }

    pub fn references(&self, subject_code: &SubjectCode) -> bool {
        self.entry(subject_code).is_some()
    }

    pub fn is_finalized(&self) -> bool {
        self.status == GradeStatus::Finalized
    }

    /// Apply several grade edits as one unit.
    ///
    /// Every update is validated before anything changes, so a failure
    /// leaves the record untouched. Returns the number of entries whose
    /// grade actually changed.
    pub fn apply_grade_updates(&mut self, updates: &GradeUpdates) -> GradebookResult<usize> {
        let mut plan = Vec::with_capacity(updates.len());
        for (subject_code, raw) in updates {
            let grade = Grade::new(*raw)?;
            let index = self
                .entries
                .iter()
                .position(|e| &e.subject_code == subject_code)
                .ok_or_else(|| LedgerError::SubjectNotFound {
                    student_id: self.student_id,
                    semester_id: self.semester_id,
                    subject_code: subject_code.clone(),
                })?;
            plan.push((index, grade));
        }

        let mut modified = 0;
        for (index, grade) in plan {
            if self.entries[index].grade != grade {
                self.entries[index].grade = grade;
                modified += 1;
            }
        }
        if modified > 0 {
            self.updated_at = Utc::now();
        }
        Ok(modified)
    }
}

/// Wire/document shape of a grade record: parallel lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GradeRecordDocument {
    student_id: StudentId,
    semester_id: SemesterId,
    subject_codes: Vec<SubjectCode>,
    grades: Vec<i64>,
    units: Vec<i64>,
    #[serde(default)]
    status: GradeStatus,
    #[serde(default = "Utc::now")]
    updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_modified_by: Option<String>,
}

impl TryFrom<GradeRecordDocument> for GradeRecord {
    type Error = ValidationError;

    fn try_from(doc: GradeRecordDocument) -> Result<Self, Self::Error> {
        let mut record = GradeRecord::from_parallel(
            doc.student_id,
            doc.semester_id,
            doc.subject_codes,
            doc.grades,
            doc.units,
            doc.status,
        )?;
        record.updated_at = doc.updated_at;
        record.last_modified_by = doc.last_modified_by;
        Ok(record)
    }
}

impl From<GradeRecord> for GradeRecordDocument {
    fn from(record: GradeRecord) -> Self {
        let mut subject_codes = Vec::with_capacity(record.entries.len());
        let mut grades = Vec::with_capacity(record.entries.len());
        let mut units = Vec::with_capacity(record.entries.len());
        for entry in record.entries {
            subject_codes.push(entry.subject_code);
            grades.push(i64::from(entry.grade.value()));
            units.push(i64::from(entry.units));
        }
        Self {
            student_id: record.student_id,
            semester_id: record.semester_id,
            subject_codes,
            grades,
            units,
            status: record.status,
            updated_at: record.updated_at,
            last_modified_by: record.last_modified_by,
        }
    }
}

// ============================================================================
// CATALOGS
// ============================================================================

/// Subject catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub code: SubjectCode,
    pub description: String,
    pub units: u8,
}

/// Academic term within a school year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Term {
    First,
    Second,
    Summer,
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::First => f.write_str("First"),
            Term::Second => f.write_str("Second"),
            Term::Summer => f.write_str("Summer"),
        }
    }
}

/// Semester catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Semester {
    pub semester_id: SemesterId,
    pub term: Term,
    pub school_year: u16,
}

impl Semester {
    pub fn label(&self) -> String {
        format!("{} - SY {}", self.term, self.school_year)
    }
}

// ============================================================================
// DERIVED AGGREGATES
// ============================================================================

/// Common behaviour of derived aggregates: they carry a refresh timestamp
/// that is not part of their content.
pub trait Aggregate: Clone + PartialEq {
    fn updated_at(&self) -> Timestamp;
    fn set_updated_at(&mut self, at: Timestamp);

    /// Content equality, ignoring `updated_at`.
    fn same_content(&self, other: &Self) -> bool {
        let mut probe = other.clone();
        probe.set_updated_at(self.updated_at());
        *self == probe
    }
}

/// Weighted average of one student, per semester or rolled up
/// (`semester_id == None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentAverage {
    pub student_id: StudentId,
    pub semester_id: Option<SemesterId>,
    pub weighted_average: f64,
    pub total_units: u32,
    pub subjects_taken: u32,
    pub updated_at: Timestamp,
}

/// GPA and standing of one student, per semester or rolled up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentGpa {
    pub student_id: StudentId,
    pub semester_id: Option<SemesterId>,
    pub weighted_average: f64,
    pub gpa: f64,
    pub academic_standing: AcademicStanding,
    pub updated_at: Timestamp,
}

/// Class statistics of one subject in one semester, over finalized records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassAverage {
    pub subject_code: SubjectCode,
    pub semester_id: SemesterId,
    pub subject_description: String,
    #[serde(flatten)]
    pub statistics: GradeStatistics,
    pub updated_at: Timestamp,
}

impl ClassAverage {
    pub fn total_students(&self) -> u32 {
        self.statistics.count
    }
}

/// Statistics over every finalized grade of a semester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemesterMetrics {
    pub semester_id: SemesterId,
    #[serde(flatten)]
    pub statistics: GradeStatistics,
    pub updated_at: Timestamp,
}

macro_rules! impl_aggregate {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Aggregate for $ty {
                fn updated_at(&self) -> Timestamp {
                    self.updated_at
                }

                fn set_updated_at(&mut self, at: Timestamp) {
                    self.updated_at = at;
                }
            }
        )*
    };
}

impl_aggregate!(StudentAverage, StudentGpa, ClassAverage, SemesterMetrics);
