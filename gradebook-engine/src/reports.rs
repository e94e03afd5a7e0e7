//! Report service: the cached read path.
//!
//! Every report is a read-through over the query cache. On a miss the
//! report is computed from the aggregate store, falling back to the ledger
//! when an aggregate has not been materialized yet, and stored under the
//! dependency tags of the data it read.

use gradebook_core::{
    round2, AcademicStanding, GradeStatistics, GradebookResult, LedgerError, Semester,
    SemesterId, StatusFilter, StudentGpa, StudentId, SubjectCode, Term, PASSING_GRADE,
};
use gradebook_storage::{
    AggregateStore, CacheRead, Computed, DependencyTag, Endpoint, Fingerprint, Freshness,
    GradeLedger, QueryParams,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use crate::context::EngineContext;
use crate::maintainer::{
    class_statistics, rollup_aggregates, semester_statistics, student_aggregates,
};

// ============================================================================
// REPORT PAYLOADS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectPerformance {
    pub subject_code: SubjectCode,
    pub description: String,
    pub grade: u8,
    pub units: u8,
    /// Class average of the subject in the same semester.
    pub class_average: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentPerformance {
    pub student_id: StudentId,
    pub semester_id: SemesterId,
    pub semester: Option<String>,
    pub subjects: Vec<SubjectPerformance>,
    pub weighted_average: f64,
    pub gpa: f64,
    pub academic_standing: AcademicStanding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentSummary {
    pub student_id: StudentId,
    pub weighted_average: f64,
    pub gpa: f64,
    pub academic_standing: AcademicStanding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentsPage {
    pub page: u32,
    pub page_size: u32,
    pub total_students: u32,
    pub total_pages: u32,
    pub students: Vec<StudentSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailingSubject {
    pub subject_code: SubjectCode,
    pub grade: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtRiskStudent {
    pub student_id: StudentId,
    pub semester_id: SemesterId,
    pub weighted_average: f64,
    pub failing_subjects: Vec<FailingSubject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtRiskPage {
    pub page: u32,
    pub per_page: u32,
    pub total: u32,
    pub semester_id: Option<SemesterId>,
    pub students: Vec<AtRiskStudent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentSubject {
    pub subject_code: SubjectCode,
    pub description: String,
    /// The student's mean grade in the subject over every semester taken.
    pub average_grade: f64,
    pub units: u8,
    pub semesters_taken: u32,
    /// Class average of the subject across semesters, weighted by class size.
    pub class_average: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemesterSummary {
    pub semester_id: SemesterId,
    pub term: Term,
    pub label: String,
    pub metrics: Option<GradeStatistics>,
}

/// First semester minus second semester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemesterChanges {
    pub average_grade: f64,
    pub passing_rate: f64,
    pub at_risk_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolYearSummary {
    pub school_years: Vec<u16>,
    pub school_year: Option<u16>,
    pub semesters: Vec<SemesterSummary>,
    pub changes: Option<SemesterChanges>,
}

// ============================================================================
// SERVICE
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReportService {
    ctx: EngineContext,
}

impl ReportService {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    async fn read_through<T, F, Fut>(
        &self,
        fingerprint: Fingerprint,
        compute: F,
    ) -> GradebookResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = GradebookResult<Computed<T>>>,
    {
        let endpoint = fingerprint.endpoint().to_string();
        let read = self
            .ctx
            .cache()
            .get_or_compute(fingerprint, Freshness::Cached, compute)
            .await?;
        if read.was_cache_hit() {
            tracing::debug!(
                %endpoint,
                age_ms = read.staleness().as_millis() as u64,
                "Report served from cache"
            );
        }
        Ok(read)
    }

    /// Subjects, grades and standing of one student in one semester.
    ///
    /// Without `semester_id` the first semester of the catalog is used.
    /// Fails with `StudentNotFound` when the student has no record there.
    pub async fn student_performance(
        &self,
        student_id: StudentId,
        semester_id: Option<SemesterId>,
    ) -> GradebookResult<CacheRead<StudentPerformance>> {
        let semester_id = match semester_id {
            Some(id) => id,
            None => self.default_semester(student_id).await?,
        };
        let params = QueryParams::new()
            .with("student_id", student_id.0)
            .with("semester_id", semester_id.0);
        let fingerprint = Fingerprint::for_endpoint(Endpoint::StudentPerformance, &params);

        self.read_through(fingerprint, || async move {
            let report = self.compute_student_performance(student_id, semester_id).await?;
            Ok(Computed::new(
                report,
                vec![
                    DependencyTag::Student(student_id),
                    DependencyTag::Semester(semester_id),
                ],
            ))
        })
        .await
    }

    async fn default_semester(&self, student_id: StudentId) -> GradebookResult<SemesterId> {
        if let Some(first) = self.ctx.ledger().semesters().await?.first() {
            return Ok(first.semester_id);
        }
        // Empty catalog: the student's earliest record.
        self.ctx
            .ledger()
            .find_by_student(student_id)
            .await?
            .first()
            .map(|r| r.semester_id)
            .ok_or_else(|| {
                LedgerError::StudentNotFound {
                    student_id,
                    semester_id: SemesterId(0),
                }
                .into()
            })
    }

    async fn compute_student_performance(
        &self,
        student_id: StudentId,
        semester_id: SemesterId,
    ) -> GradebookResult<StudentPerformance> {
        let ledger = self.ctx.ledger();
        let record = ledger
            .get(student_id, semester_id)
            .await?
            .ok_or(LedgerError::StudentNotFound {
                student_id,
                semester_id,
            })?;

        let mut subjects = Vec::with_capacity(record.entries().len());
        for entry in record.entries() {
            let description = self.description_of(&entry.subject_code).await?;
            let class_average = self
                .class_statistics(&entry.subject_code, semester_id)
                .await?
                .map(|s| s.average_grade);
            subjects.push(SubjectPerformance {
                subject_code: entry.subject_code.clone(),
                description,
                grade: entry.grade.value(),
                units: entry.units,
                class_average,
            });
        }

        let gpa = match self
            .ctx
            .aggregates()
            .student_gpa(student_id, Some(semester_id))
            .await?
        {
            Some(gpa) => gpa,
            None => student_aggregates(&record, self.ctx.config().gpa_scale).1,
        };

        Ok(StudentPerformance {
            student_id,
            semester_id,
            semester: ledger.semester(semester_id).await?.map(|s| s.label()),
            subjects,
            weighted_average: round2(gpa.weighted_average),
            gpa: gpa.gpa,
            academic_standing: gpa.academic_standing,
        })
    }

    /// One page of every student's rollup, `performance_page_size` per page.
    /// Pages start at 1; lower values are read as 1.
    pub async fn all_students_performance(
        &self,
        page: i64,
    ) -> GradebookResult<CacheRead<StudentsPage>> {
        let page = normalize_page(page);
        let params = QueryParams::new().with("page", page);
        let fingerprint = Fingerprint::for_endpoint(Endpoint::AllStudentsPerformance, &params);

        self.read_through(fingerprint, || async move {
            let report = self.compute_students_page(page).await?;
            Ok(Computed::new(report, vec![DependencyTag::AnyGrade]))
        })
        .await
    }

    async fn compute_students_page(&self, page: u32) -> GradebookResult<StudentsPage> {
        let page_size = self.ctx.config().performance_page_size;
        let students = self.ctx.ledger().list_students().await?;
        let total_students = students.len() as u32;

        let mut summaries = Vec::new();
        for student_id in paginate(&students, page, page_size) {
            if let Some(gpa) = self.rollup_gpa(*student_id).await? {
                summaries.push(StudentSummary {
                    student_id: *student_id,
                    weighted_average: round2(gpa.weighted_average),
                    gpa: gpa.gpa,
                    academic_standing: gpa.academic_standing,
                });
            }
        }

        Ok(StudentsPage {
            page,
            page_size,
            total_students,
            total_pages: total_students.div_ceil(page_size),
            students: summaries,
        })
    }

    async fn rollup_gpa(&self, student_id: StudentId) -> GradebookResult<Option<StudentGpa>> {
        if let Some(gpa) = self.ctx.aggregates().student_gpa(student_id, None).await? {
            return Ok(Some(gpa));
        }
        let records = self.ctx.ledger().find_by_student(student_id).await?;
        Ok(rollup_aggregates(student_id, &records, self.ctx.config().gpa_scale).map(|(_, gpa)| gpa))
    }

    /// Records holding at least one grade below the passing grade.
    ///
    /// `per_page` is clamped to `[1, at_risk_page_size_max]`.
    pub async fn at_risk_students(
        &self,
        page: i64,
        per_page: Option<u32>,
        semester_id: Option<SemesterId>,
    ) -> GradebookResult<CacheRead<AtRiskPage>> {
        let page = normalize_page(page);
        let per_page = self.ctx.config().clamp_at_risk_page_size(per_page);
        let params = QueryParams::new()
            .with("page", page)
            .with("per_page", per_page)
            .with_opt("semester_id", semester_id.map(|s| s.0));
        let fingerprint = Fingerprint::for_endpoint(Endpoint::AtRisk, &params);
        let tag = match semester_id {
            Some(id) => DependencyTag::Semester(id),
            None => DependencyTag::AnyGrade,
        };

        self.read_through(fingerprint, || async move {
            let report = self.compute_at_risk(page, per_page, semester_id).await?;
            Ok(Computed::new(report, vec![tag]))
        })
        .await
    }

    async fn compute_at_risk(
        &self,
        page: u32,
        per_page: u32,
        semester_id: Option<SemesterId>,
    ) -> GradebookResult<AtRiskPage> {
        let ledger = self.ctx.ledger();
        let records = match semester_id {
            Some(id) => ledger.find_by_semester(id, StatusFilter::Any).await?,
            None => {
                let mut all = Vec::new();
                for student_id in ledger.list_students().await? {
                    all.extend(ledger.find_by_student(student_id).await?);
                }
                all
            }
        };

        let at_risk: Vec<AtRiskStudent> = records
            .iter()
            .filter_map(|record| {
                let failing_subjects: Vec<FailingSubject> = record
                    .entries()
                    .iter()
                    .filter(|e| e.grade.value() < PASSING_GRADE)
                    .map(|e| FailingSubject {
                        subject_code: e.subject_code.clone(),
                        grade: e.grade.value(),
                    })
                    .collect();
                if failing_subjects.is_empty() {
                    return None;
                }
                Some(AtRiskStudent {
                    student_id: record.student_id,
                    semester_id: record.semester_id,
                    weighted_average: round2(
                        gradebook_core::weighted_average(record.entries()).value,
                    ),
                    failing_subjects,
                })
            })
            .collect();

        Ok(AtRiskPage {
            page,
            per_page,
            total: at_risk.len() as u32,
            semester_id,
            students: paginate(&at_risk, page, per_page).to_vec(),
        })
    }

    /// Every subject the student has taken, across semesters.
    ///
    /// An unknown student yields an empty list.
    pub async fn student_subjects(
        &self,
        student_id: StudentId,
    ) -> GradebookResult<CacheRead<Vec<StudentSubject>>> {
        let params = QueryParams::new().with("student_id", student_id.0);
        let fingerprint = Fingerprint::for_endpoint(Endpoint::StudentSubjects, &params);

        self.read_through(fingerprint, || async move {
            self.compute_student_subjects(student_id).await
        })
        .await
    }

    async fn compute_student_subjects(
        &self,
        student_id: StudentId,
    ) -> GradebookResult<Computed<Vec<StudentSubject>>> {
        let records = self.ctx.ledger().find_by_student(student_id).await?;
        let mut tags: BTreeSet<DependencyTag> = BTreeSet::new();
        tags.insert(DependencyTag::Student(student_id));

        // subject -> (grade sum, semesters, units)
        let mut taken: BTreeMap<SubjectCode, (u32, u32, u8)> = BTreeMap::new();
        for record in &records {
            tags.insert(DependencyTag::Semester(record.semester_id));
            for entry in record.entries() {
                let slot = taken.entry(entry.subject_code.clone()).or_insert((0, 0, entry.units));
                slot.0 += u32::from(entry.grade.value());
                slot.1 += 1;
            }
        }

        let mut subjects = Vec::with_capacity(taken.len());
        for (subject_code, (sum, semesters_taken, units)) in taken {
            tags.insert(DependencyTag::Subject(subject_code.clone()));
            let class_average = self.class_average_across_semesters(&subject_code).await?;
            subjects.push(StudentSubject {
                description: self.description_of(&subject_code).await?,
                average_grade: round2(f64::from(sum) / f64::from(semesters_taken)),
                units,
                semesters_taken,
                class_average,
                subject_code,
            });
        }

        Ok(Computed::new(subjects, tags.into_iter().collect()))
    }

    async fn class_average_across_semesters(
        &self,
        subject_code: &SubjectCode,
    ) -> GradebookResult<Option<f64>> {
        let classes = self
            .ctx
            .aggregates()
            .class_averages_for_subject(subject_code)
            .await?;
        let students: u32 = classes.iter().map(|c| c.total_students()).sum();
        if students == 0 {
            return Ok(None);
        }
        let weighted: f64 = classes
            .iter()
            .map(|c| c.statistics.average_grade * f64::from(c.total_students()))
            .sum();
        Ok(Some(round2(weighted / f64::from(students))))
    }

    /// Without `school_year`: the list of school years in the catalog. With
    /// it: that year's semester metrics and, for a two-semester year, the
    /// change from the first semester to the second.
    pub async fn school_year_summary(
        &self,
        school_year: Option<u16>,
    ) -> GradebookResult<CacheRead<SchoolYearSummary>> {
        let params = QueryParams::new().with_opt("sy", school_year);
        let fingerprint = Fingerprint::for_endpoint(Endpoint::SchoolYearSummary, &params);

        self.read_through(fingerprint, || async move {
            self.compute_school_year_summary(school_year).await
        })
        .await
    }

    async fn compute_school_year_summary(
        &self,
        school_year: Option<u16>,
    ) -> GradebookResult<Computed<SchoolYearSummary>> {
        let catalog = self.ctx.ledger().semesters().await?;
        let school_years: Vec<u16> = catalog
            .iter()
            .map(|s| s.school_year)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let Some(year) = school_year else {
            let summary = SchoolYearSummary {
                school_years,
                school_year: None,
                semesters: Vec::new(),
                changes: None,
            };
            return Ok(Computed::new(summary, vec![DependencyTag::AnyGrade]));
        };

        let in_year: Vec<&Semester> = catalog.iter().filter(|s| s.school_year == year).collect();
        let mut tags = vec![DependencyTag::SchoolYear(year)];
        let mut semesters = Vec::with_capacity(in_year.len());
        for semester in in_year {
            tags.push(DependencyTag::Semester(semester.semester_id));
            semesters.push(SemesterSummary {
                semester_id: semester.semester_id,
                term: semester.term,
                label: semester.label(),
                metrics: self.semester_statistics(semester.semester_id).await?,
            });
        }

        let changes = match semesters.as_slice() {
            [first, second] => match (&first.metrics, &second.metrics) {
                (Some(a), Some(b)) => Some(SemesterChanges {
                    average_grade: round2(a.average_grade - b.average_grade),
                    passing_rate: round2(a.passing_rate - b.passing_rate),
                    at_risk_rate: round2(a.at_risk_rate - b.at_risk_rate),
                }),
                _ => None,
            },
            _ => None,
        };

        let summary = SchoolYearSummary {
            school_years,
            school_year: Some(year),
            semesters,
            changes,
        };
        Ok(Computed::new(summary, tags))
    }

    /// Class statistics of one subject in one semester; `None` without
    /// finalized grades.
    pub async fn class_average(
        &self,
        subject_code: &SubjectCode,
        semester_id: SemesterId,
    ) -> GradebookResult<CacheRead<Option<gradebook_core::ClassAverage>>> {
        let params = QueryParams::new()
            .with("subject_code", subject_code.as_str())
            .with("semester_id", semester_id.0);
        let fingerprint = Fingerprint::for_endpoint(Endpoint::ClassAverage, &params);

        self.read_through(fingerprint, || async move {
            let stored = self
                .ctx
                .aggregates()
                .class_average(subject_code, semester_id)
                .await?;
            let report = match stored {
                Some(class) => Some(class),
                None => match self.class_statistics(subject_code, semester_id).await? {
                    Some(statistics) => Some(gradebook_core::ClassAverage {
                        subject_code: subject_code.clone(),
                        semester_id,
                        subject_description: self.description_of(subject_code).await?,
                        statistics,
                        updated_at: chrono::Utc::now(),
                    }),
                    None => None,
                },
            };
            Ok(Computed::new(
                report,
                vec![
                    DependencyTag::Subject(subject_code.clone()),
                    DependencyTag::Semester(semester_id),
                ],
            ))
        })
        .await
    }

    // ========================================================================
    // AGGREGATE LOOKUPS WITH LEDGER FALLBACK
    // ========================================================================

    async fn class_statistics(
        &self,
        subject_code: &SubjectCode,
        semester_id: SemesterId,
    ) -> GradebookResult<Option<GradeStatistics>> {
        if let Some(class) = self
            .ctx
            .aggregates()
            .class_average(subject_code, semester_id)
            .await?
        {
            return Ok(Some(class.statistics));
        }
        let records = self
            .ctx
            .ledger()
            .find_by_subject_and_semester(subject_code, semester_id, StatusFilter::finalized())
            .await?;
        Ok(class_statistics(&records, subject_code))
    }

    async fn semester_statistics(
        &self,
        semester_id: SemesterId,
    ) -> GradebookResult<Option<GradeStatistics>> {
        if let Some(metrics) = self.ctx.aggregates().semester_metrics(semester_id).await? {
            return Ok(Some(metrics.statistics));
        }
        let records = self
            .ctx
            .ledger()
            .find_by_semester(semester_id, StatusFilter::finalized())
            .await?;
        Ok(semester_statistics(&records))
    }

    async fn description_of(&self, subject_code: &SubjectCode) -> GradebookResult<String> {
        Ok(self
            .ctx
            .ledger()
            .subject(subject_code)
            .await?
            .map(|s| s.description)
            .unwrap_or_default())
    }
}

fn normalize_page(page: i64) -> u32 {
    u32::try_from(page.max(1)).unwrap_or(u32::MAX)
}

fn paginate<T>(items: &[T], page: u32, page_size: u32) -> &[T] {
    let start = (page as usize - 1).saturating_mul(page_size as usize);
    if start >= items.len() {
        return &[];
    }
    let end = start.saturating_add(page_size as usize).min(items.len());
    &items[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_page() {
        assert_eq!(normalize_page(-3), 1);
        assert_eq!(normalize_page(0), 1);
        assert_eq!(normalize_page(4), 4);
        assert_eq!(normalize_page(i64::MAX), u32::MAX);
    }

    #[test]
    fn test_paginate() {
        let items: Vec<u32> = (1..=25).collect();
        assert_eq!(paginate(&items, 1, 10), &items[0..10]);
        assert_eq!(paginate(&items, 3, 10), &[21, 22, 23, 24, 25]);
        assert!(paginate(&items, 4, 10).is_empty());
        assert!(paginate(&items, u32::MAX, 10).is_empty());
    }
}
