//! Grading policy: GPA scales, academic standing, and grade statistics.
//!
//! Everything here is pure and total. Out-of-domain input (NaN, negative,
//! non-finite) maps to the failing end of each scale instead of panicking.

use crate::{Grade, GradeEntry, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lowest grade that counts as passing. Grades below it are at risk.
pub const PASSING_GRADE: u8 = 75;

/// Round to two decimal places, as reports present averages and rates.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// GPA SCALES
// ============================================================================

/// Step table used to map a weighted average onto a GPA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpaScale {
    /// 1.00 (best) to 5.00 (failed).
    #[default]
    Philippine,
    /// 4.0 (best) to 0.0 (failed).
    FourPoint,
}

const PHILIPPINE_STEPS: &[(f64, f64)] = &[
    (96.0, 1.00),
    (93.0, 1.25),
    (90.0, 1.50),
    (87.0, 1.75),
    (84.0, 2.00),
    (80.0, 2.25),
    (78.0, 2.50),
    (76.0, 2.75),
];

const FOUR_POINT_STEPS: &[(f64, f64)] = &[
    (97.0, 4.0),
    (94.0, 3.75),
    (91.0, 3.5),
    (88.0, 3.25),
    (85.0, 3.0),
    (82.0, 2.75),
    (79.0, 2.5),
    (76.0, 2.25),
    (73.0, 2.0),
    (70.0, 1.75),
    (67.0, 1.5),
    (64.0, 1.25),
    (60.0, 1.0),
];

impl GpaScale {
    /// GPA assigned when the average fails every step.
    pub fn failing_value(&self) -> f64 {
        match self {
            GpaScale::Philippine => 5.00,
            GpaScale::FourPoint => 0.0,
        }
    }

    /// Map a weighted average onto this scale.
    pub fn gpa_of(&self, weighted_average: f64) -> f64 {
        if !weighted_average.is_finite() || weighted_average < 0.0 {
            return self.failing_value();
        }

        let steps = match self {
            GpaScale::Philippine => PHILIPPINE_STEPS,
            GpaScale::FourPoint => FOUR_POINT_STEPS,
        };
        if let Some((_, gpa)) = steps.iter().find(|(floor, _)| weighted_average >= *floor) {
            return *gpa;
        }

        // The Philippine table has a single exact step at 75: anything in
        // (75, 76) falls through to failed.
        if *self == GpaScale::Philippine && weighted_average == f64::from(PASSING_GRADE) {
            return 3.00;
        }
        self.failing_value()
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            GpaScale::Philippine => "philippine",
            GpaScale::FourPoint => "four_point",
        }
    }
}

impl fmt::Display for GpaScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for GpaScale {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "philippine" | "ph" => Ok(GpaScale::Philippine),
            "four_point" | "fourpoint" | "4" | "4.0" => Ok(GpaScale::FourPoint),
            other => Err(ValidationError::InvalidValue {
                field: "gpa_scale".to_string(),
                reason: format!("unknown GPA scale '{}'", other),
            }),
        }
    }
}

/// GPA on the default (Philippine) scale.
pub fn gpa_of(weighted_average: f64) -> f64 {
    GpaScale::default().gpa_of(weighted_average)
}

// ============================================================================
// ACADEMIC STANDING
// ============================================================================

/// Academic standing derived from a GPA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcademicStanding {
    Good,
    Warning,
    Probation,
    Dismissed,
}

impl AcademicStanding {
    /// Ordering rank: higher is better.
    pub fn rank(&self) -> u8 {
        match self {
            AcademicStanding::Dismissed => 0,
            AcademicStanding::Probation => 1,
            AcademicStanding::Warning => 2,
            AcademicStanding::Good => 3,
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            AcademicStanding::Good => "good",
            AcademicStanding::Warning => "warning",
            AcademicStanding::Probation => "probation",
            AcademicStanding::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for AcademicStanding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for AcademicStanding {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "good" => Ok(AcademicStanding::Good),
            "warning" => Ok(AcademicStanding::Warning),
            "probation" => Ok(AcademicStanding::Probation),
            "dismissed" => Ok(AcademicStanding::Dismissed),
            other => Err(ValidationError::InvalidValue {
                field: "academic_standing".to_string(),
                reason: format!("unknown academic standing '{}'", other),
            }),
        }
    }
}

/// Standing for a GPA: >=3.0 good, >=2.0 warning, >=1.0 probation, else dismissed.
///
/// The cutoffs are applied to the GPA value as-is, whatever scale produced it.
pub fn standing_of(gpa: f64) -> AcademicStanding {
    if gpa >= 3.0 {
        AcademicStanding::Good
    } else if gpa >= 2.0 {
        AcademicStanding::Warning
    } else if gpa >= 1.0 {
        AcademicStanding::Probation
    } else {
        AcademicStanding::Dismissed
    }
}

/// Standing for a weighted average under `scale`. Out-of-domain averages are dismissed.
pub fn standing_for_average(scale: GpaScale, weighted_average: f64) -> AcademicStanding {
    if !weighted_average.is_finite() || weighted_average < 0.0 {
        return AcademicStanding::Dismissed;
    }
    standing_of(scale.gpa_of(weighted_average))
}

// ============================================================================
// AVERAGES AND STATISTICS
// ============================================================================

/// Result of a units-weighted average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedAverage {
    pub value: f64,
    pub total_units: u32,
    pub subjects: u32,
}

/// Σ(grade × units) / Σ(units); 0.0 when there are no units.
pub fn weighted_average<'a>(entries: impl IntoIterator<Item = &'a GradeEntry>) -> WeightedAverage {
    let mut weighted_sum: u64 = 0;
    let mut total_units: u32 = 0;
    let mut subjects: u32 = 0;
    for entry in entries {
        weighted_sum += u64::from(entry.grade.value()) * u64::from(entry.units);
        total_units += u32::from(entry.units);
        subjects += 1;
    }

    let value = if total_units == 0 {
        0.0
    } else {
        weighted_sum as f64 / f64::from(total_units)
    };
    WeightedAverage {
        value,
        total_units,
        subjects,
    }
}

/// Letter bucket counts: A >=97, B 94-96, C 91-93, D 88-90, F below 88.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct GradeDistribution {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
    pub f: u32,
}

impl GradeDistribution {
    pub fn record(&mut self, grade: Grade) {
        match grade.value() {
            97..=u8::MAX => self.a += 1,
            94..=96 => self.b += 1,
            91..=93 => self.c += 1,
            88..=90 => self.d += 1,
            _ => self.f += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.a + self.b + self.c + self.d + self.f
    }
}

/// Statistics over a set of grades. Rates are percentages in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeStatistics {
    pub average_grade: f64,
    pub passing_rate: f64,
    pub at_risk_rate: f64,
    pub top_grade: u8,
    pub grade_distribution: GradeDistribution,
    #[serde(rename = "total")]
    pub count: u32,
}

impl GradeStatistics {
    /// Compute statistics; `None` when there are no grades.
    pub fn from_grades(grades: impl IntoIterator<Item = Grade>) -> Option<Self> {
        let mut count: u32 = 0;
        let mut sum: u64 = 0;
        let mut passing: u32 = 0;
        let mut top_grade: u8 = 0;
        let mut grade_distribution = GradeDistribution::default();

        for grade in grades {
            count += 1;
            sum += u64::from(grade.value());
            if grade.value() >= PASSING_GRADE {
                passing += 1;
            }
            top_grade = top_grade.max(grade.value());
            grade_distribution.record(grade);
        }

        if count == 0 {
            return None;
        }

        let total = f64::from(count);
        Some(Self {
            average_grade: round2(sum as f64 / total),
            passing_rate: round2(f64::from(passing) / total * 100.0),
            at_risk_rate: round2(f64::from(count - passing) / total * 100.0),
            top_grade,
            grade_distribution,
            count,
        })
    }
}
