//! Grade derivation and academic performance math.
//!
//! Every consumer (grade entry, reports, statistics) goes through this module so
//! there is one threshold table and one grade-point table.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_MARKS: f64 = 100.0;
pub const DEFAULT_CREDITS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradingError {
    #[error("max marks must be positive, got {max_marks}")]
    InvalidScale { max_marks: f64 },

    #[error("record {index} is malformed: {reason}")]
    InvalidRecord { index: usize, reason: String },

    #[error("record {index} has unknown grade {grade:?}")]
    UnknownGrade { index: usize, grade: String },
}

impl GradingError {
    pub fn code(&self) -> &'static str {
        match self {
            GradingError::InvalidScale { .. } => "invalid_scale",
            GradingError::InvalidRecord { .. } => "invalid_record",
            GradingError::UnknownGrade { .. } => "unknown_grade",
        }
    }

    fn invalid_record(index: usize, reason: impl Into<String>) -> Self {
        GradingError::InvalidRecord {
            index,
            reason: reason.into(),
        }
    }
}

/// Letter grades, declared best to worst so `Ord` follows rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "F")]
    F,
}

/// Lower percentage bound for each passing grade, checked top-down.
const THRESHOLDS: [(f64, Grade); 7] = [
    (90.0, Grade::APlus),
    (80.0, Grade::A),
    (70.0, Grade::BPlus),
    (60.0, Grade::B),
    (50.0, Grade::CPlus),
    (40.0, Grade::C),
    (33.0, Grade::D),
];

impl Grade {
    pub const ALL: [Grade; 8] = [
        Grade::APlus,
        Grade::A,
        Grade::BPlus,
        Grade::B,
        Grade::CPlus,
        Grade::C,
        Grade::D,
        Grade::F,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::CPlus => "C+",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }

    pub fn points(self) -> f64 {
        match self {
            Grade::APlus => 4.0,
            Grade::A => 3.7,
            Grade::BPlus => 3.3,
            Grade::B => 3.0,
            Grade::CPlus => 2.7,
            Grade::C => 2.3,
            Grade::D => 2.0,
            Grade::F => 0.0,
        }
    }

    /// Lowest percentage that still earns this grade.
    pub fn lower_bound(self) -> f64 {
        THRESHOLDS
            .iter()
            .find(|(_, g)| *g == self)
            .map(|(min, _)| *min)
            .unwrap_or(0.0)
    }

    pub fn is_passing(self) -> bool {
        self != Grade::F
    }

    pub fn from_percentage(percentage: f64) -> Grade {
        THRESHOLDS
            .iter()
            .find(|(min, _)| percentage >= *min)
            .map(|(_, g)| *g)
            .unwrap_or(Grade::F)
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown grade letter {0:?}")]
pub struct UnknownGradeLetter(pub String);

impl FromStr for Grade {
    type Err = UnknownGradeLetter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Grade::ALL
            .iter()
            .copied()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| UnknownGradeLetter(s.to_string()))
    }
}

/// Two-decimal rounding applied to every reported average. Rounds the exact
/// binary value half away from zero, so 2.675 (stored as 2.67499...) gives 2.67.
pub fn round_off_2_decimals(x: f64) -> f64 {
    let Some(exact) = Decimal::from_f64_retain(x) else {
        return x;
    };
    let rounded = exact.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.mantissa() as f64 / 10f64.powi(rounded.scale() as i32)
}

fn check_scale(max_marks: f64) -> Result<(), GradingError> {
    if max_marks.is_finite() && max_marks > 0.0 {
        Ok(())
    } else {
        Err(GradingError::InvalidScale { max_marks })
    }
}

/// Classify `marks` against `max_marks`. The percentage is not rounded first,
/// and marks above the scale are not clamped.
pub fn classify(marks: f64, max_marks: f64) -> Result<Grade, GradingError> {
    check_scale(max_marks)?;
    Ok(Grade::from_percentage(marks / max_marks * 100.0))
}

pub fn percentage(marks: f64, max_marks: f64) -> Result<f64, GradingError> {
    check_scale(max_marks)?;
    Ok(round_off_2_decimals(marks / max_marks * 100.0))
}

/// One scored assessment as handed over by the record-fetch side. `grade` is
/// kept as stored so corrupted values surface as `UnknownGrade`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradedRecord {
    pub marks: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_marks: Option<f64>,
    pub grade: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<f64>,
}

impl GradedRecord {
    pub fn new(marks: f64, grade: impl Into<String>) -> Self {
        Self {
            marks,
            max_marks: None,
            grade: grade.into(),
            credits: None,
        }
    }

    pub fn with_credits(mut self, credits: f64) -> Self {
        self.credits = Some(credits);
        self
    }

    pub fn with_max_marks(mut self, max_marks: f64) -> Self {
        self.max_marks = Some(max_marks);
        self
    }

    pub fn max_marks_or_default(&self) -> f64 {
        self.max_marks.unwrap_or(DEFAULT_MAX_MARKS)
    }

    pub fn credits_or_default(&self) -> f64 {
        self.credits.unwrap_or(DEFAULT_CREDITS)
    }

    /// Build a record from an untyped JSON object. `index` is reported back in
    /// the error so callers can point at the bad row.
    pub fn from_json(index: usize, raw: &serde_json::Value) -> Result<Self, GradingError> {
        let Some(obj) = raw.as_object() else {
            return Err(GradingError::invalid_record(index, "record must be an object"));
        };

        let marks = match obj.get("marks") {
            None | Some(serde_json::Value::Null) => {
                return Err(GradingError::invalid_record(index, "missing marks"));
            }
            Some(v) => match v.as_f64() {
                Some(n) => n,
                None => return Err(GradingError::invalid_record(index, "marks must be numeric")),
            },
        };

        let grade = match obj.get("grade").and_then(|v| v.as_str()) {
            Some(g) => g.to_string(),
            None => return Err(GradingError::invalid_record(index, "missing grade")),
        };

        let optional_number = |key: &str| -> Result<Option<f64>, GradingError> {
            match obj.get(key) {
                None | Some(serde_json::Value::Null) => Ok(None),
                Some(v) => v.as_f64().map(Some).ok_or_else(|| {
                    GradingError::invalid_record(index, format!("{} must be numeric", key))
                }),
            }
        };

        Ok(GradedRecord {
            marks,
            max_marks: optional_number("maxMarks")?,
            grade,
            credits: optional_number("credits")?,
        })
    }
}

pub fn records_from_json(raw: &[serde_json::Value]) -> Result<Vec<GradedRecord>, GradingError> {
    raw.iter()
        .enumerate()
        .map(|(i, v)| GradedRecord::from_json(i, v))
        .collect()
}

fn parse_grade(index: usize, record: &GradedRecord) -> Result<Grade, GradingError> {
    record
        .grade
        .parse::<Grade>()
        .map_err(|_| GradingError::UnknownGrade {
            index,
            grade: record.grade.clone(),
        })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub total_subjects: usize,
    pub total_marks: f64,
    pub average_marks: f64,
    pub passed_subjects: usize,
    pub failed_subjects: usize,
    pub pass_percentage: f64,
    pub grade_distribution: BTreeMap<Grade, usize>,
}

impl Default for PerformanceSummary {
    fn default() -> Self {
        Self {
            total_subjects: 0,
            total_marks: 0.0,
            average_marks: 0.0,
            passed_subjects: 0,
            failed_subjects: 0,
            pass_percentage: 0.0,
            grade_distribution: BTreeMap::new(),
        }
    }
}

pub fn aggregate(records: &[GradedRecord]) -> Result<PerformanceSummary, GradingError> {
    if records.is_empty() {
        return Ok(PerformanceSummary::default());
    }

    let mut total_marks = 0.0_f64;
    let mut passed_subjects = 0_usize;
    let mut grade_distribution: BTreeMap<Grade, usize> = BTreeMap::new();

    for (i, r) in records.iter().enumerate() {
        if !r.marks.is_finite() {
            return Err(GradingError::invalid_record(i, "marks must be a finite number"));
        }
        if r.marks < 0.0 {
            return Err(GradingError::invalid_record(i, "marks must not be negative"));
        }
        let grade = parse_grade(i, r)?;

        // Raw sum even when scales differ between subjects.
        total_marks += r.marks;
        if grade.is_passing() {
            passed_subjects += 1;
        }
        *grade_distribution.entry(grade).or_insert(0) += 1;
    }

    let total_subjects = records.len();
    let n = total_subjects as f64;
    Ok(PerformanceSummary {
        total_subjects,
        total_marks,
        average_marks: round_off_2_decimals(total_marks / n),
        passed_subjects,
        failed_subjects: total_subjects - passed_subjects,
        pass_percentage: round_off_2_decimals(passed_subjects as f64 / n * 100.0),
        grade_distribution,
    })
}

/// Credit-weighted grade-point average. Empty input and zero total credits
/// both mean "no data yet" and yield 0.
pub fn compute_gpa(records: &[GradedRecord]) -> Result<f64, GradingError> {
    let mut weighted_sum = 0.0_f64;
    let mut total_weight = 0.0_f64;

    for (i, r) in records.iter().enumerate() {
        let points = parse_grade(i, r)?.points();
        let weight = r.credits_or_default();
        if !weight.is_finite() || weight < 0.0 {
            return Err(GradingError::invalid_record(
                i,
                "credits must be a non-negative number",
            ));
        }
        weighted_sum += points * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        Ok(round_off_2_decimals(weighted_sum / total_weight))
    } else {
        Ok(0.0)
    }
}

/// Summary plus GPA, the shape embedded in student-facing reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    #[serde(flatten)]
    pub summary: PerformanceSummary,
    pub gpa: f64,
}

pub fn performance_report(records: &[GradedRecord]) -> Result<PerformanceReport, GradingError> {
    Ok(PerformanceReport {
        summary: aggregate(records)?,
        gpa: compute_gpa(records)?,
    })
}
