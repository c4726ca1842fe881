use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance used when checking that component weights sum to one.
pub const WEIGHT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CurriculumId {
    Cbc,
    Igcse,
    Standard,
}

impl CurriculumId {
    pub const ALL: [CurriculumId; 3] = [
        CurriculumId::Cbc,
        CurriculumId::Igcse,
        CurriculumId::Standard,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CurriculumId::Cbc => "CBC",
            CurriculumId::Igcse => "IGCSE",
            CurriculumId::Standard => "STANDARD",
        }
    }

    /// Strict token match. Case, whitespace and punctuation are ignored, so
    /// "8-4-4", "Standard 844" and "standard" all land on `Standard`.
    pub fn from_token(token: &str) -> Option<CurriculumId> {
        let normalized: String = token
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "cbc" | "competencybased" | "competencybasedcurriculum" => Some(CurriculumId::Cbc),
            "igcse" | "cambridge" | "cambridgeigcse" => Some(CurriculumId::Igcse),
            "standard" | "844" | "standard844" | "kcse" => Some(CurriculumId::Standard),
            _ => None,
        }
    }

    pub fn builtin_profile(self) -> CurriculumProfile {
        match self {
            CurriculumId::Cbc => cbc_profile(),
            CurriculumId::Igcse => igcse_profile(),
            CurriculumId::Standard => standard_profile(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentWeight {
    pub name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBoundary {
    pub label: String,
    pub min_percent: f64,
}

/// One grading scheme: how raw components combine into a percentage and how
/// that percentage maps onto a label.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurriculumProfile {
    pub id: CurriculumId,
    pub components: Vec<ComponentWeight>,
    /// Strictly descending by `min_percent`, last threshold is 0.
    pub boundaries: Vec<GradeBoundary>,
    pub labels: Vec<String>,
    /// Labels that count against the pass rate. Empty means the scheme has
    /// no fail concept.
    pub failing_labels: Vec<String>,
    pub ranks_students: bool,
    pub allows_label_override: bool,
    pub custom_boundaries: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    #[error("boundary table is empty")]
    EmptyBoundaries,
    #[error("label {label:?} is not part of the {curriculum} label set")]
    UnknownLabel { label: String, curriculum: &'static str },
    #[error("label {label:?} appears more than once")]
    DuplicateLabel { label: String },
    #[error("threshold {min_percent} for {label:?} must be within 0..=100")]
    OutOfRange { label: String, min_percent: f64 },
    #[error("threshold {min_percent} for {label:?} is not strictly below the previous one")]
    NotDescending { label: String, min_percent: f64 },
    #[error("lowest threshold must be 0, got {min_percent}")]
    LowestNotZero { min_percent: f64 },
    #[error("component weights sum to {sum}, expected 1")]
    WeightSum { sum: f64 },
}

fn component(name: &str, weight: f64) -> ComponentWeight {
    ComponentWeight {
        name: name.to_string(),
        weight,
    }
}

fn boundaries(table: &[(&str, f64)]) -> Vec<GradeBoundary> {
    table
        .iter()
        .map(|(label, min_percent)| GradeBoundary {
            label: label.to_string(),
            min_percent: *min_percent,
        })
        .collect()
}

fn labels_of(table: &[(&str, f64)]) -> Vec<String> {
    table.iter().map(|(label, _)| label.to_string()).collect()
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

const CBC_BANDS: [(&str, f64); 4] = [("EE", 80.0), ("ME", 60.0), ("AE", 40.0), ("BE", 0.0)];

const IGCSE_BANDS: [(&str, f64); 9] = [
    ("A*", 90.0),
    ("A", 80.0),
    ("B", 70.0),
    ("C", 60.0),
    ("D", 50.0),
    ("E", 40.0),
    ("F", 30.0),
    ("G", 20.0),
    ("U", 0.0),
];

const STANDARD_BANDS: [(&str, f64); 13] = [
    ("A+", 90.0),
    ("A", 80.0),
    ("A-", 75.0),
    ("B+", 70.0),
    ("B", 65.0),
    ("B-", 60.0),
    ("C+", 55.0),
    ("C", 50.0),
    ("C-", 45.0),
    ("D+", 40.0),
    ("D", 35.0),
    ("D-", 30.0),
    ("E", 0.0),
];

pub fn cbc_profile() -> CurriculumProfile {
    CurriculumProfile {
        id: CurriculumId::Cbc,
        components: vec![component("formative", 0.4), component("summative", 0.6)],
        boundaries: boundaries(&CBC_BANDS),
        labels: labels_of(&CBC_BANDS),
        failing_labels: Vec::new(),
        ranks_students: false,
        allows_label_override: false,
        custom_boundaries: false,
    }
}

pub fn igcse_profile() -> CurriculumProfile {
    CurriculumProfile {
        id: CurriculumId::Igcse,
        components: vec![component("coursework", 0.3), component("exam", 0.7)],
        boundaries: boundaries(&IGCSE_BANDS),
        labels: labels_of(&IGCSE_BANDS),
        failing_labels: to_strings(&["D", "E", "F", "G", "U"]),
        ranks_students: false,
        allows_label_override: true,
        custom_boundaries: false,
    }
}

pub fn standard_profile() -> CurriculumProfile {
    CurriculumProfile {
        id: CurriculumId::Standard,
        components: vec![component("score", 1.0)],
        boundaries: boundaries(&STANDARD_BANDS),
        labels: labels_of(&STANDARD_BANDS),
        failing_labels: to_strings(&["C-", "D+", "D", "D-", "E"]),
        ranks_students: true,
        allows_label_override: true,
        custom_boundaries: false,
    }
}

/// Maps a free-form curriculum token to a built-in profile. Unrecognized
/// tokens fall back to the Standard profile.
pub fn resolve_profile(curriculum_type_token: &str) -> CurriculumProfile {
    CurriculumId::from_token(curriculum_type_token)
        .unwrap_or(CurriculumId::Standard)
        .builtin_profile()
}

pub fn builtin_profiles() -> Vec<CurriculumProfile> {
    CurriculumId::ALL
        .iter()
        .map(|id| id.builtin_profile())
        .collect()
}

impl CurriculumProfile {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn is_failing(&self, label: &str) -> bool {
        self.failing_labels.iter().any(|l| l == label)
    }

    pub fn component(&self, name: &str) -> Option<&ComponentWeight> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Returns a session-scoped copy of this profile using `table` as its
    /// boundary table. The label set and weights stay untouched.
    pub fn with_boundaries(
        &self,
        table: Vec<GradeBoundary>,
    ) -> Result<CurriculumProfile, ProfileError> {
        let mut out = self.clone();
        out.boundaries = table;
        out.custom_boundaries = true;
        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        let sum: f64 = self.components.iter().map(|c| c.weight).sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(ProfileError::WeightSum { sum });
        }
        validate_boundaries(self.id, &self.labels, &self.boundaries)
    }
}

pub fn validate_boundaries(
    curriculum: CurriculumId,
    labels: &[String],
    table: &[GradeBoundary],
) -> Result<(), ProfileError> {
    let Some(last) = table.last() else {
        return Err(ProfileError::EmptyBoundaries);
    };

    let mut previous: Option<f64> = None;
    for (i, b) in table.iter().enumerate() {
        if !labels.iter().any(|l| *l == b.label) {
            return Err(ProfileError::UnknownLabel {
                label: b.label.clone(),
                curriculum: curriculum.as_str(),
            });
        }
        if table[..i].iter().any(|prev| prev.label == b.label) {
            return Err(ProfileError::DuplicateLabel {
                label: b.label.clone(),
            });
        }
        if !b.min_percent.is_finite() || b.min_percent < 0.0 || b.min_percent > 100.0 {
            return Err(ProfileError::OutOfRange {
                label: b.label.clone(),
                min_percent: b.min_percent,
            });
        }
        if let Some(prev) = previous {
            if b.min_percent >= prev {
                return Err(ProfileError::NotDescending {
                    label: b.label.clone(),
                    min_percent: b.min_percent,
                });
            }
        }
        previous = Some(b.min_percent);
    }

    if last.min_percent != 0.0 {
        return Err(ProfileError::LowestNotZero {
            min_percent: last.min_percent,
        });
    }
    Ok(())
}
