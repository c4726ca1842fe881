use crate::curriculum::{ComponentWeight, CurriculumId, CurriculumProfile};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 100.0;

/// Wire token for a component the student sat out.
pub const ABSENT_TOKEN: &str = "absent";

/// One component cell. A component that was never entered is simply not
/// present in the map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComponentScore {
    Scored(f64),
    Absent,
}

impl Serialize for ComponentScore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ComponentScore::Scored(v) => serializer.serialize_f64(*v),
            ComponentScore::Absent => serializer.serialize_str(ABSENT_TOKEN),
        }
    }
}

struct ComponentScoreVisitor;

impl<'de> Visitor<'de> for ComponentScoreVisitor {
    type Value = ComponentScore;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a number or the string \"{}\"", ABSENT_TOKEN)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<ComponentScore, E> {
        Ok(ComponentScore::Scored(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ComponentScore, E> {
        Ok(ComponentScore::Scored(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ComponentScore, E> {
        Ok(ComponentScore::Scored(v as f64))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ComponentScore, E> {
        if v.eq_ignore_ascii_case(ABSENT_TOKEN) {
            Ok(ComponentScore::Absent)
        } else {
            Err(E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }
}

impl<'de> Deserialize<'de> for ComponentScore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ComponentScoreVisitor)
    }
}

pub type ComponentScores = BTreeMap<String, ComponentScore>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawScoreEntry {
    pub student_id: String,
    pub subject_id: String,
    #[serde(default)]
    pub component_scores: ComponentScores,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TotalScore {
    /// A required component has not been entered yet.
    Incomplete,
    /// Excluded from every aggregate, not scored as zero.
    Absent,
    Scored(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedGrade {
    pub total_score: Option<f64>,
    pub label: Option<String>,
    pub absent: bool,
    pub label_overridden: bool,
}

impl DerivedGrade {
    pub fn incomplete() -> Self {
        Self {
            total_score: None,
            label: None,
            absent: false,
            label_overridden: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.absent || self.total_score.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("label {label:?} is not a valid {curriculum} grade")]
pub struct InvalidLabelError {
    pub label: String,
    pub curriculum: &'static str,
}

/// Clamps an entered value into the score range. NaN counts as not entered.
pub fn clamp_score(v: f64) -> Option<f64> {
    if v.is_nan() {
        return None;
    }
    Some(v.clamp(SCORE_MIN, SCORE_MAX))
}

/// Half-up rounding to a whole mark. The weighted sum is snapped to a fine
/// grid first so that e.g. `85 * 0.7` lands on 59.5 rather than just below.
pub fn round_to_whole(x: f64) -> f64 {
    let snapped = (x * 1e9).round() / 1e9;
    snapped.round()
}

/// `Int(10*x + 0.5) / 10`, used for every displayed rate and average.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub fn compute_total(scores: &ComponentScores, weights: &[ComponentWeight]) -> TotalScore {
    let mut missing = false;
    let mut absent = false;
    let mut sum = 0.0_f64;

    for w in weights {
        match scores.get(&w.name) {
            None => missing = true,
            Some(ComponentScore::Absent) => absent = true,
            Some(ComponentScore::Scored(v)) => match clamp_score(*v) {
                Some(v) => sum += v * w.weight,
                None => missing = true,
            },
        }
    }

    if absent {
        TotalScore::Absent
    } else if missing {
        TotalScore::Incomplete
    } else {
        TotalScore::Scored(round_to_whole(sum))
    }
}

pub fn compute_label(total_score: f64, profile: &CurriculumProfile) -> Option<&str> {
    if total_score.is_nan() {
        return None;
    }
    profile
        .boundaries
        .iter()
        .find(|b| b.min_percent <= total_score)
        .map(|b| b.label.as_str())
}

pub fn derive_grade(scores: &ComponentScores, profile: &CurriculumProfile) -> DerivedGrade {
    match compute_total(scores, &profile.components) {
        TotalScore::Incomplete => DerivedGrade::incomplete(),
        TotalScore::Absent => DerivedGrade {
            absent: true,
            ..DerivedGrade::incomplete()
        },
        TotalScore::Scored(total) => DerivedGrade {
            total_score: Some(total),
            label: compute_label(total, profile).map(str::to_string),
            absent: false,
            label_overridden: false,
        },
    }
}

/// Replaces the label of `grade` with `new_label`. The total is left as is.
pub fn set_label_override(
    grade: &DerivedGrade,
    new_label: &str,
    profile: &CurriculumProfile,
) -> Result<DerivedGrade, InvalidLabelError> {
    if !profile.has_label(new_label) {
        return Err(InvalidLabelError {
            label: new_label.to_string(),
            curriculum: profile.id.as_str(),
        });
    }
    Ok(DerivedGrade {
        label: Some(new_label.to_string()),
        label_overridden: true,
        ..grade.clone()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Draft,
    Submitted,
    Approved,
    Rejected,
}

impl EntryStatus {
    pub fn parse(s: &str) -> Option<EntryStatus> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(EntryStatus::Draft),
            "submitted" => Some(EntryStatus::Submitted),
            "approved" => Some(EntryStatus::Approved),
            "rejected" => Some(EntryStatus::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Draft => "draft",
            EntryStatus::Submitted => "submitted",
            EntryStatus::Approved => "approved",
            EntryStatus::Rejected => "rejected",
        }
    }
}

/// An entry can be edited only while it is a draft and the caller is not in a
/// read-only or view-only session.
pub fn is_locked(status: EntryStatus, read_only: bool) -> bool {
    status != EntryStatus::Draft || read_only
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelCount {
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStanding {
    pub aggregate_score: f64,
    pub scored_subjects: usize,
    pub mean_score: Option<f64>,
    /// `Some(0)` marks an unranked row; `None` when the profile does not rank.
    pub position: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatistics {
    pub curriculum: CurriculumId,
    pub student_count: usize,
    pub subject_count: usize,
    pub completed_count: usize,
    pub absent_count: usize,
    pub graded_count: usize,
    pub pass_count: usize,
    pub label_counts: Vec<LabelCount>,
    pub completion_rate: f64,
    pub average_score: f64,
    pub pass_rate: f64,
    /// Aligned with the input rows.
    pub standings: Vec<StudentStanding>,
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round_off_1_decimal(100.0 * part as f64 / whole as f64)
}

/// Reduces a roster (one row per student, one grade per subject) to class
/// statistics. Rows shorter than the widest row count their missing cells as
/// incomplete.
pub fn aggregate(rows: &[Vec<DerivedGrade>], profile: &CurriculumProfile) -> ClassStatistics {
    let student_count = rows.len();
    let subject_count = rows.iter().map(|r| r.len()).max().unwrap_or(0);

    let mut label_counts: Vec<LabelCount> = profile
        .labels
        .iter()
        .map(|label| LabelCount {
            label: label.clone(),
            count: 0,
        })
        .collect();

    let mut completed_count = 0_usize;
    let mut absent_count = 0_usize;
    let mut graded_count = 0_usize;
    let mut labelled_count = 0_usize;
    let mut pass_count = 0_usize;
    let mut score_sum = 0.0_f64;
    let mut standings: Vec<StudentStanding> = Vec::with_capacity(student_count);

    for row in rows {
        let mut aggregate_score = 0.0_f64;
        let mut scored_subjects = 0_usize;

        for grade in row {
            if grade.is_complete() {
                completed_count += 1;
            }
            if grade.absent {
                absent_count += 1;
                continue;
            }
            let Some(total) = grade.total_score else {
                continue;
            };
            graded_count += 1;
            score_sum += total;
            aggregate_score += total;
            scored_subjects += 1;

            if let Some(label) = grade.label.as_deref() {
                if let Some(slot) = label_counts.iter_mut().find(|c| c.label == label) {
                    slot.count += 1;
                }
                labelled_count += 1;
                if !profile.is_failing(label) {
                    pass_count += 1;
                }
            }
        }

        standings.push(StudentStanding {
            aggregate_score,
            scored_subjects,
            mean_score: if scored_subjects > 0 {
                Some(round_off_1_decimal(aggregate_score / scored_subjects as f64))
            } else {
                None
            },
            position: None,
        });
    }

    if profile.ranks_students {
        let scores: Vec<f64> = standings.iter().map(|s| s.aggregate_score).collect();
        for (standing, position) in standings.iter_mut().zip(competition_rank(&scores)) {
            standing.position = Some(position);
        }
    }

    let average_score = if graded_count > 0 {
        round_off_1_decimal(score_sum / graded_count as f64)
    } else {
        0.0
    };

    ClassStatistics {
        curriculum: profile.id,
        student_count,
        subject_count,
        completed_count,
        absent_count,
        graded_count,
        pass_count,
        label_counts,
        completion_rate: percent(completed_count, student_count * subject_count),
        average_score,
        pass_rate: percent(pass_count, labelled_count),
        standings,
    }
}

/// Standard competition ranking ("1224"), highest score first. Scores that are
/// not positive get position 0.
pub fn competition_rank(scores: &[f64]) -> Vec<u32> {
    let mut order: Vec<usize> = (0..scores.len()).filter(|&i| scores[i] > 0.0).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut positions = vec![0_u32; scores.len()];
    for (n, &i) in order.iter().enumerate() {
        positions[i] = match n.checked_sub(1).map(|p| order[p]) {
            Some(prev) if scores[prev] == scores[i] => positions[prev],
            _ => (n + 1) as u32,
        };
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::{cbc_profile, igcse_profile, standard_profile, GradeBoundary};

    fn scores(pairs: &[(&str, ComponentScore)]) -> ComponentScores {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn count_for(stats: &ClassStatistics, label: &str) -> usize {
        stats
            .label_counts
            .iter()
            .find(|c| c.label == label)
            .map(|c| c.count)
            .unwrap_or(0)
    }

    fn scored(total: f64, profile: &CurriculumProfile) -> DerivedGrade {
        DerivedGrade {
            total_score: Some(total),
            label: compute_label(total, profile).map(str::to_string),
            absent: false,
            label_overridden: false,
        }
    }

    fn absent() -> DerivedGrade {
        DerivedGrade {
            absent: true,
            ..DerivedGrade::incomplete()
        }
    }

    #[test]
    fn clamps_out_of_range_components() {
        let cbc = cbc_profile();
        let s = scores(&[
            ("formative", ComponentScore::Scored(150.0)),
            ("summative", ComponentScore::Scored(-20.0)),
        ]);
        assert_eq!(compute_total(&s, &cbc.components), TotalScore::Scored(40.0));
        let grade = derive_grade(&s, &cbc);
        assert_eq!(grade.label.as_deref(), Some("AE"));
    }

    #[test]
    fn missing_component_is_incomplete_but_absent_is_excluded() {
        let cbc = cbc_profile();
        let partial = scores(&[("formative", ComponentScore::Scored(80.0))]);
        assert_eq!(compute_total(&partial, &cbc.components), TotalScore::Incomplete);
        assert_eq!(derive_grade(&partial, &cbc), DerivedGrade::incomplete());

        let sat_out = scores(&[
            ("formative", ComponentScore::Scored(80.0)),
            ("summative", ComponentScore::Absent),
        ]);
        assert_eq!(compute_total(&sat_out, &cbc.components), TotalScore::Absent);
        let grade = derive_grade(&sat_out, &cbc);
        assert!(grade.absent);
        assert_eq!(grade.total_score, None);
        assert!(grade.is_complete());

        let nan = scores(&[
            ("formative", ComponentScore::Scored(f64::NAN)),
            ("summative", ComponentScore::Scored(50.0)),
        ]);
        assert_eq!(compute_total(&nan, &cbc.components), TotalScore::Incomplete);
    }

    #[test]
    fn igcse_weighted_total_rounds_half_up() {
        let igcse = igcse_profile();
        let s = scores(&[
            ("coursework", ComponentScore::Scored(90.0)),
            ("exam", ComponentScore::Scored(85.0)),
        ]);
        let grade = derive_grade(&s, &igcse);
        assert_eq!(grade.total_score, Some(87.0));
        assert_eq!(grade.label.as_deref(), Some("A"));
    }

    #[test]
    fn half_marks_never_round_down_from_float_error() {
        let igcse = igcse_profile();
        for coursework in 0..=100 {
            for exam in 0..=100 {
                let s = scores(&[
                    ("coursework", ComponentScore::Scored(coursework as f64)),
                    ("exam", ComponentScore::Scored(exam as f64)),
                ]);
                let tenths = coursework * 3 + exam * 7;
                let expected = ((tenths + 5) / 10) as f64;
                assert_eq!(
                    compute_total(&s, &igcse.components),
                    TotalScore::Scored(expected),
                    "coursework={coursework} exam={exam}"
                );
            }
        }
    }

    #[test]
    fn standard_boundaries_are_inclusive_on_the_lower_edge() {
        let standard = standard_profile();
        assert_eq!(compute_label(75.0, &standard), Some("A-"));
        assert_eq!(compute_label(74.999, &standard), Some("B+"));
        assert_eq!(compute_label(100.0, &standard), Some("A+"));
        assert_eq!(compute_label(0.0, &standard), Some("E"));
        assert_eq!(compute_label(f64::NAN, &standard), None);
    }

    #[test]
    fn every_profile_labels_every_whole_percentage() {
        for profile in [cbc_profile(), igcse_profile(), standard_profile()] {
            for pct in 0..=100 {
                let label = compute_label(pct as f64, &profile).expect("covered");
                assert!(profile.has_label(label));
            }
        }
    }

    #[test]
    fn compute_is_idempotent() {
        let cbc = cbc_profile();
        let s = scores(&[
            ("formative", ComponentScore::Scored(63.0)),
            ("summative", ComponentScore::Scored(71.5)),
        ]);
        let a = compute_total(&s, &cbc.components);
        let b = compute_total(&s, &cbc.components);
        assert_eq!(a, b);
        let (TotalScore::Scored(x), TotalScore::Scored(y)) = (a, b) else {
            panic!("expected totals");
        };
        assert_eq!(x.to_bits(), y.to_bits());
        assert_eq!(compute_label(x, &cbc), compute_label(y, &cbc));
    }

    #[test]
    fn custom_boundaries_change_the_label_not_the_total() {
        let custom = igcse_profile()
            .with_boundaries(vec![
                GradeBoundary {
                    label: "A*".to_string(),
                    min_percent: 85.0,
                },
                GradeBoundary {
                    label: "U".to_string(),
                    min_percent: 0.0,
                },
            ])
            .expect("valid");
        let s = scores(&[
            ("coursework", ComponentScore::Scored(90.0)),
            ("exam", ComponentScore::Scored(85.0)),
        ]);
        let grade = derive_grade(&s, &custom);
        assert_eq!(grade.total_score, Some(87.0));
        assert_eq!(grade.label.as_deref(), Some("A*"));
    }

    #[test]
    fn label_override_is_validated_against_the_profile() {
        let igcse = igcse_profile();
        let grade = scored(87.0, &igcse);

        let bad = set_label_override(&grade, "Z", &igcse).unwrap_err();
        assert_eq!(bad.label, "Z");
        assert_eq!(bad.curriculum, "IGCSE");

        let good = set_label_override(&grade, "B", &igcse).expect("valid label");
        assert_eq!(good.label.as_deref(), Some("B"));
        assert_eq!(good.total_score, Some(87.0));
        assert!(good.label_overridden);
    }

    #[test]
    fn competition_ranking_skips_after_ties() {
        assert_eq!(competition_rank(&[200.0, 200.0, 150.0]), vec![1, 1, 3]);
        assert_eq!(competition_rank(&[150.0, 200.0, 200.0, 90.0]), vec![3, 1, 1, 4]);
        assert_eq!(competition_rank(&[0.0, 50.0]), vec![0, 1]);
        assert!(competition_rank(&[]).is_empty());
    }

    #[test]
    fn aggregate_counts_every_label_and_ranks_standard() {
        let standard = standard_profile();
        let rows = vec![
            vec![scored(80.0, &standard), scored(70.0, &standard)],
            vec![scored(75.0, &standard), scored(75.0, &standard)],
            vec![DerivedGrade::incomplete(), DerivedGrade::incomplete()],
            vec![scored(40.0, &standard), absent()],
        ];
        let stats = aggregate(&rows, &standard);

        assert_eq!(stats.student_count, 4);
        assert_eq!(stats.subject_count, 2);
        assert_eq!(stats.label_counts.len(), 13);
        assert_eq!(count_for(&stats, "A"), 1);
        assert_eq!(count_for(&stats, "A-"), 2);
        assert_eq!(count_for(&stats, "B+"), 1);
        assert_eq!(count_for(&stats, "D+"), 1);
        assert_eq!(count_for(&stats, "E"), 0);

        // 6 of 8 cells complete (one absent counts), 5 graded, 4 passing.
        assert_eq!(stats.completed_count, 6);
        assert_eq!(stats.completion_rate, 75.0);
        assert_eq!(stats.graded_count, 5);
        assert_eq!(stats.average_score, 68.0);
        assert_eq!(stats.pass_count, 4);
        assert_eq!(stats.pass_rate, 80.0);

        let positions: Vec<Option<u32>> = stats.standings.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![Some(1), Some(1), Some(0), Some(3)]);
        assert_eq!(stats.standings[3].aggregate_score, 40.0);
        assert_eq!(stats.standings[3].scored_subjects, 1);
        assert_eq!(stats.standings[2].mean_score, None);
    }

    #[test]
    fn cbc_has_no_failing_band_and_no_positions() {
        let cbc = cbc_profile();
        let rows = vec![vec![scored(10.0, &cbc)], vec![scored(90.0, &cbc)]];
        let stats = aggregate(&rows, &cbc);
        assert_eq!(count_for(&stats, "BE"), 1);
        assert_eq!(count_for(&stats, "EE"), 1);
        assert_eq!(stats.pass_rate, 100.0);
        assert!(stats.standings.iter().all(|s| s.position.is_none()));
    }

    #[test]
    fn empty_roster_yields_zeroes() {
        let igcse = igcse_profile();
        let stats = aggregate(&[], &igcse);
        assert_eq!(stats.completion_rate, 0.0);
        assert_eq!(stats.pass_rate, 0.0);
        assert_eq!(stats.average_score, 0.0);
        assert_eq!(stats.label_counts.len(), 9);
        assert!(stats.label_counts.iter().all(|c| c.count == 0));

        let only_absent = aggregate(&[vec![absent()]], &igcse);
        assert_eq!(only_absent.completion_rate, 100.0);
        assert_eq!(only_absent.pass_rate, 0.0);
        assert!(!only_absent.pass_rate.is_nan());
    }

    #[test]
    fn lock_rule_combines_status_and_session_flag() {
        assert!(!is_locked(EntryStatus::Draft, false));
        assert!(is_locked(EntryStatus::Draft, true));
        assert!(is_locked(EntryStatus::Submitted, false));
        assert!(is_locked(EntryStatus::Approved, false));
        assert!(is_locked(EntryStatus::Rejected, false));
    }

    #[test]
    fn component_scores_use_absent_token_on_the_wire() {
        let parsed: ComponentScores =
            serde_json::from_str(r#"{"formative": 80, "summative": "ABSENT"}"#).expect("parse");
        assert_eq!(parsed.get("formative"), Some(&ComponentScore::Scored(80.0)));
        assert_eq!(parsed.get("summative"), Some(&ComponentScore::Absent));
        let out = serde_json::to_value(&parsed).expect("serialize");
        assert_eq!(out["summative"], serde_json::json!("absent"));
        assert!(serde_json::from_str::<ComponentScores>(r#"{"exam": "x"}"#).is_err());
    }

    #[test]
    fn round_off_matches_display_rounding() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
        assert_eq!(round_to_whole(86.5), 87.0);
        assert_eq!(round_to_whole(86.499999999999), 87.0);
        assert_eq!(round_to_whole(86.4), 86.0);
    }
}
