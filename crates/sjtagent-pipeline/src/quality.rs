//! Heuristic quality gate for generated behaviour options.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub const MIN_DISTINCT_RATIO: f64 = 0.9;
pub const MIN_LEVEL_COVERAGE: f64 = 0.67;
pub const MIN_CUE_MENTIONS: f64 = 1.0;

const TRAIT_LEVELS: [&str; 3] = ["high", "mid", "low"];

/// One response option of an SJT item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorOption {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub rationale: String,
    /// `high`, `mid` or `low`.
    #[serde(default)]
    pub trait_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub distinct_ratio: f64,
    pub coverage: f64,
    pub avg_cue_mentions: f64,
    pub pass: bool,
}

/// Share of options whose `(action, rationale)` pair is unique.
pub fn distinct_ratio(options: &[BehaviorOption]) -> f64 {
    if options.is_empty() {
        return 0.0;
    }
    let unique: HashSet<(&str, &str)> = options
        .iter()
        .map(|o| (o.action.as_str(), o.rationale.as_str()))
        .collect();
    unique.len() as f64 / options.len() as f64
}

/// Share of the three trait levels represented among the options.
pub fn level_coverage(options: &[BehaviorOption]) -> f64 {
    let levels: HashSet<String> = options.iter().map(|o| o.trait_level.to_lowercase()).collect();
    let covered = TRAIT_LEVELS.iter().filter(|l| levels.contains(**l)).count();
    covered as f64 / TRAIT_LEVELS.len() as f64
}

/// Average number of distinct outline cues mentioned per option.
pub fn cue_mentions(options: &[BehaviorOption], cues: &[String]) -> f64 {
    let cues: HashSet<&str> = cues.iter().map(String::as_str).filter(|c| !c.is_empty()).collect();
    let hits: usize = options
        .iter()
        .map(|o| {
            let text = format!("{} {} {} {}", o.label, o.action, o.rationale, o.trait_level);
            cues.iter().filter(|c| text.contains(**c)).count()
        })
        .sum();
    hits as f64 / options.len().max(1) as f64
}

pub fn assess(options: &[BehaviorOption], cues: &[String]) -> QualityReport {
    let distinct = distinct_ratio(options);
    let coverage = level_coverage(options);
    let cue_hits = cue_mentions(options, cues);
    QualityReport {
        distinct_ratio: round3(distinct),
        coverage: round3(coverage),
        avg_cue_mentions: round3(cue_hits),
        pass: distinct >= MIN_DISTINCT_RATIO
            && coverage >= MIN_LEVEL_COVERAGE
            && cue_hits >= MIN_CUE_MENTIONS,
    }
}

/// Instructions for the reviser, one per failed criterion. Empty when the
/// report passes.
pub fn revision_notes(report: &QualityReport) -> Vec<String> {
    let mut notes = Vec::new();
    if report.pass {
        return notes;
    }
    if report.distinct_ratio < MIN_DISTINCT_RATIO {
        notes.push("options repeat each other or differ too little".to_string());
    }
    if report.coverage < MIN_LEVEL_COVERAGE {
        notes.push("options do not cover all of the high, mid and low trait levels".to_string());
    }
    if report.avg_cue_mentions < MIN_CUE_MENTIONS {
        notes.push("options are not tied closely enough to the situation cues".to_string());
    }
    if notes.is_empty() {
        notes.push("strengthen distinctiveness, level coverage and cue coupling".to_string());
    }
    notes
}

/// Stop once `max_revisions` revisions have run or the report passes.
pub fn decide(iterations: u64, max_revisions: u32, report: &QualityReport) -> &'static str {
    if iterations >= u64::from(max_revisions) {
        "stop"
    } else if !report.pass {
        "revise"
    } else {
        "stop"
    }
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option(label: &str, action: &str, level: &str) -> BehaviorOption {
        BehaviorOption {
            label: label.into(),
            action: action.into(),
            rationale: format!("because {}", action),
            trait_level: level.into(),
        }
    }

    fn good_options() -> Vec<BehaviorOption> {
        vec![
            option("A", "plan the deadline with the group chat", "high"),
            option("B", "check the deadline once the group chat settles", "high"),
            option("C", "wait for the group chat to set a deadline", "mid"),
            option("D", "ignore the deadline until asked", "low"),
            option("E", "leave the group chat muted past the deadline", "low"),
        ]
    }

    fn cues() -> Vec<String> {
        vec!["deadline".into(), "group chat".into()]
    }

    #[test]
    fn test_passing_options() {
        let report = assess(&good_options(), &cues());
        assert_eq!(report.distinct_ratio, 1.0);
        assert_eq!(report.coverage, 1.0);
        assert!(report.avg_cue_mentions >= 1.0);
        assert!(report.pass);
        assert!(revision_notes(&report).is_empty());
    }

    #[test]
    fn test_duplicates_and_missing_levels() {
        let options = vec![
            option("A", "same", "high"),
            option("B", "same", "high"),
            option("C", "other", "high"),
        ];
        let report = assess(&options, &[]);
        assert_eq!(report.distinct_ratio, 0.667);
        assert_eq!(report.coverage, 0.333);
        assert_eq!(report.avg_cue_mentions, 0.0);
        assert!(!report.pass);
        assert_eq!(revision_notes(&report).len(), 3);
    }

    #[test]
    fn test_empty_options_fail() {
        let report = assess(&[], &cues());
        assert_eq!(report.distinct_ratio, 0.0);
        assert!(!report.pass);
    }

    #[test]
    fn test_level_case_insensitive() {
        let options = vec![option("A", "x", "HIGH"), option("B", "y", "Mid")];
        assert_eq!(round3(level_coverage(&options)), 0.667);
    }

    #[test]
    fn test_decide_stop_rule() {
        let failing = assess(&[], &[]);
        let passing = assess(&good_options(), &cues());

        assert_eq!(decide(0, 2, &failing), "revise");
        assert_eq!(decide(1, 2, &failing), "revise");
        assert_eq!(decide(2, 2, &failing), "stop");
        assert_eq!(decide(0, 2, &passing), "stop");
    }
}
