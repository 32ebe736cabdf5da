//! Stage guard: stages only move forward along the ladder, terminal stages
//! are never overwritten.

use crate::{PropertyValue, Stage};

pub const FORWARD_STAGES: [Stage; 6] = [
    Stage::Applied,
    Stage::Received,
    Stage::InterviewScheduled,
    Stage::Interviewed,
    Stage::FinalRound,
    Stage::Offer,
];

pub const TERMINAL_STAGES: [Stage; 2] = [Stage::Rejected, Stage::Withdrawn];

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

fn rank(label: &str) -> Option<usize> {
    FORWARD_STAGES.iter().position(|s| s.as_str() == label)
}

fn is_terminal(label: &str) -> bool {
    TERMINAL_STAGES.iter().any(|s| s.as_str() == label)
}

/// Whether `candidate` may replace `current` as a page's stage.
///
/// A blank candidate is always allowed (the caller leaves the stage alone).
/// Labels outside the forward ladder, including `needs_action`, `forwarded`,
/// `other` and anything unrecognized, are not ordered against anything.
pub fn allowed_stage_update(current: Option<&str>, candidate: Option<&str>) -> bool {
    let Some(candidate) = normalize(candidate) else {
        return true;
    };
    let current = normalize(current);
    let Some(current) = current.as_deref() else {
        return true;
    };
    if is_terminal(current) {
        return false;
    }
    match (rank(current), rank(&candidate)) {
        (Some(current), Some(candidate)) => candidate >= current,
        _ => true,
    }
}

/// [`allowed_stage_update`] over property values; non-text values compare by
/// their string form.
pub fn allowed_stage_value(
    current: Option<&PropertyValue>,
    candidate: Option<&PropertyValue>,
) -> bool {
    let current = current.map(PropertyValue::as_text);
    let candidate = candidate.map(PropertyValue::as_text);
    allowed_stage_update(current.as_deref(), candidate.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_current_blocks_any_candidate() {
        for terminal in TERMINAL_STAGES {
            for candidate in Stage::ALL {
                assert!(
                    !allowed_stage_update(Some(terminal.as_str()), Some(candidate.as_str())),
                    "{terminal} -> {candidate}"
                );
            }
            assert!(!allowed_stage_update(Some(terminal.as_str()), Some("made_up")));
        }
    }

    #[test]
    fn forward_ladder_never_regresses() {
        for (i, current) in FORWARD_STAGES.iter().enumerate() {
            for (j, candidate) in FORWARD_STAGES.iter().enumerate() {
                assert_eq!(
                    allowed_stage_update(Some(current.as_str()), Some(candidate.as_str())),
                    j >= i,
                    "{current} -> {candidate}"
                );
            }
        }
    }

    #[test]
    fn blank_candidate_is_always_allowed() {
        for current in Stage::ALL {
            assert!(allowed_stage_update(Some(current.as_str()), Some("")));
            assert!(allowed_stage_update(Some(current.as_str()), Some("   ")));
            assert!(allowed_stage_update(Some(current.as_str()), None));
        }
    }

    #[test]
    fn labels_are_trimmed_and_case_folded() {
        assert!(!allowed_stage_update(Some("  Rejected "), Some("offer")));
        assert!(!allowed_stage_update(Some("OFFER"), Some(" Applied")));
        assert!(allowed_stage_update(Some("Applied"), Some("INTERVIEWED")));
    }

    #[test]
    fn escape_stages_are_unordered() {
        assert!(allowed_stage_update(Some("offer"), Some("needs_action")));
        assert!(allowed_stage_update(Some("needs_action"), Some("applied")));
        assert!(allowed_stage_update(Some("forwarded"), Some("received")));
        assert!(allowed_stage_update(None, Some("applied")));
        assert!(allowed_stage_update(Some("something else"), Some("applied")));
        assert!(allowed_stage_update(Some("needs_action"), Some("rejected")));
    }

    #[test]
    fn property_values_compare_by_text() {
        let current = PropertyValue::Choice("interviewed".into());
        let choice = |stage: &str| PropertyValue::Choice(stage.into());
        assert!(!allowed_stage_value(Some(&current), Some(&choice("received"))));
        assert!(allowed_stage_value(Some(&current), Some(&choice("final_round"))));
        assert!(allowed_stage_value(
            Some(&PropertyValue::Number(3.0)),
            Some(&PropertyValue::text("offer"))
        ));
    }
}
