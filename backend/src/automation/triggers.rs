// Automation Triggers - trigger kinds and column transition classification

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conditions under which a column automation is eligible to run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    EnteredColumn,
    LeftColumn,
    TimeInColumn,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnteredColumn => "entered_column",
            Self::LeftColumn => "left_column",
            Self::TimeInColumn => "time_in_column",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "entered_column" => Some(Self::EnteredColumn),
            "left_column" => Some(Self::LeftColumn),
            "time_in_column" => Some(Self::TimeInColumn),
            _ => None,
        }
    }
}

/// Unit for the `time_in_column` duration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    Minutes,
    Hours,
    Days,
}

impl DurationUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "minutes" => Some(Self::Minutes),
            "hours" => Some(Self::Hours),
            "days" => Some(Self::Days),
            _ => None,
        }
    }

    fn minutes_per_unit(&self) -> i64 {
        match self {
            Self::Minutes => 1,
            Self::Hours => 60,
            Self::Days => 1440,
        }
    }
}

/// One trigger on an automation. The time fields are only meaningful for
/// `time_in_column`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationTrigger {
    pub kind: TriggerKind,
    pub time_value: Option<i32>,
    pub time_unit: Option<DurationUnit>,
}

impl AutomationTrigger {
    /// Dwell threshold normalized to minutes. None unless this is a
    /// `time_in_column` trigger with a positive configured duration.
    pub fn threshold_minutes(&self) -> Option<i64> {
        if self.kind != TriggerKind::TimeInColumn {
            return None;
        }
        let value = self.time_value?;
        if value <= 0 {
            return None;
        }
        let unit = self.time_unit.unwrap_or(DurationUnit::Minutes);
        Some(value as i64 * unit.minutes_per_unit())
    }
}

/// Classification of a card mutation with respect to column membership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// Column untouched (absent from the mutation, or unchanged)
    None,
    /// First-ever column assignment
    Entered,
    /// Column cleared (does not occur through the card surfaces, kept for completeness)
    Left,
    /// Moved between two columns: left the old one, entered the new one
    Both,
}

/// Classify a card mutation from its previous and requested column ids.
///
/// The caller passes `next = None` when the mutation payload does not touch
/// the column at all.
pub fn classify_transition(previous: Option<Uuid>, next: Option<Uuid>) -> TransitionKind {
    match (previous, next) {
        (_, None) => TransitionKind::None,
        (Some(prev), Some(new)) if prev == new => TransitionKind::None,
        (None, Some(_)) => TransitionKind::Entered,
        (Some(_), Some(_)) => TransitionKind::Both,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_no_column_in_payload() {
        let prev = Uuid::new_v4();
        assert_eq!(classify_transition(Some(prev), None), TransitionKind::None);
        assert_eq!(classify_transition(None, None), TransitionKind::None);
    }

    #[test]
    fn test_classify_unchanged_column() {
        let col = Uuid::new_v4();
        assert_eq!(
            classify_transition(Some(col), Some(col)),
            TransitionKind::None
        );
    }

    #[test]
    fn test_classify_first_assignment_is_entered_only() {
        assert_eq!(
            classify_transition(None, Some(Uuid::new_v4())),
            TransitionKind::Entered
        );
    }

    #[test]
    fn test_classify_move_is_both() {
        assert_eq!(
            classify_transition(Some(Uuid::new_v4()), Some(Uuid::new_v4())),
            TransitionKind::Both
        );
    }

    #[test]
    fn test_threshold_normalization() {
        let trigger = AutomationTrigger {
            kind: TriggerKind::TimeInColumn,
            time_value: Some(2),
            time_unit: Some(DurationUnit::Hours),
        };
        assert_eq!(trigger.threshold_minutes(), Some(120));

        let trigger = AutomationTrigger {
            kind: TriggerKind::TimeInColumn,
            time_value: Some(3),
            time_unit: Some(DurationUnit::Days),
        };
        assert_eq!(trigger.threshold_minutes(), Some(4320));

        let trigger = AutomationTrigger {
            kind: TriggerKind::TimeInColumn,
            time_value: Some(45),
            time_unit: None,
        };
        assert_eq!(trigger.threshold_minutes(), Some(45));
    }

    #[test]
    fn test_threshold_requires_positive_time_trigger() {
        let trigger = AutomationTrigger {
            kind: TriggerKind::TimeInColumn,
            time_value: Some(0),
            time_unit: Some(DurationUnit::Minutes),
        };
        assert_eq!(trigger.threshold_minutes(), None);

        let trigger = AutomationTrigger {
            kind: TriggerKind::EnteredColumn,
            time_value: Some(10),
            time_unit: Some(DurationUnit::Minutes),
        };
        assert_eq!(trigger.threshold_minutes(), None);
    }

    #[test]
    fn test_trigger_kind_round_trip() {
        for kind in [
            TriggerKind::EnteredColumn,
            TriggerKind::LeftColumn,
            TriggerKind::TimeInColumn,
        ] {
            assert_eq!(TriggerKind::from_db(kind.as_str()), Some(kind));
        }
        assert_eq!(TriggerKind::from_db("card_created"), None);
    }
}
