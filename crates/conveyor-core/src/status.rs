//! Job, step and event status, plus the aggregation rule that rolls child
//! statuses up into a parent status.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Status of a step result, job or event.
///
/// The variants are an unordered set; precedence only exists inside
/// [`aggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[display("NOT_STARTED")]
    NotStarted,
    #[display("SUCCESS")]
    Success,
    #[display("RUNNING")]
    Running,
    #[display("FAILED")]
    Failed,
    #[display("FAILED_OK")]
    FailedOk,
    #[display("CANCELED")]
    Canceled,
    #[display("ACTIVATION_REQUIRED")]
    ActivationRequired,
    #[display("INTERMITTENT_FAILURE")]
    IntermittentFailure,
    #[display("SKIPPED")]
    Skipped,
}

/// Highest precedence first. NOT_STARTED is handled separately: it only wins
/// when it is the sole status, or as the fallback for an empty set.
const PRECEDENCE: [Status; 8] = [
    Status::Running,
    Status::ActivationRequired,
    Status::Failed,
    Status::Canceled,
    Status::IntermittentFailure,
    Status::Skipped,
    Status::FailedOk,
    Status::Success,
];

impl Status {
    pub const ALL: [Status; 9] = [
        Status::NotStarted,
        Status::Success,
        Status::Running,
        Status::Failed,
        Status::FailedOk,
        Status::Canceled,
        Status::ActivationRequired,
        Status::IntermittentFailure,
        Status::Skipped,
    ];

    /// Human readable label used in commit statuses and comments.
    pub fn label(&self) -> &'static str {
        match self {
            Status::NotStarted => "Not started",
            Status::Success => "Passed",
            Status::Running => "Running",
            Status::Failed => "Failed",
            Status::FailedOk => "Allowed to fail",
            Status::Canceled => "Canceled",
            Status::ActivationRequired => "Requires activation",
            Status::IntermittentFailure => "Intermittent failure",
            Status::Skipped => "Skipped",
        }
    }

    /// A completed dependency with this status lets its dependents run.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(
            self,
            Status::Success | Status::FailedOk | Status::IntermittentFailure | Status::Skipped
        )
    }

    /// A completed dependency with this status makes its dependents unrunnable.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Status::Failed | Status::Canceled)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Failed | Status::IntermittentFailure)
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown status '{}'", s)))
    }
}

/// Roll a collection of child statuses up into a single parent status.
///
/// Used for steps into a job and for jobs into an event, both while work is
/// in flight and at finalization. The result depends only on which statuses
/// are present, never on their order or multiplicity.
pub fn aggregate<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut present = [false; 9];
    let mut distinct = 0;
    for status in statuses {
        let slot = &mut present[status as usize];
        if !*slot {
            *slot = true;
            distinct += 1;
        }
    }

    if distinct == 1 && present[Status::NotStarted as usize] {
        return Status::NotStarted;
    }

    PRECEDENCE
        .into_iter()
        .find(|status| present[*status as usize])
        .unwrap_or(Status::NotStarted)
}

/// Coarse worker state, shown for visibility only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    #[display("running")]
    Running,
    #[display("idle")]
    Idle,
    #[display("down")]
    Down,
}

impl std::str::FromStr for ClientStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ClientStatus::Running),
            "idle" => Ok(ClientStatus::Idle),
            "down" => Ok(ClientStatus::Down),
            other => Err(Error::InvalidInput(format!(
                "unknown client status '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lone_not_started_stays_not_started() {
        assert_eq!(aggregate([Status::NotStarted]), Status::NotStarted);
        assert_eq!(
            aggregate([Status::NotStarted, Status::NotStarted]),
            Status::NotStarted
        );
    }

    #[test]
    fn empty_set_falls_back_to_not_started() {
        assert_eq!(aggregate(Vec::new()), Status::NotStarted);
    }

    #[test]
    fn running_dominates_everything() {
        for other in Status::ALL {
            assert_eq!(aggregate([other, Status::Running]), Status::Running);
            assert_eq!(aggregate([Status::Running, other]), Status::Running);
        }
    }

    #[test]
    fn precedence_chain() {
        assert_eq!(
            aggregate([Status::Success, Status::ActivationRequired, Status::Failed]),
            Status::ActivationRequired
        );
        assert_eq!(
            aggregate([Status::Canceled, Status::Failed]),
            Status::Failed
        );
        assert_eq!(
            aggregate([Status::IntermittentFailure, Status::Canceled]),
            Status::Canceled
        );
        assert_eq!(
            aggregate([Status::Skipped, Status::IntermittentFailure]),
            Status::IntermittentFailure
        );
        assert_eq!(
            aggregate([Status::FailedOk, Status::Skipped]),
            Status::Skipped
        );
        assert_eq!(
            aggregate([Status::Success, Status::FailedOk]),
            Status::FailedOk
        );
        assert_eq!(
            aggregate([Status::NotStarted, Status::Success]),
            Status::Success
        );
    }

    #[test]
    fn order_does_not_matter() {
        let statuses = [
            Status::Success,
            Status::Skipped,
            Status::FailedOk,
            Status::NotStarted,
        ];
        let mut reversed = statuses;
        reversed.reverse();
        assert_eq!(aggregate(statuses), aggregate(reversed));
        assert_eq!(aggregate(statuses), Status::Skipped);
    }

    #[test]
    fn status_parses_its_display_form() {
        for status in Status::ALL {
            assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
        }
        assert!("BOGUS".parse::<Status>().is_err());
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&Status::FailedOk).unwrap();
        assert_eq!(json, "\"FAILED_OK\"");
    }
}
