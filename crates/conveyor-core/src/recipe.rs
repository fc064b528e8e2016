//! Recipe definitions.
//!
//! A recipe is the template a job is instantiated from: ordered steps, the
//! build configs it runs on, the event cause it reacts to and the recipes
//! (by filename) it depends on.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::event::NewEvent;

/// What kind of source-control event a recipe or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    #[display("pull_request")]
    PullRequest,
    #[display("push")]
    Push,
    #[display("manual")]
    Manual,
    #[display("release")]
    Release,
}

impl std::str::FromStr for Cause {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull_request" => Ok(Cause::PullRequest),
            "push" => Ok(Cause::Push),
            "manual" => Ok(Cause::Manual),
            "release" => Ok(Cause::Release),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown cause '{}'",
                other
            ))),
        }
    }
}

/// Who may start a recipe's jobs without a developer activating them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Jobs always need activation.
    #[display("manual")]
    Manual,
    /// Jobs run if the triggering user is authorized or a collaborator.
    #[display("auto_authorized")]
    AutoAuthorized,
    /// Jobs always run.
    #[display("full_auto")]
    FullAuto,
}

impl std::str::FromStr for TriggerPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerPolicy::Manual),
            "auto_authorized" => Ok(TriggerPolicy::AutoAuthorized),
            "full_auto" => Ok(TriggerPolicy::FullAuto),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown trigger policy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeStep {
    pub name: String,
    pub script: String,
    pub abort_on_failure: bool,
    pub allowed_to_fail: bool,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
}

/// Everything a recipe file declares. Two definitions compare equal iff a
/// reload would not need a new recipe version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeDefinition {
    pub name: String,
    pub display_name: String,
    /// Stable identity across versions; dependency edges point at filenames.
    pub filename: String,
    pub build_user: String,
    pub repository: String,
    /// Branch filter. `None` matches any base branch.
    pub branch: Option<String>,
    pub cause: Cause,
    pub trigger: TriggerPolicy,
    #[serde(default)]
    pub authorized_users: Vec<String>,
    pub build_configs: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    pub active: bool,
    #[serde(default)]
    pub auto_cancel_on_push: bool,
    pub abort_on_failure: bool,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    #[serde(default)]
    pub prestep_sources: Vec<String>,
    pub steps: Vec<RecipeStep>,
}

impl RecipeDefinition {
    /// Does this recipe spawn jobs for the given event?
    pub fn matches(&self, event: &NewEvent) -> bool {
        if !self.active
            || self.cause != event.cause
            || self.build_user != event.build_user
            || self.repository != event.base.repository
        {
            return false;
        }
        match &self.branch {
            Some(branch) => branch == &event.base.branch,
            None => true,
        }
    }

    /// Is `user` allowed to start jobs without activation, going by the
    /// recipe's own list? Collaborator status is checked separately.
    pub fn authorizes(&self, user: &str) -> bool {
        match self.trigger {
            TriggerPolicy::FullAuto => true,
            TriggerPolicy::Manual => false,
            TriggerPolicy::AutoAuthorized => self.authorized_users.iter().any(|u| u == user),
        }
    }
}

/// A stored, versioned recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: ResourceId,
    /// Only current recipes spawn jobs for new events.
    pub current: bool,
    pub created_at: DateTime<Utc>,
    pub definition: RecipeDefinition,
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CommitRef, NewEvent};

    fn event(cause: Cause, branch: &str) -> NewEvent {
        let commit = |sha: &str| CommitRef {
            repository: "acme/widgets".to_string(),
            branch: branch.to_string(),
            sha: sha.to_string(),
            ssh_url: "git@example.com:acme/widgets.git".to_string(),
        };
        NewEvent {
            cause,
            build_user: "buildbot".to_string(),
            build_key: "key".to_string(),
            base: commit("base"),
            head: commit("head"),
            pull_request: None,
            trigger_user: "alice".to_string(),
            comments_url: None,
            description: String::new(),
            force: false,
        }
    }

    #[test]
    fn matches_on_cause_and_branch() {
        let mut def = fixtures::definition("test.kdl", &[]);
        assert!(def.matches(&event(Cause::PullRequest, "main")));
        assert!(!def.matches(&event(Cause::Push, "main")));

        def.branch = Some("main".to_string());
        assert!(def.matches(&event(Cause::PullRequest, "main")));
        assert!(!def.matches(&event(Cause::PullRequest, "devel")));

        def.active = false;
        assert!(!def.matches(&event(Cause::PullRequest, "main")));
    }

    #[test]
    fn authorization_follows_policy() {
        let mut def = fixtures::definition("test.kdl", &[]);
        assert!(def.authorizes("anyone"));

        def.trigger = TriggerPolicy::Manual;
        assert!(!def.authorizes("anyone"));

        def.trigger = TriggerPolicy::AutoAuthorized;
        def.authorized_users = vec!["alice".to_string()];
        assert!(def.authorizes("alice"));
        assert!(!def.authorizes("mallory"));
    }
}
