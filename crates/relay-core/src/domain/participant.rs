//! Lanes and participant resolution.
//!
//! A lane says *who* may act on a task. It is resolved on demand into a
//! de-duplicated list of user ids and never cached, since role membership
//! can change between runs.

use crate::domain::ports::UserDirectory;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// A lane: the roles and accounts a task addresses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lane {
    /// Lane ID
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Include members of `role`
    #[serde(default)]
    pub use_role: bool,

    /// Role IDs
    #[serde(default)]
    pub role: Vec<String>,

    /// Include the accounts in `account`
    #[serde(default)]
    pub use_account: bool,

    /// User IDs or usernames
    #[serde(default)]
    pub account: Vec<String>,
}

impl Lane {
    /// Whether the lane can ever resolve to anyone
    pub fn is_empty(&self) -> bool {
        !(self.use_role && !self.role.is_empty()) && !(self.use_account && !self.account.is_empty())
    }
}

/// Resolve a lane into a de-duplicated list of user IDs, first-seen order preserved
pub async fn resolve_participants(
    lane: &Lane,
    directory: &dyn UserDirectory,
) -> Result<Vec<String>, CoreError> {
    let mut seen = HashSet::new();
    let mut users = Vec::new();

    if lane.use_role && !lane.role.is_empty() {
        for user in directory.users_in_roles(&lane.role).await? {
            if seen.insert(user.id.clone()) {
                users.push(user.id);
            }
        }
    }

    if lane.use_account && !lane.account.is_empty() {
        let found = directory.find_users(&lane.account).await?;
        for account in &lane.account {
            let matched = found
                .iter()
                .find(|u| &u.id == account || u.username.as_deref() == Some(account.as_str()));
            match matched {
                Some(user) => {
                    if seen.insert(user.id.clone()) {
                        users.push(user.id.clone());
                    }
                }
                None => warn!(lane = %lane.id, account = %account, "Lane account not found"),
            }
        }
    }

    debug!(lane = %lane.id, count = users.len(), "Resolved lane participants");
    Ok(users)
}
