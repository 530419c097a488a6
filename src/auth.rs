// Capability checks delegated to the identity collaborator.
//
// The engine never inspects credentials; it is handed an already
// authenticated `Identity` and asks the injected authorizer two
// questions: "may this identity bid for this team" and "is this
// identity an administrator".

use serde::{Deserialize, Serialize};

use crate::auction::model::Team;

/// Role assigned to an identity by the external identity system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    TeamManager,
    Player,
}

/// An authenticated actor as reported by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: Role,
}

impl Identity {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Identity {
            id: id.into(),
            role,
        }
    }
}

/// Capability-check seam injected into the bidding component.
pub trait TeamAuthorizer: Send + Sync {
    /// May `identity` place bids on behalf of `team`?
    fn can_act_for(&self, identity: &Identity, team: &Team) -> bool;

    /// Administrators bypass ownership checks for lifecycle operations.
    fn is_admin(&self, identity: &Identity) -> bool;
}

/// Production policy: admins act for anyone, team managers only for the
/// team whose `manager_id` matches their own id.
pub struct ManagerAuthorizer;

impl TeamAuthorizer for ManagerAuthorizer {
    fn can_act_for(&self, identity: &Identity, team: &Team) -> bool {
        match identity.role {
            Role::Admin => true,
            Role::TeamManager => team.manager_id == identity.id,
            Role::Player => false,
        }
    }

    fn is_admin(&self, identity: &Identity) -> bool {
        identity.role == Role::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team_managed_by(manager_id: &str) -> Team {
        Team {
            id: "team_1".into(),
            name: "Team One".into(),
            manager_id: manager_id.into(),
            budget_cap: Some(10_000),
            budget_spent: 0,
        }
    }

    #[test]
    fn admin_acts_for_any_team() {
        let auth = ManagerAuthorizer;
        let admin = Identity::new("u_admin", Role::Admin);
        assert!(auth.can_act_for(&admin, &team_managed_by("someone_else")));
        assert!(auth.is_admin(&admin));
    }

    #[test]
    fn manager_acts_only_for_own_team() {
        let auth = ManagerAuthorizer;
        let manager = Identity::new("u_mgr", Role::TeamManager);
        assert!(auth.can_act_for(&manager, &team_managed_by("u_mgr")));
        assert!(!auth.can_act_for(&manager, &team_managed_by("u_other")));
        assert!(!auth.is_admin(&manager));
    }

    #[test]
    fn player_role_cannot_bid() {
        let auth = ManagerAuthorizer;
        let player = Identity::new("u_player", Role::Player);
        assert!(!auth.can_act_for(&player, &team_managed_by("u_player")));
    }
}
