use std::collections::HashSet;

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Identity on whose behalf an operation runs. Authorization of the operation itself is
/// decided before the call; the actor only carries the capabilities this crate checks.
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub guid: Option<Uuid>,
    pub email: Option<String>,
    pub admin: bool,
    pub billing_managed_organizations: HashSet<Uuid>,
}

impl Actor {
    pub fn user(guid: Uuid, email: impl Into<String>) -> Self {
        Self {
            guid: Some(guid),
            email: Some(email.into()),
            ..Self::default()
        }
    }

    pub fn admin(guid: Uuid, email: impl Into<String>) -> Self {
        Self {
            admin: true,
            ..Self::user(guid, email)
        }
    }

    /// Actor used by collaborators reporting back into the core (staging, health manager).
    pub fn system() -> Self {
        Self::default()
    }

    pub fn with_billing_manager_of(mut self, organization_guid: Uuid) -> Self {
        self.billing_managed_organizations.insert(organization_guid);
        self
    }

    pub fn require_admin(&self, field: &str) -> CoreResult<()> {
        if self.admin {
            Ok(())
        } else {
            Err(CoreError::Forbidden(format!(
                "only an admin may change {field}"
            )))
        }
    }

    pub fn can_view_billing(&self, organization_guid: Uuid) -> bool {
        self.admin
            || self
                .billing_managed_organizations
                .contains(&organization_guid)
    }

    pub fn log_ref(&self) -> String {
        match (&self.guid, self.admin) {
            (Some(guid), true) => format!("admin:{guid}"),
            (Some(guid), false) => format!("user:{guid}"),
            (None, _) => "system".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_visibility_is_limited_to_admins_and_billing_managers() {
        let org = Uuid::new_v4();
        let other = Uuid::new_v4();

        let manager = Actor::user(Uuid::new_v4(), "bm@example.com").with_billing_manager_of(org);
        assert!(manager.can_view_billing(org));
        assert!(!manager.can_view_billing(other));
        assert!(manager.require_admin("quota_definition").is_err());

        let admin = Actor::admin(Uuid::new_v4(), "admin@example.com");
        assert!(admin.can_view_billing(other));
        assert!(admin.require_admin("quota_definition").is_ok());
        assert!(Actor::system().log_ref() == "system");
    }
}
