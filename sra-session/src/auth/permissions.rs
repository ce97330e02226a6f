//! Permission evaluation for gating UI actions.
//!
//! A user may perform `action` on `resource` when the exact pair is granted
//! directly or through the user's role. There is no wildcard or hierarchy
//! matching and comparison is case-sensitive.
//!
//! These checks only decide what the UI offers. The server enforces every
//! permission independently.

use crate::errors::{Error, Result};
use crate::types::{Permission, User};

/// Returns true iff `user` holds `(resource, action)` directly or via its role.
pub fn check(user: Option<&User>, resource: &str, action: &str) -> bool {
    let Some(user) = user else {
        return false;
    };
    user.permissions.iter().any(|p| p.matches(resource, action)) || user.role.permissions.iter().any(|p| p.matches(resource, action))
}

/// Like [`check`], but returns `InsufficientPermissions` for use with `?`.
pub fn require(user: Option<&User>, required: &Permission) -> Result<()> {
    if check(user, &required.resource, &required.action) {
        Ok(())
    } else {
        Err(Error::InsufficientPermissions {
            required: required.clone(),
        })
    }
}

/// Known gated actions on the dashboard.
pub mod catalog {
    use crate::types::Permission;

    pub const MISSIONS: &str = "missions";
    pub const THREATS: &str = "threats";
    pub const INCIDENTS: &str = "incidents";
    pub const COMPLIANCE: &str = "compliance";

    pub fn missions_read() -> Permission {
        Permission::new(MISSIONS, "read")
    }

    pub fn missions_create() -> Permission {
        Permission::new(MISSIONS, "create")
    }

    pub fn missions_execute() -> Permission {
        Permission::new(MISSIONS, "execute")
    }

    pub fn missions_emergency_stop() -> Permission {
        Permission::new(MISSIONS, "emergency_stop")
    }

    pub fn threats_read() -> Permission {
        Permission::new(THREATS, "read")
    }

    pub fn threats_analyze() -> Permission {
        Permission::new(THREATS, "analyze")
    }

    pub fn incidents_read() -> Permission {
        Permission::new(INCIDENTS, "read")
    }

    pub fn incidents_create() -> Permission {
        Permission::new(INCIDENTS, "create")
    }

    pub fn incidents_respond() -> Permission {
        Permission::new(INCIDENTS, "respond")
    }

    pub fn compliance_read() -> Permission {
        Permission::new(COMPLIANCE, "read")
    }

    pub fn compliance_audit() -> Permission {
        Permission::new(COMPLIANCE, "audit")
    }

    /// Every catalogued permission.
    pub fn all() -> Vec<Permission> {
        vec![
            missions_read(),
            missions_create(),
            missions_execute(),
            missions_emergency_stop(),
            threats_read(),
            threats_analyze(),
            incidents_read(),
            incidents_create(),
            incidents_respond(),
            compliance_read(),
            compliance_audit(),
        ]
    }
}
