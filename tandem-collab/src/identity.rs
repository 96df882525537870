//! Who is subscribing to what.
//!
//! An identity is fixed for the lifetime of a binding. User and tenant ids
//! arrive already authenticated; nothing here validates them.

use std::fmt;

/// Identity of a presence subscription: one user watching one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    /// Entity type, e.g. `Order`.
    pub entity_type: String,
    pub entity_id: String,
    pub tenant_id: String,
    pub user_id: String,
}

impl SessionIdentity {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{} as {}",
            self.entity_type, self.entity_id, self.tenant_id, self.user_id
        )
    }
}

/// Identity of a workflow co-editing session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollabIdentity {
    /// Workflow entity whose graph is being edited.
    pub entity: String,
    pub user_id: String,
    /// Display name shown to the other editors.
    pub username: String,
}

impl CollabIdentity {
    pub fn new(
        entity: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

impl fmt::Display for CollabIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} as {} ({})", self.entity, self.user_id, self.username)
    }
}
