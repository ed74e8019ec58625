//! Tenant role authorization gate.
//!
//! A caller's role in a tenant comes from its single membership row. There is
//! no default role: no membership means no access.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::model::{Identity, Membership, Role};
use crate::store::{MembershipChange, Store};

pub struct RoleGate {
    store: Arc<dyn Store>,
}

impl RoleGate {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn resolve_role(&self, user_id: Uuid, tenant_id: Uuid) -> AppResult<Option<Role>> {
        Ok(self
            .store
            .find_membership(tenant_id, user_id)
            .await?
            .map(|m| m.role))
    }

    /// Resolve the caller's role and require it to meet `min`.
    pub async fn require_role(
        &self,
        identity: Option<&Identity>,
        tenant_id: Uuid,
        min: Role,
    ) -> AppResult<Role> {
        let identity = identity.ok_or(AppError::Unauthenticated)?;
        match self.resolve_role(identity.user_id, tenant_id).await? {
            Some(role) if role.satisfies(&min) => Ok(role),
            resolved => {
                debug!(user_id = %identity.user_id, %tenant_id, role = ?resolved, required = %min, "role check denied");
                Err(AppError::forbidden(format!("requires {min} role or higher")))
            }
        }
    }

    pub async fn list_members(&self, tenant_id: Uuid) -> AppResult<Vec<Membership>> {
        self.store.list_memberships(tenant_id).await
    }

    /// Grant or change `user_id`'s role. Actors cannot grant above their own
    /// role, and only owners grant `owner`.
    pub async fn set_member_role(
        &self,
        actor_role: &Role,
        tenant_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> AppResult<Membership> {
        if role.is_unrecognized() {
            return Err(AppError::invalid("role", format!("unknown role: {role}")));
        }
        if !actor_role.satisfies(&role) {
            return Err(AppError::forbidden(format!("cannot grant {role}")));
        }
        if let Some(current) = self.resolve_role(user_id, tenant_id).await? {
            if !actor_role.satisfies(&current) {
                return Err(AppError::forbidden(format!("cannot change a {current}")));
            }
        }
        let membership = self
            .store
            .change_membership(tenant_id, user_id, MembershipChange::Assign(role.clone()))
            .await?
            .ok_or_else(|| AppError::Internal(anyhow!("role assignment returned no membership")))?;
        info!(%tenant_id, %user_id, %role, "membership role set");
        Ok(membership)
    }

    pub async fn remove_member(
        &self,
        actor_role: &Role,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<()> {
        let current = self
            .resolve_role(user_id, tenant_id)
            .await?
            .ok_or_else(|| AppError::not_found("membership not found"))?;
        if !actor_role.satisfies(&current) {
            return Err(AppError::forbidden(format!("cannot remove a {current}")));
        }
        self.store
            .change_membership(tenant_id, user_id, MembershipChange::Remove)
            .await?;
        info!(%tenant_id, %user_id, "membership removed");
        Ok(())
    }
}

/// Refuses a change that takes the owner role away from the tenant's last
/// owner. Stores call this while holding the tenant's membership rows.
pub fn check_owner_retained(
    current: Option<&Role>,
    change: &MembershipChange,
    other_owners: usize,
) -> AppResult<()> {
    let stays_owner = matches!(change, MembershipChange::Assign(Role::Owner));
    if current == Some(&Role::Owner) && !stays_owner && other_owners == 0 {
        return Err(AppError::conflict("a tenant must keep at least one owner"));
    }
    Ok(())
}
