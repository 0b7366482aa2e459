use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::ontology::{
    GroupAdapter, GroupMemberAdapter, GroupMemberRecord, GroupRecord, GroupRoleAdapter,
    GroupRoleRecord, NewGroupMemberRecord, NewGroupRecord, NewGroupRoleRecord,
    NewPrincipalRecord, NewPrivilegeRecord, NewRolePrivilegeRecord, NewRoleRecord,
    NewScopeRecord, NewUserRoleRecord, PrincipalAdapter, PrincipalRecord, PrivilegeAdapter,
    RoleAdapter, RolePrivilegeAdapter, RoleRecord, ScopeAdapter, ScopeRecord, UserRoleAdapter,
    UserRoleRecord,
};
use super::principal::{GroupId, PrincipalId, PrincipalKind, RoleId};
use super::privilege::Privilege;
use super::scope::Scope;
use crate::adapter::{Connection, Create, Delete, Find, GetAll, Save};
use crate::error::DataError;
use crate::model::Filter;

/// Writes the security ontology through the adapters on a [`Connection`].
///
/// Callers are expected to have passed their own gate before calling in;
/// this service only maintains the rows.
#[derive(Clone)]
pub struct SecurityAdmin {
    conn: Arc<Connection>,
}

impl SecurityAdmin {
    pub fn new(conn: Arc<Connection>) -> Self {
        SecurityAdmin { conn }
    }

    /// Persist every privilege `P` declares that is not stored yet.
    /// Returns how many rows were added.
    pub fn seed_privileges<P: Privilege>(&self) -> Result<usize, DataError> {
        let privileges = self.conn.adapter::<dyn PrivilegeAdapter>()?;
        let stored: HashSet<String> = privileges
            .get_all()?
            .map(|record| record.map(|r| r.name().clone()))
            .collect::<Result<_, _>>()?;

        let mut created = 0;
        for privilege in P::ALL {
            if stored.contains(privilege.name()) {
                continue;
            }
            privileges.create(NewPrivilegeRecord {
                name: privilege.name().to_string(),
            })?;
            created += 1;
        }
        tracing::debug!(created, total = P::ALL.len(), "seeded privileges");
        Ok(created)
    }

    pub fn create_user(
        &self,
        name: &str,
        display_name: &str,
        email: Option<&str>,
    ) -> Result<PrincipalRecord, DataError> {
        self.conn.adapter::<dyn PrincipalAdapter>()?.create(NewPrincipalRecord {
            kind: PrincipalKind::User,
            name: name.to_string(),
            display_name: display_name.to_string(),
            email: email.map(str::to_string),
            owner: None,
            active: true,
        })
    }

    pub fn create_service(&self, name: &str, owner: &str) -> Result<PrincipalRecord, DataError> {
        self.conn.adapter::<dyn PrincipalAdapter>()?.create(NewPrincipalRecord {
            kind: PrincipalKind::Service,
            name: name.to_string(),
            display_name: name.to_string(),
            email: None,
            owner: Some(owner.to_string()),
            active: true,
        })
    }

    pub fn find_principal(&self, name: &str) -> Result<Option<PrincipalRecord>, DataError> {
        self.conn
            .adapter::<dyn PrincipalAdapter>()?
            .find(&Filter::eq("name", name))
    }

    /// Principals are never deleted; a deactivated one is denied everything.
    pub fn deactivate(&self, principal: &mut PrincipalRecord) -> Result<(), DataError> {
        principal.set_active(false);
        self.conn.adapter::<dyn PrincipalAdapter>()?.save(principal)?;
        tracing::info!(principal = %principal.id(), "principal deactivated");
        Ok(())
    }

    /// Create a role carrying `privileges`. Each must already be seeded.
    pub fn define_role<P: Privilege>(
        &self,
        name: &str,
        description: Option<&str>,
        privileges: &[P],
    ) -> Result<RoleRecord, DataError> {
        let catalog = self.conn.adapter::<dyn PrivilegeAdapter>()?;
        let mut ids = Vec::with_capacity(privileges.len());
        for privilege in privileges {
            let record = catalog
                .find(&Filter::eq("name", privilege.name()))?
                .ok_or_else(|| DataError::NotFound {
                    collection: "privileges".to_string(),
                    key: privilege.name().to_string(),
                })?;
            ids.push(*record.id());
        }

        let role = self.conn.adapter::<dyn RoleAdapter>()?.create(NewRoleRecord {
            name: name.to_string(),
            description: description.map(str::to_string),
        })?;
        let grants = self.conn.adapter::<dyn RolePrivilegeAdapter>()?;
        for privilege_id in ids {
            grants.create(NewRolePrivilegeRecord {
                role_id: *role.id(),
                privilege_id,
            })?;
        }
        tracing::debug!(role = %name, privileges = privileges.len(), "defined role");
        Ok(role)
    }

    pub fn find_role(&self, name: &str) -> Result<Option<RoleRecord>, DataError> {
        self.conn
            .adapter::<dyn RoleAdapter>()?
            .find(&Filter::eq("name", name))
    }

    /// The stored row for `scope`, created on first use.
    pub fn scope(&self, scope: &Scope) -> Result<ScopeRecord, DataError> {
        let scopes = self.conn.adapter::<dyn ScopeAdapter>()?;
        if let Some(existing) = scopes.find(&Filter::eq("name", scope.as_str()))? {
            return Ok(existing);
        }
        scopes.create(NewScopeRecord {
            name: scope.to_string(),
        })
    }

    pub fn assign_role(
        &self,
        principal: PrincipalId,
        role: RoleId,
        scope: Option<&Scope>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserRoleRecord, DataError> {
        let scope_id = match scope {
            Some(scope) => Some(*self.scope(scope)?.id()),
            None => None,
        };
        let assignment = self.conn.adapter::<dyn UserRoleAdapter>()?.create(NewUserRoleRecord {
            principal_id: principal,
            role_id: role,
            scope_id,
            expires_at,
        })?;
        tracing::info!(%principal, %role, scope = scope.map(Scope::as_str).unwrap_or("<global>"), "role assigned");
        Ok(assignment)
    }

    /// Remove a direct assignment. `false` when there was none.
    pub fn revoke_role(
        &self,
        principal: PrincipalId,
        role: RoleId,
        scope: Option<&Scope>,
    ) -> Result<bool, DataError> {
        let Some(scope_filter) = self.scope_filter(scope)? else {
            return Ok(false);
        };
        let assignments = self.conn.adapter::<dyn UserRoleAdapter>()?;
        let filter = Filter::eq("principal_id", principal)
            .and(Filter::eq("role_id", role))
            .and(scope_filter);
        match assignments.find(&filter)? {
            Some(assignment) => {
                assignments.delete(assignment)?;
                tracing::info!(%principal, %role, "role revoked");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn create_group(&self, name: &str, directory_ref: Option<&str>) -> Result<GroupRecord, DataError> {
        self.conn.adapter::<dyn GroupAdapter>()?.create(NewGroupRecord {
            name: name.to_string(),
            directory_ref: directory_ref.map(str::to_string),
        })
    }

    pub fn add_member(&self, group: GroupId, principal: PrincipalId) -> Result<GroupMemberRecord, DataError> {
        self.conn
            .adapter::<dyn GroupMemberAdapter>()?
            .create(NewGroupMemberRecord {
                group_id: group,
                principal_id: principal,
            })
    }

    pub fn remove_member(&self, group: GroupId, principal: PrincipalId) -> Result<bool, DataError> {
        let members = self.conn.adapter::<dyn GroupMemberAdapter>()?;
        let filter = Filter::eq("group_id", group).and(Filter::eq("principal_id", principal));
        match members.find(&filter)? {
            Some(member) => {
                members.delete(member)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn assign_group_role(
        &self,
        group: GroupId,
        role: RoleId,
        scope: Option<&Scope>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<GroupRoleRecord, DataError> {
        let scope_id = match scope {
            Some(scope) => Some(*self.scope(scope)?.id()),
            None => None,
        };
        self.conn.adapter::<dyn GroupRoleAdapter>()?.create(NewGroupRoleRecord {
            group_id: group,
            role_id: role,
            scope_id,
            expires_at,
        })
    }

    /// `None` when the scope was never stored, so nothing can reference it.
    fn scope_filter(&self, scope: Option<&Scope>) -> Result<Option<Filter>, DataError> {
        match scope {
            None => Ok(Some(Filter::is_null("scope_id"))),
            Some(scope) => {
                let found = self
                    .conn
                    .adapter::<dyn ScopeAdapter>()?
                    .find(&Filter::eq("name", scope.as_str()))?;
                Ok(found.map(|record| Filter::eq("scope_id", *record.id())))
            }
        }
    }
}
