//! Resolved, read-only view of the security ontology.
//!
//! The evaluator decides against a snapshot rather than the store, so a
//! decision never performs I/O. Snapshots are either loaded from a
//! [`Connection`] or assembled in code.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::ontology::{
    GroupAdapter, GroupMemberAdapter, GroupRoleAdapter, PrincipalAdapter, PrivilegeAdapter,
    RoleAdapter, RolePrivilegeAdapter, ScopeAdapter, UserRoleAdapter,
};
use super::principal::{GroupId, PrincipalId, PrincipalKind, RoleId, ScopeId};
use super::privilege::Privilege;
use super::scope::Scope;
use crate::adapter::{Connection, GetAll};
use crate::error::DataError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("unknown principal {0}")]
    UnknownPrincipal(PrincipalId),
    #[error("unknown role {0}")]
    UnknownRole(RoleId),
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),
    #[error("role {role} is already assigned with scope {scope:?}")]
    DuplicateAssignment { role: RoleId, scope: Option<String> },
}

/// A role assignment edge, on a principal or on a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub role: RoleId,
    /// `None` covers every requested scope.
    pub scope: Option<Scope>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrincipalState {
    pub kind: PrincipalKind,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupState {
    pub name: String,
    pub directory_ref: Option<String>,
    pub members: HashSet<PrincipalId>,
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone)]
pub struct SecuritySnapshot<P: Privilege> {
    catalog: HashSet<P>,
    principals: HashMap<PrincipalId, PrincipalState>,
    roles: HashMap<RoleId, HashSet<P>>,
    direct: HashMap<PrincipalId, Vec<Assignment>>,
    groups: HashMap<GroupId, GroupState>,
}

impl<P: Privilege> Default for SecuritySnapshot<P> {
    fn default() -> Self {
        SecuritySnapshot {
            catalog: HashSet::new(),
            principals: HashMap::new(),
            roles: HashMap::new(),
            direct: HashMap::new(),
            groups: HashMap::new(),
        }
    }
}

impl<P: Privilege> SecuritySnapshot<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark every declared privilege as persisted.
    pub fn seed_catalog(&mut self) -> &mut Self {
        self.catalog.extend(P::ALL.iter().copied());
        self
    }

    pub fn catalog(&mut self, privileges: impl IntoIterator<Item = P>) -> &mut Self {
        self.catalog.extend(privileges);
        self
    }

    pub fn principal(&mut self, id: PrincipalId, kind: PrincipalKind, active: bool) -> &mut Self {
        self.principals.insert(id, PrincipalState { kind, active });
        self
    }

    pub fn role(&mut self, id: RoleId, privileges: impl IntoIterator<Item = P>) -> &mut Self {
        self.roles.entry(id).or_default().extend(privileges);
        self
    }

    pub fn assign(
        &mut self,
        principal: PrincipalId,
        role: RoleId,
        scope: Option<Scope>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<&mut Self, SnapshotError> {
        if !self.principals.contains_key(&principal) {
            return Err(SnapshotError::UnknownPrincipal(principal));
        }
        if !self.roles.contains_key(&role) {
            return Err(SnapshotError::UnknownRole(role));
        }
        let edges = self.direct.entry(principal).or_default();
        push_assignment(edges, role, scope, expires_at)?;
        Ok(self)
    }

    pub fn group(&mut self, id: GroupId, name: &str, directory_ref: Option<&str>) -> &mut Self {
        let state = self.groups.entry(id).or_insert_with(|| GroupState {
            name: String::new(),
            directory_ref: None,
            members: HashSet::new(),
            assignments: Vec::new(),
        });
        state.name = name.to_string();
        state.directory_ref = directory_ref.map(str::to_string);
        self
    }

    pub fn member(&mut self, group: GroupId, principal: PrincipalId) -> Result<&mut Self, SnapshotError> {
        if !self.principals.contains_key(&principal) {
            return Err(SnapshotError::UnknownPrincipal(principal));
        }
        self.group_mut(group)?.members.insert(principal);
        Ok(self)
    }

    pub fn assign_group(
        &mut self,
        group: GroupId,
        role: RoleId,
        scope: Option<Scope>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<&mut Self, SnapshotError> {
        if !self.roles.contains_key(&role) {
            return Err(SnapshotError::UnknownRole(role));
        }
        let state = self.group_mut(group)?;
        push_assignment(&mut state.assignments, role, scope, expires_at)?;
        Ok(self)
    }

    /// Swap a group's membership wholesale, e.g. after a directory sync.
    pub fn replace_members(
        &mut self,
        group: GroupId,
        members: impl IntoIterator<Item = PrincipalId>,
    ) -> Result<&mut Self, SnapshotError> {
        self.group_mut(group)?.members = members.into_iter().collect();
        Ok(self)
    }

    fn group_mut(&mut self, group: GroupId) -> Result<&mut GroupState, SnapshotError> {
        self.groups
            .get_mut(&group)
            .ok_or(SnapshotError::UnknownGroup(group))
    }

    pub fn principal_state(&self, id: PrincipalId) -> Option<PrincipalState> {
        self.principals.get(&id).copied()
    }

    pub fn in_catalog(&self, privilege: P) -> bool {
        self.catalog.contains(&privilege)
    }

    pub fn role_privileges(&self, role: RoleId) -> Option<&HashSet<P>> {
        self.roles.get(&role)
    }

    pub fn group_state(&self, group: GroupId) -> Option<&GroupState> {
        self.groups.get(&group)
    }

    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &GroupState)> {
        self.groups.iter().map(|(id, state)| (*id, state))
    }

    /// Groups whose membership currently includes `principal`.
    pub fn groups_of(&self, principal: PrincipalId) -> impl Iterator<Item = GroupId> + '_ {
        self.groups
            .iter()
            .filter(move |(_, state)| state.members.contains(&principal))
            .map(|(id, _)| *id)
    }

    /// Every assignment contributing to `principal`'s effective grants:
    /// direct ones first, then those of each containing group.
    pub fn assignments_of(&self, principal: PrincipalId) -> impl Iterator<Item = &Assignment> + '_ {
        let direct = self.direct.get(&principal).into_iter().flatten();
        let inherited = self
            .groups
            .values()
            .filter(move |state| state.members.contains(&principal))
            .flat_map(|state| state.assignments.iter());
        direct.chain(inherited)
    }

    /// Load the whole ontology through the adapters registered on `conn`.
    ///
    /// Rows the current build cannot interpret (a privilege name no longer
    /// declared, a malformed scope) are dropped with a warning, which only
    /// ever removes grants.
    pub fn load(conn: &Connection) -> Result<Self, DataError> {
        let mut snapshot = Self::new();

        let mut privilege_ids = HashMap::new();
        for record in conn.adapter::<dyn PrivilegeAdapter>()?.get_all()? {
            let record = record?;
            match P::from_name(record.name()) {
                Some(privilege) => {
                    privilege_ids.insert(*record.id(), privilege);
                    snapshot.catalog.insert(privilege);
                }
                None => tracing::warn!(name = %record.name(), "ignoring privilege not declared in this build"),
            }
        }

        for record in conn.adapter::<dyn PrincipalAdapter>()?.get_all()? {
            let record = record?;
            snapshot.principal(*record.id(), *record.kind(), *record.active());
        }

        for record in conn.adapter::<dyn RoleAdapter>()?.get_all()? {
            snapshot.role(*record?.id(), []);
        }
        for record in conn.adapter::<dyn RolePrivilegeAdapter>()?.get_all()? {
            let record = record?;
            if let Some(privilege) = privilege_ids.get(record.privilege_id()) {
                snapshot.role(*record.role_id(), [*privilege]);
            }
        }

        let mut scopes = HashMap::new();
        for record in conn.adapter::<dyn ScopeAdapter>()?.get_all()? {
            let record = record?;
            match Scope::parse(record.name()) {
                Ok(scope) => {
                    scopes.insert(*record.id(), scope);
                }
                Err(e) => tracing::warn!(scope = %record.name(), error = %e, "ignoring malformed stored scope"),
            }
        }

        for record in conn.adapter::<dyn UserRoleAdapter>()?.get_all()? {
            let record = record?;
            let Some(scope) = resolve_scope(&scopes, *record.scope_id()) else {
                continue;
            };
            if let Err(e) = snapshot.assign(*record.principal_id(), *record.role_id(), scope, *record.expires_at()) {
                tracing::warn!(id = record.id(), error = %e, "dropping user role assignment");
            }
        }

        for record in conn.adapter::<dyn GroupAdapter>()?.get_all()? {
            let record = record?;
            snapshot.group(*record.id(), record.name(), record.directory_ref().as_deref());
        }
        for record in conn.adapter::<dyn GroupMemberAdapter>()?.get_all()? {
            let record = record?;
            if let Err(e) = snapshot.member(*record.group_id(), *record.principal_id()) {
                tracing::warn!(id = record.id(), error = %e, "dropping group membership");
            }
        }
        for record in conn.adapter::<dyn GroupRoleAdapter>()?.get_all()? {
            let record = record?;
            let Some(scope) = resolve_scope(&scopes, *record.scope_id()) else {
                continue;
            };
            if let Err(e) = snapshot.assign_group(*record.group_id(), *record.role_id(), scope, *record.expires_at()) {
                tracing::warn!(id = record.id(), error = %e, "dropping group role assignment");
            }
        }

        tracing::debug!(
            principals = snapshot.principals.len(),
            roles = snapshot.roles.len(),
            groups = snapshot.groups.len(),
            "loaded security snapshot"
        );
        Ok(snapshot)
    }
}

fn push_assignment(
    edges: &mut Vec<Assignment>,
    role: RoleId,
    scope: Option<Scope>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), SnapshotError> {
    if edges.iter().any(|a| a.role == role && a.scope == scope) {
        return Err(SnapshotError::DuplicateAssignment {
            role,
            scope: scope.map(|s| s.to_string()),
        });
    }
    edges.push(Assignment {
        role,
        scope,
        expires_at,
    });
    Ok(())
}

/// `None` when the edge references a scope that was dropped on load.
fn resolve_scope(scopes: &HashMap<ScopeId, Scope>, id: Option<ScopeId>) -> Option<Option<Scope>> {
    match id {
        None => Some(None),
        Some(id) => match scopes.get(&id) {
            Some(scope) => Some(Some(scope.clone())),
            None => {
                tracing::warn!(scope_id = %id, "dropping assignment on unusable scope");
                None
            }
        },
    }
}
