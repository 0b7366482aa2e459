//! Persisted shape of the security ontology.
//!
//! One `principals` table discriminated by kind, build-time seeded
//! `privileges`, data-defined `roles`, `scopes` and `groups`, and the
//! association tables between them. Assignment edges carry an optional
//! scope; uniqueness of (holder, role, scope) is a composite index on which
//! a null scope counts as a value.

use chrono::{DateTime, Utc};

use super::principal::{GroupId, PrincipalId, PrincipalKind, RoleId, ScopeId};
use crate::adapter::{ConnectionBuilder, LoadRelated};
use crate::error::DataError;
use crate::model::HasMany;
use crate::storage::MemoryStore;
use crate::{model_adapter, Model};

#[derive(Debug, Clone, Model)]
#[model(collection = "principals")]
pub struct PrincipalRecord {
    #[model(key)]
    id: PrincipalId,
    kind: PrincipalKind,
    /// Login or service name, e.g. `mdoherty`.
    #[model(unique, non_empty, max_len = 64)]
    name: String,
    #[model(mutable, non_empty, max_len = 200)]
    display_name: String,
    #[model(mutable, unique, max_len = 254)]
    email: Option<String>,
    /// Owning team of a service principal.
    #[model(mutable)]
    owner: Option<String>,
    #[model(mutable)]
    active: bool,
    #[model(version)]
    version: u64,
}

#[derive(Debug, Clone, Model)]
#[model(collection = "privileges")]
pub struct PrivilegeRecord {
    #[model(key)]
    id: i64,
    #[model(unique, non_empty)]
    name: String,
}

#[derive(Debug, Clone, Model)]
#[model(collection = "roles")]
pub struct RoleRecord {
    #[model(key)]
    id: RoleId,
    #[model(unique, non_empty, max_len = 100)]
    name: String,
    #[model(mutable)]
    description: Option<String>,
    #[model(version)]
    version: u64,
    #[model(has_many(child_key = "role_id"))]
    grants: HasMany<RolePrivilegeRecord>,
}

#[derive(Debug, Clone, Model)]
#[model(collection = "role_privileges", unique_together("role_id", "privilege_id"))]
pub struct RolePrivilegeRecord {
    #[model(key)]
    id: i64,
    #[model(references = "roles")]
    role_id: RoleId,
    #[model(references = "privileges")]
    privilege_id: i64,
}

#[derive(Debug, Clone, Model)]
#[model(collection = "scopes")]
pub struct ScopeRecord {
    #[model(key)]
    id: ScopeId,
    /// Canonical `Kind:Value[/Kind:Value...]` form.
    #[model(unique, non_empty)]
    name: String,
}

#[derive(Debug, Clone, Model)]
#[model(
    collection = "user_roles",
    unique_together("principal_id", "role_id", "scope_id")
)]
pub struct UserRoleRecord {
    #[model(key)]
    id: i64,
    #[model(references = "principals")]
    principal_id: PrincipalId,
    #[model(references = "roles")]
    role_id: RoleId,
    #[model(references = "scopes")]
    scope_id: Option<ScopeId>,
    #[model(mutable)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Model)]
#[model(collection = "groups")]
pub struct GroupRecord {
    #[model(key)]
    id: GroupId,
    #[model(unique, non_empty, max_len = 100)]
    name: String,
    /// Directory-service group this group is synchronized from.
    #[model(mutable)]
    directory_ref: Option<String>,
    #[model(version)]
    version: u64,
    #[model(has_many(child_key = "group_id"))]
    members: HasMany<GroupMemberRecord>,
}

#[derive(Debug, Clone, Model)]
#[model(collection = "group_members", unique_together("group_id", "principal_id"))]
pub struct GroupMemberRecord {
    #[model(key)]
    id: i64,
    #[model(references = "groups")]
    group_id: GroupId,
    #[model(references = "principals")]
    principal_id: PrincipalId,
}

#[derive(Debug, Clone, Model)]
#[model(
    collection = "group_roles",
    unique_together("group_id", "role_id", "scope_id")
)]
pub struct GroupRoleRecord {
    #[model(key)]
    id: i64,
    #[model(references = "groups")]
    group_id: GroupId,
    #[model(references = "roles")]
    role_id: RoleId,
    #[model(references = "scopes")]
    scope_id: Option<ScopeId>,
    #[model(mutable)]
    expires_at: Option<DateTime<Utc>>,
}

model_adapter! {
    /// Principals are deactivated, never deleted.
    pub trait PrincipalAdapter for PrincipalRecord: Get, GetAll, Find, Create, Save
}

model_adapter! {
    /// Privileges are seeded from code; nothing edits them at runtime.
    pub trait PrivilegeAdapter for PrivilegeRecord: GetAll, Find, Create
}

model_adapter! {
    pub trait RoleAdapter for RoleRecord: Get, GetAll, Find, Create, Save
}

model_adapter! {
    pub trait RolePrivilegeAdapter for RolePrivilegeRecord: GetAll, Create, Delete
}

model_adapter! {
    pub trait ScopeAdapter for ScopeRecord: GetAll, Find, Create
}

model_adapter! {
    pub trait UserRoleAdapter for UserRoleRecord: GetAll, FindAll, Find, Create, Save, Delete
}

model_adapter! {
    pub trait GroupAdapter for GroupRecord: Get, GetAll, Find, Create, Save
}

model_adapter! {
    pub trait GroupMemberAdapter for GroupMemberRecord: GetAll, Find, Create, Delete
}

model_adapter! {
    pub trait GroupRoleAdapter for GroupRoleRecord: GetAll, Find, Create, Delete
}

/// Create the ontology tables on `store` and register their adapters.
pub fn install_security(store: &MemoryStore, builder: &mut ConnectionBuilder) -> Result<(), DataError> {
    let principals = store.register::<PrincipalRecord>()?;
    builder.register::<dyn PrincipalAdapter>(principals);

    let privileges = store.register::<PrivilegeRecord>()?;
    builder.register::<dyn PrivilegeAdapter>(privileges);

    let roles = store.register::<RoleRecord>()?;
    builder.register::<dyn RoleAdapter>(roles);

    let grants = store.register::<RolePrivilegeRecord>()?;
    builder
        .register::<dyn RolePrivilegeAdapter>(grants.clone())
        .register::<dyn LoadRelated<RolePrivilegeRecord>>(grants);

    let scopes = store.register::<ScopeRecord>()?;
    builder.register::<dyn ScopeAdapter>(scopes);

    let user_roles = store.register::<UserRoleRecord>()?;
    builder.register::<dyn UserRoleAdapter>(user_roles);

    let groups = store.register::<GroupRecord>()?;
    builder.register::<dyn GroupAdapter>(groups);

    let members = store.register::<GroupMemberRecord>()?;
    builder
        .register::<dyn GroupMemberAdapter>(members.clone())
        .register::<dyn LoadRelated<GroupMemberRecord>>(members);

    let group_roles = store.register::<GroupRoleRecord>()?;
    builder.register::<dyn GroupRoleAdapter>(group_roles);

    tracing::debug!("installed security ontology");
    Ok(())
}
