//! Role-based authorization.
//!
//! Principals hold roles, directly or through groups, optionally limited to
//! a scope. Roles are data; privileges are a compile-time enum. A [`Gate`]
//! asks the pure [`Evaluator`] about a cached [`SecuritySnapshot`] of the
//! ontology, which [`SecurityAdmin`] maintains through a [`crate::Connection`].

mod admin;
mod cache;
mod clock;
mod directory;
mod evaluator;
mod gate;
mod ontology;
mod principal;
mod privilege;
mod scope;
mod snapshot;
mod token;

pub use admin::SecurityAdmin;
pub use cache::{ConnectionSource, SnapshotCache, SnapshotSource};
pub use clock::{Clock, FixedClock, SystemClock};
pub use directory::{Directory, DirectoryError, Freshness, MembershipCache};
pub use evaluator::{Decision, DenyReason, Evaluator};
pub use gate::{
    Authorized, ErrorClass, External, ExternalFieldError, Gate, GateStage, Pending, Pipeline,
    Rejection,
};
pub use ontology::{
    install_security, GroupAdapter, GroupMemberAdapter, GroupMemberRecord, GroupRecord,
    GroupRoleAdapter, GroupRoleRecord, NewGroupMemberRecord, NewGroupRecord, NewGroupRoleRecord,
    NewPrincipalRecord, NewPrivilegeRecord, NewRolePrivilegeRecord, NewRoleRecord,
    NewScopeRecord, NewUserRoleRecord, PrincipalAdapter, PrincipalRecord, PrivilegeAdapter,
    PrivilegeRecord, RoleAdapter, RolePrivilegeAdapter, RolePrivilegeRecord, RoleRecord,
    ScopeAdapter, ScopeRecord, UserRoleAdapter, UserRoleRecord,
};
pub use principal::{GroupId, PrincipalId, PrincipalKind, RoleId, ScopeId};
pub use privilege::Privilege;
pub use scope::{Scope, ScopeContext, ScopeError, ScopeMatching};
pub use snapshot::{Assignment, GroupState, PrincipalState, SecuritySnapshot, SnapshotError};
pub use token::{
    hash_secret, ApiToken, SecretStore, SecretStoreError, StoredSecret, TokenError,
    TokenVerifier, Verification, ALERT_TARGET,
};
