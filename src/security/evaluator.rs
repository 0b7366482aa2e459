//! The authorization decision.
//!
//! A principal holds a privilege in a requested scope when at least one of
//! its effective assignments (direct, or through any group containing it)
//! names a role carrying that privilege, is still live at the context's
//! `now`, and has a scope covering the requested one. An unscoped
//! assignment covers every scope. Anything the evaluator cannot interpret
//! denies.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::principal::PrincipalId;
use super::privilege::Privilege;
use super::scope::{Scope, ScopeContext, ScopeMatching};
use super::snapshot::{Assignment, SecuritySnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenyReason {
    #[error("unknown principal")]
    UnknownPrincipal,
    #[error("principal is deactivated")]
    InactivePrincipal,
    #[error("privilege `{0}` is not in the persisted catalog")]
    UnknownPrivilege(&'static str),
    #[error("malformed scope context: {0}")]
    MalformedContext(String),
    #[error("no assignment grants `{0}` in the requested scope")]
    NoMatchingGrant(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Stateless decision function. Safe to copy into every gate and call
/// from any thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evaluator {
    matching: ScopeMatching,
}

impl Evaluator {
    pub fn new(matching: ScopeMatching) -> Self {
        Evaluator { matching }
    }

    pub fn matching(&self) -> ScopeMatching {
        self.matching
    }

    pub fn is_authorized<P: Privilege>(
        &self,
        snapshot: &SecuritySnapshot<P>,
        principal: PrincipalId,
        privilege: P,
        context: &ScopeContext,
    ) -> bool {
        self.decide(snapshot, principal, privilege, context).is_allowed()
    }

    pub fn decide<P: Privilege>(
        &self,
        snapshot: &SecuritySnapshot<P>,
        principal: PrincipalId,
        privilege: P,
        context: &ScopeContext,
    ) -> Decision {
        if let Err(reason) = usable(snapshot, principal, privilege) {
            return Decision::Denied(reason);
        }
        let requested = match context.scope().map(Scope::parse).transpose() {
            Ok(requested) => requested,
            Err(e) => return Decision::Denied(DenyReason::MalformedContext(e.to_string())),
        };

        let granted = snapshot.assignments_of(principal).any(|assignment| {
            carries(snapshot, assignment, privilege)
                && live(assignment, context.now())
                && self.covers(assignment.scope.as_ref(), requested.as_ref())
        });
        if granted {
            Decision::Allowed
        } else {
            Decision::Denied(DenyReason::NoMatchingGrant(privilege.name()))
        }
    }

    /// Whether the principal holds the privilege in any scope at all. Backs
    /// coarse early gates that run before the target scope is known.
    pub fn holds_anywhere<P: Privilege>(
        &self,
        snapshot: &SecuritySnapshot<P>,
        principal: PrincipalId,
        privilege: P,
        now: Option<DateTime<Utc>>,
    ) -> Decision {
        if let Err(reason) = usable(snapshot, principal, privilege) {
            return Decision::Denied(reason);
        }
        if snapshot
            .assignments_of(principal)
            .any(|assignment| carries(snapshot, assignment, privilege) && live(assignment, now))
        {
            Decision::Allowed
        } else {
            Decision::Denied(DenyReason::NoMatchingGrant(privilege.name()))
        }
    }

    fn covers(&self, granted: Option<&Scope>, requested: Option<&Scope>) -> bool {
        match (granted, requested) {
            (None, _) => true,
            (Some(granted), Some(requested)) => granted.covers(requested, self.matching),
            // a scoped grant never covers a global request
            (Some(_), None) => false,
        }
    }
}

fn usable<P: Privilege>(
    snapshot: &SecuritySnapshot<P>,
    principal: PrincipalId,
    privilege: P,
) -> Result<(), DenyReason> {
    match snapshot.principal_state(principal) {
        None => return Err(DenyReason::UnknownPrincipal),
        Some(state) if !state.active => return Err(DenyReason::InactivePrincipal),
        Some(_) => {}
    }
    if !snapshot.in_catalog(privilege) {
        return Err(DenyReason::UnknownPrivilege(privilege.name()));
    }
    Ok(())
}

fn carries<P: Privilege>(snapshot: &SecuritySnapshot<P>, assignment: &Assignment, privilege: P) -> bool {
    snapshot
        .role_privileges(assignment.role)
        .is_some_and(|privileges| privileges.contains(&privilege))
}

/// An expiring assignment only counts when the caller supplied `now`.
fn live(assignment: &Assignment, now: Option<DateTime<Utc>>) -> bool {
    match (assignment.expires_at, now) {
        (None, _) => true,
        (Some(expires_at), Some(now)) => now < expires_at,
        (Some(_), None) => false,
    }
}
