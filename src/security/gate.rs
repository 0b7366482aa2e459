//! Application-layer gates and the request validation pipeline.
//!
//! A mutating request passes, in order: an optional coarse gate, input
//! validation, the mandatory authoritative gate, business rules and finally
//! the storage write. [`Pipeline`] encodes that order in its type, so a
//! write cannot run before authorization. Every stage rejects with its own
//! [`Rejection`] variant.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::cache::SnapshotCache;
use super::clock::Clock;
use super::evaluator::{Decision, DenyReason, Evaluator};
use super::principal::PrincipalId;
use super::privilege::Privilege;
use super::scope::ScopeContext;
use crate::error::{DataError, ValidationErrors};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStage {
    /// Early "ever allowed" check made before the target scope is known.
    Coarse,
    /// The authoritative check at the application layer.
    Application,
}

impl fmt::Display for GateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateStage::Coarse => f.write_str("coarse"),
            GateStage::Application => f.write_str("application"),
        }
    }
}

/// Why a request did not complete.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("denied at {stage} gate: {reason}")]
    Denied { stage: GateStage, reason: DenyReason },
    #[error("invalid input: {0}")]
    Invalid(ValidationErrors),
    #[error("business rule violated: {0}")]
    BusinessRule(String),
    #[error(transparent)]
    Constraint(DataError),
    #[error(transparent)]
    Conflict(DataError),
    #[error(transparent)]
    NotFound(DataError),
    #[error(transparent)]
    Unavailable(DataError),
    #[error(transparent)]
    Storage(DataError),
}

impl From<DataError> for Rejection {
    fn from(err: DataError) -> Self {
        match err {
            DataError::Validation { errors, .. } => Rejection::Invalid(errors),
            e @ DataError::ConstraintViolation { .. } => Rejection::Constraint(e),
            e @ DataError::ConcurrencyConflict { .. } => Rejection::Conflict(e),
            e @ DataError::NotFound { .. } => Rejection::NotFound(e),
            e @ DataError::Connectivity(_) => Rejection::Unavailable(e),
            e => Rejection::Storage(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    InvalidInput,
    BusinessRule,
    Forbidden,
    Conflict,
    NotFound,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalFieldError {
    pub field: String,
    pub message: String,
}

/// What a boundary layer may show the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct External {
    pub class: ErrorClass,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<ExternalFieldError>,
}

impl Rejection {
    /// Full detail for input and rule failures; a bare class for
    /// authorization and storage failures.
    pub fn external(&self) -> External {
        let minimal = |class, message: &str| External {
            class,
            message: message.to_string(),
            fields: Vec::new(),
        };
        match self {
            Rejection::Invalid(errors) => External {
                class: ErrorClass::InvalidInput,
                message: "invalid input".to_string(),
                fields: errors
                    .errors()
                    .iter()
                    .map(|e| ExternalFieldError {
                        field: e.field.clone(),
                        message: e.message.clone(),
                    })
                    .collect(),
            },
            Rejection::BusinessRule(rule) => minimal(ErrorClass::BusinessRule, rule.as_str()),
            Rejection::Denied { .. } => minimal(ErrorClass::Forbidden, "not authorized"),
            Rejection::Conflict(_) => minimal(ErrorClass::Conflict, "modified concurrently, reload and retry"),
            Rejection::NotFound(_) => minimal(ErrorClass::NotFound, "not found"),
            Rejection::Unavailable(_) => minimal(ErrorClass::Unavailable, "temporarily unavailable"),
            Rejection::Constraint(_) | Rejection::Storage(_) => minimal(ErrorClass::Internal, "internal error"),
        }
    }
}

/// Checks a principal's privilege against the cached ontology, supplying
/// the current time from its clock.
pub struct Gate<P: Privilege> {
    evaluator: Evaluator,
    cache: Arc<SnapshotCache<P>>,
    clock: Arc<dyn Clock>,
}

impl<P: Privilege> Clone for Gate<P> {
    fn clone(&self) -> Self {
        Gate {
            evaluator: self.evaluator,
            cache: Arc::clone(&self.cache),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<P: Privilege> Gate<P> {
    pub fn new(evaluator: Evaluator, cache: Arc<SnapshotCache<P>>, clock: Arc<dyn Clock>) -> Self {
        Gate {
            evaluator,
            cache,
            clock,
        }
    }

    /// The authoritative check. `scope` of `None` requests a global action.
    pub fn check(&self, principal: PrincipalId, privilege: P, scope: Option<&str>) -> Result<(), Rejection> {
        let now = self.clock.now();
        let snapshot = self.cache.get(now)?;
        let context = match scope {
            Some(scope) => ScopeContext::scoped(scope),
            None => ScopeContext::global(),
        }
        .at(now);
        let decision = self.evaluator.decide(&snapshot, principal, privilege, &context);
        deny_unless_allowed(GateStage::Application, principal, privilege, scope, decision)
    }

    /// Coarse early check: does the principal hold the privilege anywhere.
    pub fn check_anywhere(&self, principal: PrincipalId, privilege: P) -> Result<(), Rejection> {
        let now = self.clock.now();
        let snapshot = self.cache.get(now)?;
        let decision = self
            .evaluator
            .holds_anywhere(&snapshot, principal, privilege, Some(now));
        deny_unless_allowed(GateStage::Coarse, principal, privilege, None, decision)
    }

    pub fn request(&self, principal: PrincipalId, privilege: P, scope: Option<&str>) -> Pipeline<'_, P, Pending> {
        Pipeline {
            gate: self,
            principal,
            privilege,
            scope: scope.map(str::to_string),
            _state: PhantomData,
        }
    }
}

fn deny_unless_allowed<P: Privilege>(
    stage: GateStage,
    principal: PrincipalId,
    privilege: P,
    scope: Option<&str>,
    decision: Decision,
) -> Result<(), Rejection> {
    match decision {
        Decision::Allowed => Ok(()),
        Decision::Denied(reason) => {
            tracing::info!(
                %principal,
                privilege = privilege.name(),
                scope = scope.unwrap_or("<global>"),
                %stage,
                %reason,
                "authorization denied"
            );
            Err(Rejection::Denied { stage, reason })
        }
    }
}

/// Pipeline state before the authoritative gate.
#[derive(Debug)]
pub enum Pending {}

/// Pipeline state after the authoritative gate allowed the request.
#[derive(Debug)]
pub enum Authorized {}

/// One request moving through the validation stages.
///
/// ```ignore
/// let office = gate
///     .request(user, Hr::AddEmployee, Some("Office:Cleveland"))
///     .validate(|errors| {
///         if input.name.is_empty() {
///             errors.push("name", "must not be empty");
///         }
///     })?
///     .authorize()?
///     .execute(|| employees.create(input))?;
/// ```
pub struct Pipeline<'g, P: Privilege, S> {
    gate: &'g Gate<P>,
    principal: PrincipalId,
    privilege: P,
    scope: Option<String>,
    _state: PhantomData<S>,
}

impl<'g, P: Privilege> Pipeline<'g, P, Pending> {
    pub fn coarse_gate(self) -> Result<Self, Rejection> {
        self.gate.check_anywhere(self.principal, self.privilege)?;
        Ok(self)
    }

    /// Collect field-level input errors; any recorded error rejects.
    pub fn validate(self, check: impl FnOnce(&mut ValidationErrors)) -> Result<Self, Rejection> {
        let mut errors = ValidationErrors::new();
        check(&mut errors);
        errors.into_result().map_err(Rejection::Invalid)?;
        Ok(self)
    }

    pub fn authorize(self) -> Result<Pipeline<'g, P, Authorized>, Rejection> {
        self.gate
            .check(self.principal, self.privilege, self.scope.as_deref())?;
        Ok(Pipeline {
            gate: self.gate,
            principal: self.principal,
            privilege: self.privilege,
            scope: self.scope,
            _state: PhantomData,
        })
    }
}

impl<'g, P: Privilege> Pipeline<'g, P, Authorized> {
    pub fn check_rules(self, rules: impl FnOnce() -> Result<(), String>) -> Result<Self, Rejection> {
        rules().map_err(Rejection::BusinessRule)?;
        Ok(self)
    }

    /// Run the storage write. Constraint violations point at an
    /// application bug and are logged with full detail.
    pub fn execute<T>(self, write: impl FnOnce() -> Result<T, DataError>) -> Result<T, Rejection> {
        write().map_err(|err| {
            match &err {
                DataError::ConstraintViolation { .. } => tracing::error!(
                    principal = %self.principal,
                    privilege = self.privilege.name(),
                    error = %err,
                    "storage constraint violated"
                ),
                DataError::Validation { .. } => {}
                _ => tracing::warn!(
                    principal = %self.principal,
                    privilege = self.privilege.name(),
                    error = %err,
                    "storage write failed"
                ),
            }
            Rejection::from(err)
        })
    }
}
