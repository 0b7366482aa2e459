mod world;

use std::sync::Arc;

use chrono::Duration;
use modeled_rust::security::{
    hash_secret, ApiToken, Clock, ConnectionSource, Decision, DenyReason, ErrorClass, Evaluator,
    FixedClock, Freshness, Gate, GateStage, MembershipCache, Rejection, ScopeContext,
    SnapshotCache, StoredSecret, TokenVerifier, Verification,
};
use modeled_rust::{DataError, ScopeMatching, StoreConfig};
use world::{noon, scope, world, world_with, FakeDirectory, FakeSecrets, Hr};

#[test]
fn office_admin_is_confined_to_cleveland() {
    let w = world();
    let mdoherty = w.user("mdoherty");
    let office_admin = w.office_admin();
    w.admin
        .assign_role(*mdoherty.id(), *office_admin.id(), Some(&scope("Office:Cleveland")), None)
        .unwrap();

    let snapshot = w.snapshot();
    let evaluator = Evaluator::default();
    let who = *mdoherty.id();
    assert!(evaluator.is_authorized(&snapshot, who, Hr::AddEmployee, &ScopeContext::scoped("Office:Cleveland")));
    assert!(!evaluator.is_authorized(&snapshot, who, Hr::AddEmployee, &ScopeContext::scoped("Office:Detroit")));
    assert!(!evaluator.is_authorized(&snapshot, who, Hr::AddEmployee, &ScopeContext::global()));
    assert_eq!(
        evaluator.decide(&snapshot, who, Hr::RemoveEmployee, &ScopeContext::scoped("Office:Cleveland")),
        Decision::Denied(DenyReason::NoMatchingGrant("RemoveEmployee"))
    );
}

#[test]
fn unscoped_grant_covers_every_office() {
    let w = world();
    let hr_lead = w.user("kjones");
    let role = w.office_admin();
    w.admin
        .assign_role(*hr_lead.id(), *role.id(), None, None)
        .unwrap();

    let snapshot = w.snapshot();
    let evaluator = Evaluator::default();
    for office in ["Office:Cleveland", "Office:Detroit", "Office:Cleveland/Floor:3"] {
        assert!(evaluator.is_authorized(&snapshot, *hr_lead.id(), Hr::AddEmployee, &ScopeContext::scoped(office)));
    }
    assert!(evaluator.is_authorized(&snapshot, *hr_lead.id(), Hr::AddEmployee, &ScopeContext::global()));
}

#[test]
fn malformed_or_unknown_requests_fail_closed() {
    let w = world();
    let user = w.user("mdoherty");
    let role = w.office_admin();
    w.admin.assign_role(*user.id(), *role.id(), None, None).unwrap();
    let snapshot = w.snapshot();
    let evaluator = Evaluator::default();

    assert!(matches!(
        evaluator.decide(&snapshot, *user.id(), Hr::AddEmployee, &ScopeContext::scoped("Cleveland")),
        Decision::Denied(DenyReason::MalformedContext(_))
    ));

    let stranger = w.admin.create_user("ghost", "Ghost", None).unwrap();
    assert_eq!(
        evaluator.decide(&snapshot, *stranger.id(), Hr::AddEmployee, &ScopeContext::global()),
        Decision::Denied(DenyReason::UnknownPrincipal)
    );
}

#[test]
fn group_roles_reach_members_until_removed() {
    let w = world();
    let user = w.user("mdoherty");
    let role = w.office_admin();
    let group = w.admin.create_group("cleveland-admins", None).unwrap();
    w.admin.add_member(*group.id(), *user.id()).unwrap();
    w.admin
        .assign_group_role(*group.id(), *role.id(), Some(&scope("Office:Cleveland")), None)
        .unwrap();

    let cleveland = ScopeContext::scoped("Office:Cleveland");
    let evaluator = Evaluator::default();
    assert!(evaluator.is_authorized(&w.snapshot(), *user.id(), Hr::AddEmployee, &cleveland));

    assert!(w.admin.remove_member(*group.id(), *user.id()).unwrap());
    assert!(!w.admin.remove_member(*group.id(), *user.id()).unwrap());
    assert!(!evaluator.is_authorized(&w.snapshot(), *user.id(), Hr::AddEmployee, &cleveland));
}

#[test]
fn revoked_and_deactivated_principals_lose_access() {
    let w = world();
    let mut user = w.user("mdoherty");
    let role = w.office_admin();
    let cleveland = scope("Office:Cleveland");
    w.admin.assign_role(*user.id(), *role.id(), Some(&cleveland), None).unwrap();
    w.admin.assign_role(*user.id(), *role.id(), None, None).unwrap();

    let evaluator = Evaluator::default();
    let detroit = ScopeContext::scoped("Office:Detroit");
    assert!(w.admin.revoke_role(*user.id(), *role.id(), None).unwrap());
    assert!(!w.admin.revoke_role(*user.id(), *role.id(), None).unwrap());
    assert!(!w
        .admin
        .revoke_role(*user.id(), *role.id(), Some(&scope("Office:Nowhere")))
        .unwrap());
    assert!(!evaluator.is_authorized(&w.snapshot(), *user.id(), Hr::AddEmployee, &detroit));
    assert!(evaluator.is_authorized(&w.snapshot(), *user.id(), Hr::AddEmployee, &(&cleveland).into()));

    w.admin.deactivate(&mut user).unwrap();
    assert!(!*user.active());
    assert_eq!(
        evaluator.decide(&w.snapshot(), *user.id(), Hr::AddEmployee, &(&cleveland).into()),
        Decision::Denied(DenyReason::InactivePrincipal)
    );
}

#[test]
fn duplicate_assignments_violate_the_composite_key() {
    let w = world();
    let user = w.user("mdoherty");
    let role = w.office_admin();
    let cleveland = scope("Office:Cleveland");

    w.admin.assign_role(*user.id(), *role.id(), None, None).unwrap();
    let err = w.admin.assign_role(*user.id(), *role.id(), None, None).unwrap_err();
    assert!(matches!(
        err,
        DataError::ConstraintViolation { ref constraint, .. }
            if constraint == "user_roles_principal_id_role_id_scope_id_key"
    ));

    w.admin.assign_role(*user.id(), *role.id(), Some(&cleveland), None).unwrap();
    assert!(w.admin.assign_role(*user.id(), *role.id(), Some(&cleveland), None).is_err());
    w.admin
        .assign_role(*user.id(), *role.id(), Some(&scope("Office:Detroit")), None)
        .unwrap();
    assert_eq!(w.store.row_count("user_roles").unwrap(), 3);
    assert_eq!(w.store.row_count("scopes").unwrap(), 2);
}

#[test]
fn privileges_seed_once_and_roles_name_them() {
    let w = world();
    assert_eq!(w.admin.seed_privileges::<Hr>().unwrap(), 0);
    assert_eq!(w.store.row_count("privileges").unwrap(), 3);

    let role = w
        .admin
        .define_role("Auditor", None, &[Hr::ReadInvoice])
        .unwrap();
    let snapshot = w.snapshot();
    assert!(snapshot.in_catalog(Hr::ReadInvoice));
    assert!(snapshot
        .role_privileges(*role.id())
        .unwrap()
        .contains(&Hr::ReadInvoice));
    assert_eq!(w.admin.find_role("Auditor").unwrap().unwrap().id(), role.id());
    assert!(w.admin.find_role("Janitor").unwrap().is_none());
}

#[test]
fn services_are_principals_too() {
    let w = world();
    let billing = w.admin.create_service("billing-sync", "finance").unwrap();
    let role = w
        .admin
        .define_role("InvoiceReader", None, &[Hr::ReadInvoice])
        .unwrap();
    w.admin.assign_role(*billing.id(), *role.id(), None, None).unwrap();

    let found = w.admin.find_principal("billing-sync").unwrap().unwrap();
    assert_eq!(found.owner().as_deref(), Some("finance"));
    assert!(Evaluator::default().is_authorized(&w.snapshot(), *found.id(), Hr::ReadInvoice, &ScopeContext::global()));
}

#[test]
fn configured_hierarchical_matching_covers_nested_scopes() {
    let config = StoreConfig::from_toml_str(
        r#"
        [security]
        scope_matching = "hierarchical"
        "#,
    )
    .unwrap();
    let w = world_with(&config);
    let user = w.user("mdoherty");
    let role = w.office_admin();
    w.admin
        .assign_role(*user.id(), *role.id(), Some(&scope("Office:Cleveland")), None)
        .unwrap();

    let snapshot = w.snapshot();
    let floor = ScopeContext::scoped("Office:Cleveland/Floor:3");
    assert!(Evaluator::new(config.security.scope_matching).is_authorized(&snapshot, *user.id(), Hr::AddEmployee, &floor));
    assert!(!Evaluator::new(ScopeMatching::Exact).is_authorized(&snapshot, *user.id(), Hr::AddEmployee, &floor));
    assert!(!Evaluator::new(config.security.scope_matching).is_authorized(
        &snapshot,
        *user.id(),
        Hr::AddEmployee,
        &ScopeContext::scoped("Office:Clevelandia")
    ));
}

#[test]
fn expiring_assignments_need_the_current_time() {
    let w = world();
    let user = w.user("temp");
    let role = w.office_admin();
    w.admin
        .assign_role(*user.id(), *role.id(), None, Some(noon() + Duration::hours(1)))
        .unwrap();

    let snapshot = w.snapshot();
    let evaluator = Evaluator::default();
    let at = |now| ScopeContext::global().at(now);
    assert!(evaluator.is_authorized(&snapshot, *user.id(), Hr::AddEmployee, &at(noon())));
    assert!(!evaluator.is_authorized(&snapshot, *user.id(), Hr::AddEmployee, &at(noon() + Duration::hours(1))));
    assert!(!evaluator.is_authorized(&snapshot, *user.id(), Hr::AddEmployee, &ScopeContext::global()));
}

fn gate_for(w: &world::World, clock: &Arc<FixedClock>) -> Gate<Hr> {
    let cache = SnapshotCache::<Hr>::new(
        Arc::new(ConnectionSource::new(Arc::clone(&w.conn))),
        Duration::seconds(60),
    );
    Gate::new(Evaluator::default(), Arc::new(cache), clock.clone())
}

#[test]
fn pipeline_runs_stages_in_order() {
    let w = world();
    let user = w.user("mdoherty");
    let role = w.office_admin();
    w.admin
        .assign_role(*user.id(), *role.id(), Some(&scope("Office:Cleveland")), None)
        .unwrap();
    let clock = Arc::new(FixedClock::new(noon()));
    let gate = gate_for(&w, &clock);

    let written = gate
        .request(*user.id(), Hr::AddEmployee, Some("Office:Cleveland"))
        .coarse_gate()
        .and_then(|p| p.validate(|_| {}))
        .and_then(|p| p.authorize())
        .and_then(|p| p.check_rules(|| Ok(())))
        .and_then(|p| p.execute(|| Ok(7)))
        .unwrap();
    assert_eq!(written, 7);

    let denied = gate
        .request(*user.id(), Hr::AddEmployee, Some("Office:Detroit"))
        .authorize()
        .err()
        .unwrap();
    assert!(matches!(
        denied,
        Rejection::Denied {
            stage: GateStage::Application,
            ..
        }
    ));
    assert_eq!(denied.external().class, ErrorClass::Forbidden);
    assert_eq!(denied.external().message, "not authorized");

    let coarse = gate
        .request(*user.id(), Hr::RemoveEmployee, Some("Office:Cleveland"))
        .coarse_gate()
        .err()
        .unwrap();
    assert!(matches!(coarse, Rejection::Denied { stage: GateStage::Coarse, .. }));
}

#[test]
fn invalid_input_is_rejected_before_authorization() {
    let w = world();
    let stranger = w.user("nobody");
    let clock = Arc::new(FixedClock::new(noon()));
    let gate = gate_for(&w, &clock);

    let rejection = gate
        .request(*stranger.id(), Hr::AddEmployee, Some("Office:Cleveland"))
        .validate(|errors| errors.push("name", "must not be empty"))
        .err()
        .unwrap();
    let external = rejection.external();
    assert_eq!(external.class, ErrorClass::InvalidInput);
    assert_eq!(external.fields.len(), 1);
    assert_eq!(external.fields[0].field, "name");

    let json = serde_json::to_value(&external).unwrap();
    assert_eq!(json["class"], "invalid_input");
}

#[test]
fn storage_failures_are_classified() {
    let w = world();
    let user = w.user("mdoherty");
    let role = w.office_admin();
    w.admin.assign_role(*user.id(), *role.id(), None, None).unwrap();
    let clock = Arc::new(FixedClock::new(noon()));
    let gate = gate_for(&w, &clock);

    let rule = gate
        .request(*user.id(), Hr::AddEmployee, None)
        .authorize()
        .unwrap()
        .check_rules(|| Err("office is at capacity".to_string()))
        .err()
        .unwrap();
    assert_eq!(rule.external().class, ErrorClass::BusinessRule);
    assert_eq!(rule.external().message, "office is at capacity");

    let duplicate = gate
        .request(*user.id(), Hr::AddEmployee, None)
        .authorize()
        .unwrap()
        .execute(|| w.admin.assign_role(*user.id(), *role.id(), None, None))
        .unwrap_err();
    assert!(matches!(duplicate, Rejection::Constraint(_)));
    let external = duplicate.external();
    assert_eq!(external.class, ErrorClass::Internal);
    assert!(!external.message.contains("user_roles"));
}

#[test]
fn gate_sees_grants_after_the_snapshot_expires() {
    let w = world();
    let user = w.user("mdoherty");
    let role = w.office_admin();
    let clock = Arc::new(FixedClock::new(noon()));
    let gate = gate_for(&w, &clock);

    assert!(gate.check(*user.id(), Hr::AddEmployee, None).is_err());
    w.admin.assign_role(*user.id(), *role.id(), None, None).unwrap();
    assert!(gate.check(*user.id(), Hr::AddEmployee, None).is_err());

    clock.advance(Duration::seconds(61));
    assert!(gate.check(*user.id(), Hr::AddEmployee, None).is_ok());
}

#[test]
fn directory_groups_follow_refreshes() {
    let w = world();
    let user = w.user("mdoherty");
    let role = w.office_admin();
    let group = w
        .admin
        .create_group("cleveland-staff", Some("cn=cleveland,ou=groups"))
        .unwrap();
    w.admin
        .assign_group_role(*group.id(), *role.id(), Some(&scope("Office:Cleveland")), None)
        .unwrap();

    let directory = Arc::new(FakeDirectory::default());
    let memberships = Arc::new(MembershipCache::new(directory.clone(), Duration::minutes(15)));
    let cache = SnapshotCache::<Hr>::new(
        Arc::new(ConnectionSource::new(Arc::clone(&w.conn))),
        Duration::hours(1),
    )
    .with_directory(Arc::clone(&memberships));
    let clock = Arc::new(FixedClock::new(noon()));
    let gate = Gate::new(Evaluator::default(), Arc::new(cache), clock.clone());

    assert!(gate.check(*user.id(), Hr::AddEmployee, Some("Office:Cleveland")).is_err());
    assert_eq!(memberships.freshness(*group.id(), noon()), Freshness::Unknown);

    directory.set("cn=cleveland,ou=groups", vec![*user.id()]);
    assert_eq!(memberships.force_refresh(*group.id(), "cn=cleveland,ou=groups", noon()).unwrap(), 1);
    assert!(gate.check(*user.id(), Hr::AddEmployee, Some("Office:Cleveland")).is_ok());

    clock.advance(Duration::minutes(20));
    assert!(matches!(
        memberships.freshness(*group.id(), clock.now()),
        Freshness::Stale { .. }
    ));
    assert_eq!(memberships.stale_groups(clock.now()), vec![*group.id()]);

    directory.go_down();
    assert!(memberships
        .force_refresh(*group.id(), "cn=cleveland,ou=groups", clock.now())
        .is_err());
    assert!(gate.check(*user.id(), Hr::AddEmployee, Some("Office:Cleveland")).is_ok());
}

fn verifier_with(secrets: &Arc<FakeSecrets>, clock: &Arc<FixedClock>) -> TokenVerifier {
    TokenVerifier::new(secrets.clone(), Duration::minutes(5), clock.clone())
}

#[test]
fn service_tokens_verify_against_stored_hashes() {
    let w = world();
    let service = w.admin.create_service("billing-sync", "finance").unwrap();
    let token = ApiToken::generate(*service.id());
    let secrets = Arc::new(FakeSecrets::default());
    secrets.put(
        *service.id(),
        vec![StoredSecret {
            phc_hash: hash_secret(token.secret()).unwrap(),
            expires_at: None,
        }],
    );
    let clock = Arc::new(FixedClock::new(noon()));
    let verifier = verifier_with(&secrets, &clock);

    assert_eq!(verifier.verify(&token.encode()).unwrap(), Verification::Valid(*service.id()));
    let forged = ApiToken::new(*service.id(), "guessed");
    assert_eq!(verifier.verify(&forged.encode()).unwrap(), Verification::Unknown);
    assert_eq!(verifier.verify("not a token").unwrap(), Verification::Unknown);
    assert_eq!(*secrets.fetches.lock().unwrap(), 1);
    assert!(!format!("{:?}", token).contains(token.secret()));
}

#[test]
fn expired_and_rotated_secrets() {
    let w = world();
    let service = w.admin.create_service("billing-sync", "finance").unwrap();
    let old = ApiToken::generate(*service.id());
    let new = ApiToken::generate(*service.id());
    let secrets = Arc::new(FakeSecrets::default());
    secrets.put(
        *service.id(),
        vec![
            StoredSecret {
                phc_hash: hash_secret(old.secret()).unwrap(),
                expires_at: Some(noon() + Duration::days(1)),
            },
            StoredSecret {
                phc_hash: hash_secret(new.secret()).unwrap(),
                expires_at: None,
            },
        ],
    );
    let clock = Arc::new(FixedClock::new(noon()));
    let verifier = verifier_with(&secrets, &clock);

    // both valid during the overlap
    assert_eq!(verifier.verify(&old.encode()).unwrap(), Verification::Valid(*service.id()));
    assert_eq!(verifier.verify(&new.encode()).unwrap(), Verification::Valid(*service.id()));

    clock.advance(Duration::days(2));
    assert_eq!(verifier.verify(&old.encode()).unwrap(), Verification::Expired(*service.id()));
    assert_eq!(verifier.verify(&new.encode()).unwrap(), Verification::Valid(*service.id()));

    secrets.put(*service.id(), Vec::new());
    assert_eq!(verifier.verify(&new.encode()).unwrap(), Verification::Valid(*service.id()));
    verifier.invalidate(*service.id());
    assert_eq!(verifier.verify(&new.encode()).unwrap(), Verification::Unknown);

    // a principal without secrets is not cached, and a later rotation is
    // seen once the cached entry is half a minute old
    let third = ApiToken::generate(*service.id());
    let fourth = ApiToken::generate(*service.id());
    let stored = |token: &ApiToken| StoredSecret {
        phc_hash: hash_secret(token.secret()).unwrap(),
        expires_at: None,
    };
    secrets.put(*service.id(), vec![stored(&third)]);
    assert_eq!(verifier.verify(&third.encode()).unwrap(), Verification::Valid(*service.id()));
    secrets.put(*service.id(), vec![stored(&third), stored(&fourth)]);
    clock.advance(Duration::seconds(30));
    assert_eq!(verifier.verify(&fourth.encode()).unwrap(), Verification::Valid(*service.id()));
}
