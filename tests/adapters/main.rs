mod models;

use std::time::{Duration, Instant};

use modeled_rust::{
    Column, ConnectivityError, Create, DataError, Delete, Filter, Find, FindAll, Get, GetAll,
    KeyStrategy, LoadRelated, MemoryStore, Model, Row, Save, SaveGraph, StoreConfig, TableSchema,
};
use models::{
    fixture, fixture_with, new_department, new_employee, Department, DepartmentAdapter,
    EmployeeAdapter, NewEmployee,
};

#[test]
fn create_then_get_round_trips() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();

    let sales = departments.create(new_department("Sales")).unwrap();
    assert_eq!(*sales.version(), 1);

    let ada = employees
        .create(new_employee("Ada", "E-1", &sales))
        .unwrap();
    assert_eq!(*ada.id(), 1);
    assert_eq!(ada.name(), "Ada");
    assert_eq!(ada.badge(), "E-1");
    assert_eq!(ada.department_id(), sales.id());
    assert_eq!(*ada.manager_id(), None);
    assert!(ada.notes().is_empty());

    let loaded = employees.get(ada.id()).unwrap().unwrap();
    assert_eq!(loaded.name(), ada.name());
    assert_eq!(loaded.badge(), ada.badge());
    assert_eq!(loaded.version(), ada.version());
}

#[test]
fn get_of_missing_key_is_none() {
    let f = fixture();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    assert!(employees.get(&42).unwrap().is_none());
    assert!(employees.find(&Filter::eq("badge", "nope")).unwrap().is_none());
}

#[test]
fn failed_creates_leave_no_row() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    employees.create(new_employee("Ada", "E-1", &sales)).unwrap();
    assert_eq!(f.store.row_count("employees").unwrap(), 1);

    let err = employees
        .create(new_employee(" ", "TOO-LONG-BADGE", &sales))
        .unwrap_err();
    match err {
        DataError::Validation { collection, errors } => {
            assert_eq!(collection, "employees");
            assert!(errors.has("name"));
            assert!(errors.has("badge"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }

    let err = employees
        .create(new_employee("Grace", "E-1", &sales))
        .unwrap_err();
    assert!(matches!(
        err,
        DataError::ConstraintViolation { ref constraint, .. } if constraint == "employees_badge_no_key"
    ));

    let mut orphan = new_employee("Linus", "E-2", &sales);
    orphan.manager_id = Some(99);
    assert!(matches!(
        employees.create(orphan).unwrap_err(),
        DataError::ConstraintViolation { .. }
    ));

    assert_eq!(f.store.row_count("employees").unwrap(), 1);
}

#[test]
fn repeated_gets_are_independent_instances() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    let ada = employees.create(new_employee("Ada", "E-1", &sales)).unwrap();

    let mut first = employees.get(ada.id()).unwrap().unwrap();
    let second = employees.get(ada.id()).unwrap().unwrap();
    assert_eq!(first.name(), second.name());

    first.set_name("Ada Lovelace".to_string());
    first.set_notes(vec!["prefers mornings".to_string()]);
    assert_eq!(second.name(), "Ada");
    assert!(second.notes().is_empty());
}

#[test]
fn save_writes_only_mutable_attributes() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    let support = departments.create(new_department("Support")).unwrap();
    let mut ada = employees.create(new_employee("Ada", "E-1", &sales)).unwrap();

    ada.set_name("Ada Lovelace".to_string());
    ada.set_department_id(*support.id());
    employees.save(&mut ada).unwrap();
    assert_eq!(*ada.version(), 2);

    let stored = employees.get(ada.id()).unwrap().unwrap();
    assert_eq!(stored.name(), "Ada Lovelace");
    assert_eq!(stored.department_id(), support.id());
    assert_eq!(stored.badge(), "E-1");
    assert_eq!(*stored.version(), 2);

    ada.set_name(String::new());
    assert!(matches!(
        employees.save(&mut ada).unwrap_err(),
        DataError::Validation { .. }
    ));
    assert_eq!(employees.get(ada.id()).unwrap().unwrap().name(), "Ada Lovelace");
}

#[test]
fn stale_saves_conflict() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    let ada = employees.create(new_employee("Ada", "E-1", &sales)).unwrap();

    let mut first = employees.get(ada.id()).unwrap().unwrap();
    let mut second = employees.get(ada.id()).unwrap().unwrap();
    first.set_name("First".to_string());
    employees.save(&mut first).unwrap();

    second.set_name("Second".to_string());
    match employees.save(&mut second).unwrap_err() {
        DataError::ConcurrencyConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(employees.get(ada.id()).unwrap().unwrap().name(), "First");
}

#[test]
fn save_or_delete_of_vanished_record_is_not_found() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    let ada = employees.create(new_employee("Ada", "E-1", &sales)).unwrap();

    let mut copy = ada.clone();
    employees.delete(ada).unwrap();

    copy.set_name("Ghost".to_string());
    assert!(matches!(
        employees.save(&mut copy).unwrap_err(),
        DataError::NotFound { .. }
    ));
    assert!(matches!(
        employees.delete(copy).unwrap_err(),
        DataError::NotFound { .. }
    ));
}

#[test]
fn find_all_filters_by_attribute_name() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    let support = departments.create(new_department("Support")).unwrap();
    for (name, badge, dept) in [("Ada", "E-1", &sales), ("Grace", "E-2", &support), ("Linus", "E-3", &sales)] {
        employees.create(new_employee(name, badge, dept)).unwrap();
    }

    let in_sales = employees
        .find_all(&Filter::eq("department_id", sales.id().to_string()))
        .unwrap();
    assert_eq!(in_sales.remaining(), 2);
    let names: Vec<String> = in_sales
        .map(|e| e.unwrap().name().clone())
        .collect();
    assert_eq!(names, vec!["Ada", "Linus"]);

    // `badge` is stored as `badge_no`; filters name the attribute
    let grace = employees.find(&Filter::eq("badge", "E-2")).unwrap().unwrap();
    assert_eq!(grace.name(), "Grace");

    let not_ada = employees
        .find_all(&Filter::ne("name", "Ada").and(Filter::is_in("badge", ["E-1", "E-3"])))
        .unwrap()
        .collect_all()
        .unwrap();
    assert_eq!(not_ada.len(), 1);
    assert_eq!(not_ada[0].name(), "Linus");

    assert!(matches!(
        employees.find(&Filter::eq("badge_no", "E-2")).unwrap_err(),
        DataError::Validation { .. }
    ));

    assert_eq!(departments.get_all().unwrap().count(), 2);
}

#[test]
fn belongs_to_loads_lazily_and_resets_on_reassignment() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    let support = departments.create(new_department("Support")).unwrap();
    let grace = employees.create(new_employee("Grace", "E-1", &sales)).unwrap();
    let mut ada = employees
        .create(NewEmployee {
            manager_id: Some(*grace.id()),
            ..new_employee("Ada", "E-2", &sales)
        })
        .unwrap();

    assert_eq!(ada.department(&f.conn).unwrap().name(), "Sales");
    assert_eq!(ada.manager(&f.conn).unwrap().unwrap().name(), "Grace");

    ada.set_department_id(*support.id());
    assert_eq!(ada.department(&f.conn).unwrap().name(), "Support");

    ada.set_manager_id(None);
    assert!(ada.manager(&f.conn).unwrap().is_none());
}

#[test]
fn has_many_is_ordered_and_memoized() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    employees.create(new_employee("Linus", "E-1", &sales)).unwrap();
    employees.create(new_employee("Ada", "E-2", &sales)).unwrap();

    let mut dept = departments.get(sales.id()).unwrap().unwrap();
    let staff = dept.employees(&f.conn).unwrap();
    let names: Vec<String> = staff.to_vec().iter().map(|e| e.name().clone()).collect();
    assert_eq!(names, vec!["Ada", "Linus"]);

    employees.create(new_employee("Grace", "E-3", &sales)).unwrap();
    assert_eq!(dept.employees(&f.conn).unwrap().len(), 2);
}

#[test]
fn delete_through_loaded_parent_leaves_the_collection() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    employees.create(new_employee("Ada", "E-1", &sales)).unwrap();
    employees.create(new_employee("Grace", "E-2", &sales)).unwrap();

    let mut dept = departments.get(sales.id()).unwrap().unwrap();
    let staff = dept.employees(&f.conn).unwrap();
    let ada = staff.get(0).unwrap();
    assert!(ada.parent_link().unwrap().is_attached());

    employees.delete(ada).unwrap();
    assert_eq!(staff.len(), 1);
    assert_eq!(dept.employees(&f.conn).unwrap().len(), 1);
    assert_eq!(f.store.row_count("employees").unwrap(), 1);
}

#[test]
fn delete_without_loaded_parent_leaves_collections_stale() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    let ada = employees.create(new_employee("Ada", "E-1", &sales)).unwrap();

    let mut dept = departments.get(sales.id()).unwrap().unwrap();
    let staff = dept.employees(&f.conn).unwrap();
    assert_eq!(staff.len(), 1);

    // fetched directly, so it knows nothing of `staff`
    let detached = employees.get(ada.id()).unwrap().unwrap();
    assert!(!detached.parent_link().unwrap().is_attached());
    employees.delete(detached).unwrap();

    assert!(employees.get(ada.id()).unwrap().is_none());
    assert_eq!(staff.len(), 1);
    assert!(staff.contains_key(ada.id()));

    let mut fresh = departments.get(sales.id()).unwrap().unwrap();
    assert!(fresh.employees(&f.conn).unwrap().is_empty());
}

#[test]
fn deleting_a_referenced_row_is_restricted() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    let grace = employees.create(new_employee("Grace", "E-1", &sales)).unwrap();
    employees
        .create(NewEmployee {
            manager_id: Some(*grace.id()),
            ..new_employee("Ada", "E-2", &sales)
        })
        .unwrap();

    assert!(matches!(
        employees.delete(grace).unwrap_err(),
        DataError::ConstraintViolation { ref constraint, .. } if constraint == "employees_manager_id_fkey"
    ));
    assert_eq!(f.store.row_count("employees").unwrap(), 2);
}

#[test]
fn save_graph_saves_parent_then_children() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    employees.create(new_employee("Ada", "E-1", &sales)).unwrap();
    employees.create(new_employee("Grace", "E-2", &sales)).unwrap();

    let mut dept = departments.get(sales.id()).unwrap().unwrap();
    let staff = dept.employees(&f.conn).unwrap();
    dept.set_description(Some("Quota carriers".to_string()));
    staff.update(0, |e| e.set_name("Ada L.".to_string()));

    departments.save_graph(&mut dept).unwrap();
    assert_eq!(*dept.version(), 2);
    assert_eq!(*staff.get(0).unwrap().version(), 2);
    assert_eq!(*staff.get(1).unwrap().version(), 2);

    let stored = departments.get(sales.id()).unwrap().unwrap();
    assert_eq!(stored.description().as_deref(), Some("Quota carriers"));
    let ada = employees.find(&Filter::eq("badge", "E-1")).unwrap().unwrap();
    assert_eq!(ada.name(), "Ada L.");
}

#[test]
fn failed_graph_save_writes_nothing() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    employees.create(new_employee("Ada", "E-1", &sales)).unwrap();

    let mut dept = departments.get(sales.id()).unwrap().unwrap();
    let staff = dept.employees(&f.conn).unwrap();

    // someone else saves Ada first
    let mut other = employees.find(&Filter::eq("badge", "E-1")).unwrap().unwrap();
    other.set_name("Countess".to_string());
    employees.save(&mut other).unwrap();

    dept.set_description(Some("Renamed".to_string()));
    staff.update(0, |e| e.set_name("Ada L.".to_string()));
    assert!(matches!(
        departments.save_graph(&mut dept).unwrap_err(),
        DataError::ConcurrencyConflict { .. }
    ));

    assert_eq!(*dept.version(), 1);
    let stored = departments.get(sales.id()).unwrap().unwrap();
    assert_eq!(*stored.description(), None);
    assert_eq!(*stored.version(), 1);
}

#[test]
fn graph_save_without_transactions_stops_at_first_conflict() {
    let config = StoreConfig::from_toml_str("[storage]\ntransactions = false\n").unwrap();
    let f = fixture_with(&config);
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();
    let sales = departments.create(new_department("Sales")).unwrap();
    employees.create(new_employee("Ada", "E-1", &sales)).unwrap();
    employees.create(new_employee("Bob", "E-2", &sales)).unwrap();

    let mut dept = departments.get(sales.id()).unwrap().unwrap();
    let staff = dept.employees(&f.conn).unwrap();

    // Bob goes stale behind the graph's back
    let mut other = employees.find(&Filter::eq("badge", "E-2")).unwrap().unwrap();
    other.set_name("Robert".to_string());
    employees.save(&mut other).unwrap();

    dept.set_description(Some("Renamed".to_string()));
    staff.update(0, |e| e.set_name("Ada L.".to_string()));
    staff.update(1, |e| e.set_name("Bob B.".to_string()));
    assert!(matches!(
        departments.save_graph(&mut dept).unwrap_err(),
        DataError::ConcurrencyConflict { .. }
    ));

    // writes before the conflict stay, and their models know it
    assert_eq!(*dept.version(), 2);
    assert_eq!(*staff.get(0).unwrap().version(), 2);
    assert_eq!(*staff.get(1).unwrap().version(), 1);

    let stored = departments.get(sales.id()).unwrap().unwrap();
    assert_eq!(*stored.version(), 2);
    assert_eq!(stored.description().as_deref(), Some("Renamed"));
    let ada = employees.find(&Filter::eq("badge", "E-1")).unwrap().unwrap();
    assert_eq!(ada.name(), "Ada L.");
    assert_eq!(*ada.version(), 2);
    let bob = employees.find(&Filter::eq("badge", "E-2")).unwrap().unwrap();
    assert_eq!(bob.name(), "Robert");
    assert_eq!(*bob.version(), 2);
}

#[test]
fn create_cost_ignores_unrelated_tables() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    f.store
        .create_table(TableSchema {
            name: "audit_log".into(),
            key: "id".into(),
            key_strategy: KeyStrategy::Sequence,
            version: None,
            columns: vec![
                Column {
                    name: "id".into(),
                    nullable: false,
                },
                Column {
                    name: "body".into(),
                    nullable: false,
                },
            ],
            unique: vec![],
            foreign_keys: vec![],
        })
        .unwrap();

    let timed = |from: usize| {
        let started = Instant::now();
        for i in from..from + 200 {
            departments.create(new_department(&format!("D-{i}"))).unwrap();
        }
        started.elapsed()
    };
    let before = timed(0);

    let mut handle = f.store.pool().acquire().unwrap();
    for i in 0..20_000 {
        let mut row = Row::new();
        row.insert("body".into(), format!("entry {i}").into());
        handle.insert("audit_log", row, false).unwrap();
    }
    drop(handle);
    assert_eq!(f.store.row_count("audit_log").unwrap(), 20_000);

    let after = timed(200);
    assert!(
        after < before * 5 + Duration::from_millis(200),
        "creates slowed from {before:?} to {after:?}"
    );
}

#[test]
fn create_without_returning_reads_back() {
    let config = StoreConfig::from_toml_str("[storage]\nreturning = false\n").unwrap();
    let f = fixture_with(&config);
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    let employees = f.conn.adapter::<dyn EmployeeAdapter>().unwrap();

    let sales = departments.create(new_department("Sales")).unwrap();
    let ada = employees.create(new_employee("Ada", "E-1", &sales)).unwrap();
    assert_eq!(*ada.id(), 1);
    assert_eq!(*ada.version(), 1);
}

#[test]
fn unmapped_stored_fields_fail_hydration() {
    let store = MemoryStore::new(&StoreConfig::default());
    let table = TableSchema::from_model(Department::schema(), KeyStrategy::Uuid)
        .unwrap()
        .with_column("budget", true);
    store.create_table(table).unwrap();
    let departments = store.adapter::<Department>();

    let err = departments.create(new_department("Sales")).unwrap_err();
    assert!(matches!(err, DataError::Mapping { ref field, .. } if field == "budget"));
    assert_eq!(store.row_count("departments").unwrap(), 0);
}

#[test]
fn pool_exhaustion_times_out() {
    let config = StoreConfig::from_toml_str("[pool]\nmax_size = 1\nacquire_timeout_ms = 20\n").unwrap();
    let f = fixture_with(&config);
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();

    let held = f.store.pool().acquire().unwrap();
    let err = departments.create(new_department("Sales")).unwrap_err();
    assert_eq!(
        err,
        DataError::Connectivity(ConnectivityError::PoolTimeout(Duration::from_millis(20)))
    );
    assert!(err.is_retryable());

    drop(held);
    departments.create(new_department("Sales")).unwrap();
}

#[test]
fn closed_pool_reports_connectivity() {
    let f = fixture();
    let departments = f.conn.adapter::<dyn DepartmentAdapter>().unwrap();
    f.store.pool().close();
    assert_eq!(
        departments.get_all().err().unwrap(),
        DataError::Connectivity(ConnectivityError::Closed)
    );
    f.store.pool().reopen();
    assert_eq!(departments.get_all().unwrap().count(), 0);
}

#[test]
fn unregistered_adapters_are_reported() {
    let f = fixture();
    let err = f.conn.adapter::<dyn LoadRelated<modeled_rust::security::ScopeRecord>>().err().unwrap();
    assert!(matches!(err, DataError::AdapterNotRegistered(_)));
    assert!(f.conn.has_adapter::<dyn EmployeeAdapter>());
}
