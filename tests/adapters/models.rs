use modeled_rust::{
    model_adapter, BelongsTo, Connection, HasMany, LoadRelated, MemoryStore, Model, ParentLink,
    StoreConfig,
};
use uuid::Uuid;

#[derive(Debug, Clone, Model)]
#[model(collection = "departments")]
pub struct Department {
    #[model(key)]
    id: Uuid,
    #[model(unique, non_empty, max_len = 60)]
    name: String,
    #[model(mutable, max_len = 120)]
    description: Option<String>,
    #[model(version)]
    version: u64,
    #[model(has_many(child_key = "department_id", order_by = "name"))]
    employees: HasMany<Employee>,
}

#[derive(Debug, Clone, Model)]
#[model(collection = "employees", ignore_fields("legacy_code"))]
pub struct Employee {
    #[model(key)]
    id: i64,
    #[model(mutable, non_empty, max_len = 80)]
    name: String,
    /// Printed on the access card; never reissued.
    #[model(unique, non_empty, max_len = 8, field = "badge_no")]
    badge: String,
    #[model(mutable, references = "departments")]
    department_id: Uuid,
    #[model(mutable, references = "employees")]
    manager_id: Option<i64>,
    #[model(skip)]
    notes: Vec<String>,
    #[model(version)]
    version: u64,
    #[model(belongs_to(key = "department_id"))]
    department: BelongsTo<Department>,
    #[model(belongs_to(key = "manager_id"))]
    manager: BelongsTo<Employee>,
    #[model(parent)]
    parent: ParentLink,
}

model_adapter! {
    /// Departments are never deleted.
    pub trait DepartmentAdapter for Department: Get, GetAll, Find, Create, Save, SaveGraph
}

model_adapter! {
    pub trait EmployeeAdapter for Employee: Get, FindAll, Find, Create, Save, Delete
}

pub struct Fixture {
    pub store: MemoryStore,
    pub conn: Connection,
}

pub fn fixture() -> Fixture {
    fixture_with(&StoreConfig::default())
}

pub fn fixture_with(config: &StoreConfig) -> Fixture {
    let store = MemoryStore::new(config);
    let departments = store.register::<Department>().unwrap();
    let employees = store.register::<Employee>().unwrap();
    let conn = Connection::builder()
        .with::<dyn DepartmentAdapter>(departments.clone())
        .with::<dyn LoadRelated<Department>>(departments)
        .with::<dyn EmployeeAdapter>(employees.clone())
        .with::<dyn LoadRelated<Employee>>(employees)
        .build();
    Fixture { store, conn }
}

pub fn new_department(name: &str) -> NewDepartment {
    NewDepartment {
        name: name.to_string(),
        description: None,
    }
}

pub fn new_employee(name: &str, badge: &str, department: &Department) -> NewEmployee {
    NewEmployee {
        name: name.to_string(),
        badge: badge.to_string(),
        department_id: *department.id(),
        manager_id: None,
    }
}
