use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use modeled_rust::security::{
    Directory, DirectoryError, PrincipalId, PrincipalRecord, RoleRecord, Scope, SecretStore,
    SecretStoreError, SecurityAdmin, SecuritySnapshot, StoredSecret,
};
use modeled_rust::{install_security, Connection, MemoryStore, Privilege, StoreConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Privilege)]
pub enum Hr {
    AddEmployee,
    RemoveEmployee,
    #[privilege(name = "ReadInvoices")]
    ReadInvoice,
}

pub struct World {
    pub store: MemoryStore,
    pub conn: Arc<Connection>,
    pub admin: SecurityAdmin,
}

impl World {
    pub fn snapshot(&self) -> SecuritySnapshot<Hr> {
        SecuritySnapshot::load(&self.conn).unwrap()
    }

    pub fn user(&self, name: &str) -> PrincipalRecord {
        self.admin.create_user(name, name, None).unwrap()
    }

    /// `OfficeAdmin`, granting only `AddEmployee`.
    pub fn office_admin(&self) -> RoleRecord {
        self.admin
            .define_role("OfficeAdmin", Some("Runs one office"), &[Hr::AddEmployee])
            .unwrap()
    }
}

pub fn world() -> World {
    world_with(&StoreConfig::default())
}

pub fn world_with(config: &StoreConfig) -> World {
    let store = MemoryStore::new(config);
    let mut builder = Connection::builder();
    install_security(&store, &mut builder).unwrap();
    let conn = Arc::new(builder.build());
    let admin = SecurityAdmin::new(Arc::clone(&conn));
    admin.seed_privileges::<Hr>().unwrap();
    World { store, conn, admin }
}

pub fn scope(source: &str) -> Scope {
    Scope::parse(source).unwrap()
}

pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

#[derive(Default)]
pub struct FakeDirectory {
    groups: Mutex<HashMap<String, Vec<PrincipalId>>>,
    down: Mutex<bool>,
}

impl FakeDirectory {
    pub fn set(&self, directory_ref: &str, members: Vec<PrincipalId>) {
        self.groups
            .lock()
            .unwrap()
            .insert(directory_ref.to_string(), members);
    }

    pub fn go_down(&self) {
        *self.down.lock().unwrap() = true;
    }
}

impl Directory for FakeDirectory {
    fn members(&self, directory_ref: &str) -> Result<Vec<PrincipalId>, DirectoryError> {
        if *self.down.lock().unwrap() {
            return Err(DirectoryError::Unavailable("ldap timeout".into()));
        }
        self.groups
            .lock()
            .unwrap()
            .get(directory_ref)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownGroup(directory_ref.to_string()))
    }
}

/// Secret store that counts fetches.
#[derive(Default)]
pub struct FakeSecrets {
    secrets: Mutex<HashMap<PrincipalId, Vec<StoredSecret>>>,
    pub fetches: Mutex<usize>,
}

impl FakeSecrets {
    pub fn put(&self, principal: PrincipalId, secrets: Vec<StoredSecret>) {
        self.secrets.lock().unwrap().insert(principal, secrets);
    }
}

impl SecretStore for FakeSecrets {
    fn secrets(&self, principal: PrincipalId) -> Result<Vec<StoredSecret>, SecretStoreError> {
        *self.fetches.lock().unwrap() += 1;
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&principal)
            .cloned()
            .unwrap_or_default())
    }
}
