mod model;
mod privilege;

use proc_macro::TokenStream;

// ============================================================================
// #[derive(Model)] derive macro
// ============================================================================

/// Derive macro for the `Model` trait.
///
/// Generates the storage mapping for a struct at build time: the static
/// `ModelSchema`, row hydration, the mutable write set, a `New*` create-input
/// struct, attribute getters, setters for mutable attributes, and lazy
/// relation accessors.
///
/// # Usage
///
/// ```ignore
/// #[derive(Clone, Debug, Model)]
/// #[model(collection = "employees", unique_together("office", "badge"))]
/// pub struct Employee {
///     #[model(key)]
///     id: Uuid,
///     #[model(mutable, non_empty, max_len = 80)]
///     name: String,
///     #[model(field = "badge_no")]
///     badge: String,
///     #[model(mutable, references = "departments")]
///     department_id: Uuid,
///     #[model(version)]
///     version: u64,
///     #[model(belongs_to(key = "department_id"))]
///     department: BelongsTo<Department>,
///     #[model(parent)]
///     parent: ParentLink,
/// }
/// ```
///
/// Struct attributes:
/// - `collection = "..."` sets the collection name. Defaults to snake_case
///   struct name + "s".
/// - `create = "..."` names the generated create-input struct. Defaults to
///   `New` + struct name.
/// - `unique_together("a", "b")` declares a composite uniqueness rule over
///   attribute names (repeatable).
/// - `ignore_fields("a", "b")` lists storage fields intentionally left
///   unmapped.
///
/// Field attributes:
/// - `key` marks the storage-generated identity.
/// - `version` marks the optimistic concurrency counter.
/// - `mutable` includes the attribute in the `Save` write set and generates a
///   setter. Attributes are immutable unless marked.
/// - `field = "..."` renames the storage field.
/// - `unique`, `references = "collection"` add storage constraints.
/// - `non_empty`, `max_len = N` add create-input validation.
/// - `skip` keeps an in-memory-only attribute out of the mapping.
/// - `parent` holds the back-reference to a loaded parent collection.
/// - `has_many(child_key = "...", order_by = "...")` and
///   `belongs_to(key = "...")` declare direct relations.
#[proc_macro_derive(Model, attributes(model))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    model::derive_model(input)
}

// ============================================================================
// #[derive(Privilege)] derive macro
// ============================================================================

/// Derive macro for the `Privilege` trait on a fieldless enum.
///
/// ```ignore
/// #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Privilege)]
/// pub enum HrPrivilege {
///     AddEmployee,
///     #[privilege(name = "ReadInvoices")]
///     ReadInvoice,
/// }
/// ```
///
/// The privilege name defaults to the variant name.
#[proc_macro_derive(Privilege, attributes(privilege))]
pub fn derive_privilege(input: TokenStream) -> TokenStream {
    privilege::derive_privilege(input)
}
