use std::fmt;
use std::hash::Hash;

/// A compile-time fixed capability, e.g. `AddEmployee`.
///
/// Implement with `#[derive(Privilege)]` on a fieldless enum. The variant
/// names are seeded into the `privileges` table at startup and assigned to
/// roles by name; gates pass the typed value, never a user-supplied string.
pub trait Privilege: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Every privilege, in declaration order.
    const ALL: &'static [Self];

    fn name(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }
}
