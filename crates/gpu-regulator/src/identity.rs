//! Maps raw OS usernames onto tenants.
//!
//! Sub-accounts share a hyphen-delimited naming scheme (`lab3-alice`,
//! `alice-gpu`), so the longest hyphen component is taken as the logical
//! owner. When several components tie for the longest, the leftmost wins.

use std::fmt;

/// Canonical logical owner of GPU usage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tenant(String);

impl Tenant {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves `owner` to its tenant.
///
/// Returns `None` for empty or whitespace-only owners; such records must
/// not take part in aggregation.
pub fn resolve(owner: &str) -> Option<Tenant> {
    let owner = owner.trim();
    if owner.is_empty() {
        return None;
    }

    let mut longest: Option<&str> = None;
    for part in owner.split('-').filter(|p| !p.is_empty()) {
        // strict comparison keeps the leftmost of equally long parts
        if longest.map_or(true, |best| part.len() > best.len()) {
            longest = Some(part);
        }
    }

    Some(Tenant(longest.unwrap_or(owner).to_string()))
}
