//! Role → capability table.
//!
//! Permissions are derived purely from a member's [`Role`]. The table is a
//! set of `const` slices, so there is no global state to initialize or
//! mutate. Each role's slice is a superset of the role below it:
//!
//! | Role | Capabilities |
//! |------|--------------|
//! | `viewer` | `view` |
//! | `editor` | viewer + `edit`, `manage_studies` |
//! | `admin` | editor + `manage_members` |
//! | `owner` | admin + `delete` |
//!
//! A user without a membership row has no capabilities at all.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    View,
    Edit,
    ManageStudies,
    ManageMembers,
    Delete,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Edit => "edit",
            Self::ManageStudies => "manage_studies",
            Self::ManageMembers => "manage_members",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const VIEWER: &[Permission] = &[Permission::View];
const EDITOR: &[Permission] = &[Permission::View, Permission::Edit, Permission::ManageStudies];
const ADMIN: &[Permission] = &[
    Permission::View,
    Permission::Edit,
    Permission::ManageStudies,
    Permission::ManageMembers,
];
const OWNER: &[Permission] = &[
    Permission::View,
    Permission::Edit,
    Permission::ManageStudies,
    Permission::ManageMembers,
    Permission::Delete,
];

/// Static capability list for a role.
pub fn role_permissions(role: Role) -> &'static [Permission] {
    match role {
        Role::Owner => OWNER,
        Role::Admin => ADMIN,
        Role::Editor => EDITOR,
        Role::Viewer => VIEWER,
    }
}

/// Capability set for an optional membership; `None` yields the empty set.
pub fn permissions_for(role: Option<Role>) -> BTreeSet<Permission> {
    role.map(|r| role_permissions(r).iter().copied().collect())
        .unwrap_or_default()
}

/// Whether `role` grants `permission`.
pub fn allows(role: Option<Role>, permission: Permission) -> bool {
    role.is_some_and(|r| role_permissions(r).contains(&permission))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_form_a_chain_of_supersets() {
        let chain = [Role::Viewer, Role::Editor, Role::Admin, Role::Owner];
        for pair in chain.windows(2) {
            let lower = permissions_for(Some(pair[0]));
            let upper = permissions_for(Some(pair[1]));
            assert!(lower.is_subset(&upper), "{:?} ⊄ {:?}", pair[0], pair[1]);
            assert!(lower.len() < upper.len());
        }
    }

    #[test]
    fn viewer_can_only_view() {
        let perms = permissions_for(Some(Role::Viewer));
        assert_eq!(perms.into_iter().collect::<Vec<_>>(), vec![Permission::View]);
    }

    #[test]
    fn only_owner_can_delete() {
        assert!(allows(Some(Role::Owner), Permission::Delete));
        assert!(!allows(Some(Role::Admin), Permission::Delete));
        assert!(allows(Some(Role::Admin), Permission::ManageMembers));
        assert!(!allows(Some(Role::Editor), Permission::ManageMembers));
        assert!(allows(Some(Role::Editor), Permission::ManageStudies));
    }

    #[test]
    fn non_member_has_nothing() {
        assert!(permissions_for(None).is_empty());
        assert!(!allows(None, Permission::View));
    }
}
