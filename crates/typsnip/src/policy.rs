//! Capability checks
//!
//! Tokens carry scoped capability strings. Callers ask [`capable`] before
//! entering any core operation; nothing below this module looks at raw
//! capability strings.

use crate::entities::User;

/// Known capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    SnippetsCreate,
    SnippetsEdit,
    SnippetsDelete,
    /// Act on snippets owned by other users
    SnippetsManage,
    TagsCreate,
    CommentsCreate,
    CommentsDelete,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::SnippetsCreate => "snippets:create",
            Capability::SnippetsEdit => "snippets:edit",
            Capability::SnippetsDelete => "snippets:delete",
            Capability::SnippetsManage => "snippets:manage",
            Capability::TagsCreate => "tags:create",
            Capability::CommentsCreate => "comments:create",
            Capability::CommentsDelete => "comments:delete",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities granted to a freshly registered user
pub const DEFAULT_CAPABILITIES: [Capability; 6] = [
    Capability::SnippetsCreate,
    Capability::SnippetsEdit,
    Capability::SnippetsDelete,
    Capability::TagsCreate,
    Capability::CommentsCreate,
    Capability::CommentsDelete,
];

pub fn default_capabilities() -> Vec<String> {
    DEFAULT_CAPABILITIES
        .iter()
        .map(|c| c.as_str().to_string())
        .collect()
}

/// Whether `user` may perform `action`. `*` grants everything.
pub fn capable(user: &User, action: Capability) -> bool {
    user.deleted_at.is_none()
        && user
            .capabilities
            .iter()
            .any(|c| c == "*" || c == action.as_str())
}

/// Whether `user` may act on a resource owned by `owner_id`
pub fn may_act_on(user: &User, owner_id: i64) -> bool {
    user.id == owner_id || capable(user, Capability::SnippetsManage)
}
