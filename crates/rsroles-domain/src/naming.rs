//! Deterministic names of objects mirrored to the authorization server.
//!
//! Lookups on the server go by these names, so they must be stable across
//! releases: renaming anything here orphans already-created objects.

use uuid::Uuid;

use crate::model::{HttpMethod, Subject};

pub fn role_policy_name(role_id: Uuid) -> String {
    format!("Policy for role: {role_id}")
}

pub fn user_policy_name(user_id: Uuid) -> String {
    format!("Policy for user: {user_id}")
}

/// Name of the scope permission granting `subject` access to `method path`.
pub fn permission_name(method: HttpMethod, subject: &Subject, path: &str) -> String {
    format!("{method} access for {subject} to '{path}'")
}

/// Name of the policy that backs permissions of `subject`.
pub fn subject_policy_name(subject: &Subject) -> String {
    match subject {
        Subject::Role(id) => role_policy_name(*id),
        Subject::User(id) => user_policy_name(*id),
    }
}
