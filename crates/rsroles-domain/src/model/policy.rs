//! Policies and their authorization-server representation.
//!
//! A policy is a closed tagged variant ([`PolicyKind`]) with one payload per
//! policy type. Conversion to and from [`ExternalPolicy`] is a single
//! exhaustive match in each direction.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::naming;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Whether a policy grants (positive) or denies (negative) when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Logic {
    #[default]
    Positive,
    Negative,
}

/// How a permission combines the decisions of its policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStrategy {
    #[default]
    Unanimous,
    Affirmative,
    Consensus,
}

/// Discriminant of [`PolicyKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    Role,
    User,
    Time,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Role => "role",
            PolicyType::User => "user",
            PolicyType::Time => "time",
        }
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "role" => Ok(Self::Role),
            "user" => Ok(Self::User),
            "time" => Ok(Self::Time),
            _ => Err(DomainError::InvalidPolicyType {
                value: s.to_string(),
            }),
        }
    }
}

/// Role reference inside a role policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleRef {
    pub id: Uuid,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePolicy {
    pub roles: Vec<RoleRef>,
    pub logic: Logic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPolicy {
    pub users: Vec<Uuid>,
    pub logic: Logic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePolicy {
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub logic: Logic,
}

/// Policy payload, one variant per policy type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PolicyKind {
    Role(RolePolicy),
    User(UserPolicy),
    Time(TimePolicy),
}

impl PolicyKind {
    pub fn policy_type(&self) -> PolicyType {
        match self {
            PolicyKind::Role(_) => PolicyType::Role,
            PolicyKind::User(_) => PolicyType::User,
            PolicyKind::Time(_) => PolicyType::Time,
        }
    }

    pub fn logic(&self) -> Logic {
        match self {
            PolicyKind::Role(p) => p.logic,
            PolicyKind::User(p) => p.logic,
            PolicyKind::Time(p) => p.logic,
        }
    }
}

/// Policy stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub kind: PolicyKind,
    /// Created automatically for a role or user rather than by an administrator.
    pub system_generated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    pub fn new(name: impl Into<String>, kind: PolicyKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            kind,
            system_generated: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The policy bound 1:1 to a role. Its id equals the role id.
    pub fn for_role(role_id: Uuid) -> Self {
        let mut policy = Self::new(
            naming::role_policy_name(role_id),
            PolicyKind::Role(RolePolicy {
                roles: vec![RoleRef {
                    id: role_id,
                    required: false,
                }],
                logic: Logic::Positive,
            }),
        );
        policy.id = role_id;
        policy.system_generated = true;
        policy.description = Some(format!("System generated policy for role: {role_id}"));
        policy
    }

    /// The policy bound 1:1 to a user. Its id equals the user id.
    pub fn for_user(user_id: Uuid) -> Self {
        let mut policy = Self::new(
            naming::user_policy_name(user_id),
            PolicyKind::User(UserPolicy {
                users: vec![user_id],
                logic: Logic::Positive,
            }),
        );
        policy.id = user_id;
        policy.system_generated = true;
        policy.description = Some(format!("System generated policy for user: {user_id}"));
        policy
    }

    pub fn policy_type(&self) -> PolicyType {
        self.kind.policy_type()
    }
}

/// Policy as understood by the authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalPolicy {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub policy_type: String,
    pub logic: Logic,
    pub decision_strategy: DecisionStrategy,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl From<&Policy> for ExternalPolicy {
    fn from(policy: &Policy) -> Self {
        let mut config = BTreeMap::new();
        match &policy.kind {
            PolicyKind::Role(p) => {
                let roles = serde_json::to_string(&p.roles).unwrap_or_else(|_| "[]".to_string());
                config.insert("roles".to_string(), roles);
            }
            PolicyKind::User(p) => {
                let users = serde_json::to_string(&p.users).unwrap_or_else(|_| "[]".to_string());
                config.insert("users".to_string(), users);
            }
            PolicyKind::Time(p) => {
                if let Some(start) = p.not_before {
                    config.insert("nbf".to_string(), start.format(TIME_FORMAT).to_string());
                }
                if let Some(end) = p.not_on_or_after {
                    config.insert("noa".to_string(), end.format(TIME_FORMAT).to_string());
                }
            }
        }

        Self {
            id: policy.id,
            name: policy.name.clone(),
            description: policy.description.clone(),
            policy_type: policy.policy_type().as_str().to_string(),
            logic: policy.kind.logic(),
            decision_strategy: DecisionStrategy::Unanimous,
            config,
        }
    }
}

impl TryFrom<ExternalPolicy> for Policy {
    type Error = DomainError;

    fn try_from(external: ExternalPolicy) -> DomainResult<Self> {
        let logic = external.logic;
        let kind = match external.policy_type.parse::<PolicyType>()? {
            PolicyType::Role => PolicyKind::Role(RolePolicy {
                roles: parse_config(&external, "roles")?,
                logic,
            }),
            PolicyType::User => PolicyKind::User(UserPolicy {
                users: parse_config(&external, "users")?,
                logic,
            }),
            PolicyType::Time => PolicyKind::Time(TimePolicy {
                not_before: parse_time(&external, "nbf")?,
                not_on_or_after: parse_time(&external, "noa")?,
                logic,
            }),
        };

        let now = Utc::now();
        let system_generated = external.id
            == match &kind {
                PolicyKind::Role(p) if p.roles.len() == 1 => p.roles[0].id,
                PolicyKind::User(p) if p.users.len() == 1 => p.users[0],
                _ => Uuid::nil(),
            };
        Ok(Self {
            id: external.id,
            name: external.name,
            description: external.description,
            kind,
            system_generated,
            created_at: now,
            updated_at: now,
        })
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(
    external: &ExternalPolicy,
    key: &str,
) -> DomainResult<T> {
    let raw = external
        .config
        .get(key)
        .ok_or_else(|| DomainError::MissingPolicyConfig {
            policy: external.name.clone(),
            key: key.to_string(),
        })?;
    serde_json::from_str(raw).map_err(|e| DomainError::Validation {
        message: format!("policy '{}' has malformed '{}': {}", external.name, key, e),
    })
}

fn parse_time(external: &ExternalPolicy, key: &str) -> DomainResult<Option<DateTime<Utc>>> {
    external
        .config
        .get(key)
        .map(|raw| {
            NaiveDateTime::parse_from_str(raw, TIME_FORMAT)
                .map(|t| t.and_utc())
                .map_err(|e| DomainError::Validation {
                    message: format!("policy '{}' has malformed '{}': {}", external.name, key, e),
                })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_role_policy_shares_identity_with_role() {
        let role_id = Uuid::new_v4();
        let policy = Policy::for_role(role_id);

        assert_eq!(policy.id, role_id);
        assert_eq!(policy.name, format!("Policy for role: {role_id}"));
        assert!(policy.system_generated);
    }

    #[test]
    fn test_external_mapping_preserves_every_variant() {
        let user_id = Uuid::new_v4();
        let time = Policy::new(
            "business hours",
            PolicyKind::Time(TimePolicy {
                not_before: Some(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()),
                not_on_or_after: None,
                logic: Logic::Negative,
            }),
        );

        for policy in [Policy::for_role(Uuid::new_v4()), Policy::for_user(user_id), time] {
            let external = ExternalPolicy::from(&policy);
            assert_eq!(external.policy_type, policy.policy_type().as_str());

            let back = Policy::try_from(external).unwrap();
            assert_eq!(back.kind, policy.kind);
            assert_eq!(back.system_generated, policy.system_generated);
        }
    }

    #[test]
    fn test_unknown_external_type_is_rejected() {
        let external = ExternalPolicy {
            id: Uuid::new_v4(),
            name: "js".to_string(),
            description: None,
            policy_type: "js".to_string(),
            logic: Logic::Positive,
            decision_strategy: DecisionStrategy::Unanimous,
            config: BTreeMap::new(),
        };

        assert_eq!(
            Policy::try_from(external).unwrap_err(),
            DomainError::InvalidPolicyType {
                value: "js".to_string()
            }
        );
    }
}
