//! Permission-name parsing into capability keys.
//!
//! A permission name ends with a verb token (`foo.item.put`); the prefix
//! names the resource (`Foo Item`) and the verb maps to a canonical
//! [`CapabilityAction`].

use crate::model::{CapabilityAction, CapabilityKey, CapabilityType, Endpoint};

/// Verb tokens per action, in canonical-name precedence order.
const VERBS: &[(CapabilityAction, &[&str])] = &[
    (
        CapabilityAction::View,
        &["get", "view", "read", "search", "list", "collection-get"],
    ),
    (CapabilityAction::Create, &["post", "create", "add", "upload"]),
    (
        CapabilityAction::Edit,
        &["put", "patch", "edit", "update", "modify"],
    ),
    (CapabilityAction::Delete, &["delete", "remove", "delete-all"]),
    (CapabilityAction::Manage, &["all", "manage", "*"]),
    (CapabilityAction::Execute, &["execute", "exec", "run"]),
];

/// Result of parsing a permission name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPermission {
    pub key: CapabilityKey,
    pub capability_type: CapabilityType,
    /// The verb token that produced the action; `None` when derived from an endpoint.
    pub verb: Option<String>,
}

impl ParsedPermission {
    /// Precedence of this permission when several fold into one key; lower wins.
    pub fn verb_rank(&self) -> usize {
        self.verb
            .as_deref()
            .and_then(|verb| {
                VERBS
                    .iter()
                    .find(|(action, _)| *action == self.key.action)
                    .and_then(|(_, verbs)| verbs.iter().position(|v| *v == verb))
            })
            .unwrap_or(usize::MAX)
    }
}

fn action_for_verb(token: &str) -> Option<(CapabilityAction, &'static str)> {
    VERBS.iter().find_map(|(action, verbs)| {
        verbs
            .iter()
            .find(|v| **v == token)
            .map(|verb| (*action, *verb))
    })
}

/// `["foo", "item"]` -> `Foo Item`; `-` and `_` also separate words.
pub(crate) fn resource_name(tokens: &[&str]) -> String {
    tokens
        .iter()
        .flat_map(|t| t.split(['-', '_']))
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn capability_type(tokens: &[&str], action: CapabilityAction) -> CapabilityType {
    if tokens.iter().any(|t| t.eq_ignore_ascii_case("settings")) {
        CapabilityType::Settings
    } else if action == CapabilityAction::Execute {
        CapabilityType::Procedural
    } else {
        CapabilityType::Data
    }
}

/// Parses `name` into a capability key.
///
/// Falls back to the first endpoint's HTTP method when the name has no
/// verb token. Returns `None` when neither source yields an action.
pub fn parse_permission(name: &str, endpoints: &[Endpoint]) -> Option<ParsedPermission> {
    let tokens: Vec<&str> = name.split('.').filter(|t| !t.is_empty()).collect();
    let (last, prefix) = tokens.split_last()?;
    let last = last.to_ascii_lowercase();

    if let Some((action, verb)) = action_for_verb(&last) {
        if prefix.is_empty() {
            return None;
        }
        return Some(ParsedPermission {
            key: CapabilityKey::new(resource_name(prefix), action),
            capability_type: capability_type(prefix, action),
            verb: Some(verb.to_string()),
        });
    }

    let action = endpoints
        .first()
        .and_then(|e| CapabilityAction::from_http_method(e.method))?;
    Some(ParsedPermission {
        key: CapabilityKey::new(resource_name(&tokens), action),
        capability_type: capability_type(&tokens, action),
        verb: None,
    })
}

/// Names that parse to the same key as `name` by swapping its verb token.
///
/// `foo.item.put` yields itself first, then `foo.item.patch`,
/// `foo.item.edit` and the other EDIT verbs. A name without a verb token has
/// no alias but itself.
pub fn permission_aliases(name: &str) -> Vec<String> {
    let mut aliases = vec![name.to_string()];
    let tokens: Vec<&str> = name.split('.').filter(|t| !t.is_empty()).collect();
    let Some((last, prefix)) = tokens.split_last() else {
        return aliases;
    };
    let Some((action, _)) = action_for_verb(&last.to_ascii_lowercase()) else {
        return aliases;
    };
    if prefix.is_empty() {
        return aliases;
    }

    let prefix = prefix.join(".");
    let verbs = VERBS
        .iter()
        .filter(|(verb_action, _)| *verb_action == action)
        .flat_map(|(_, verbs)| verbs.iter());
    for verb in verbs {
        let alias = format!("{prefix}.{verb}");
        if !aliases.contains(&alias) {
            aliases.push(alias);
        }
    }
    aliases
}
