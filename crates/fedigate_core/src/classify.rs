/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::uri_safety::host_from_url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Object types whose Create/Update introduces a new remote actor.
pub const ACTOR_TYPES: &[&str] = &["Person", "Group", "Service", "Application", "Organization"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityKind {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Undo,
    Announce,
    Like,
    Dislike,
    EmojiReact,
    Block,
    Flag,
    Add,
    Remove,
    Move,
    Unsupported(String),
}

impl ActivityKind {
    pub fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Undo" => Self::Undo,
            "Announce" => Self::Announce,
            "Like" => Self::Like,
            "Dislike" => Self::Dislike,
            "EmojiReact" => Self::EmojiReact,
            "Block" => Self::Block,
            "Flag" => Self::Flag,
            "Add" => Self::Add,
            "Remove" => Self::Remove,
            "Move" => Self::Move,
            _ => return None,
        })
    }

    /// Reads `type`, which may be a string or an array of type names.
    pub fn of(activity: &Value) -> Self {
        match activity.get("type") {
            Some(Value::String(s)) => {
                Self::from_type_name(s).unwrap_or_else(|| Self::Unsupported(s.clone()))
            }
            Some(Value::Array(items)) => {
                let names: Vec<&str> = items.iter().filter_map(|v| v.as_str()).collect();
                names
                    .iter()
                    .find_map(|n| Self::from_type_name(n))
                    .unwrap_or_else(|| Self::Unsupported(names.join(",")))
            }
            _ => Self::Unsupported(String::new()),
        }
    }

    pub fn handler(&self) -> Option<HandlerKind> {
        Some(match self {
            Self::Create => HandlerKind::Create,
            Self::Update => HandlerKind::Update,
            Self::Delete => HandlerKind::Delete,
            Self::Follow => HandlerKind::Follow,
            Self::Accept | Self::Reject => HandlerKind::FollowResponse,
            Self::Undo => HandlerKind::Undo,
            Self::Announce => HandlerKind::Announce,
            Self::Like | Self::Dislike | Self::EmojiReact => HandlerKind::Vote,
            Self::Block => HandlerKind::Block,
            Self::Flag => HandlerKind::Flag,
            Self::Add | Self::Remove => HandlerKind::Collection,
            Self::Move => HandlerKind::Move,
            Self::Unsupported(_) => return None,
        })
    }

    pub fn is_vote(&self) -> bool {
        matches!(self, Self::Like | Self::Dislike | Self::EmojiReact)
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(name) if name.is_empty() => f.write_str("(missing)"),
            Self::Unsupported(name) => f.write_str(name),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Queue routing key. Each supported activity kind maps onto exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Create,
    Update,
    Delete,
    Follow,
    FollowResponse,
    Undo,
    Announce,
    Vote,
    Block,
    Flag,
    Collection,
    Move,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 12] = [
        HandlerKind::Create,
        HandlerKind::Update,
        HandlerKind::Delete,
        HandlerKind::Follow,
        HandlerKind::FollowResponse,
        HandlerKind::Undo,
        HandlerKind::Announce,
        HandlerKind::Vote,
        HandlerKind::Block,
        HandlerKind::Flag,
        HandlerKind::Collection,
        HandlerKind::Move,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Create => "create",
            HandlerKind::Update => "update",
            HandlerKind::Delete => "delete",
            HandlerKind::Follow => "follow",
            HandlerKind::FollowResponse => "follow_response",
            HandlerKind::Undo => "undo",
            HandlerKind::Announce => "announce",
            HandlerKind::Vote => "vote",
            HandlerKind::Block => "block",
            HandlerKind::Flag => "flag",
            HandlerKind::Collection => "collection",
            HandlerKind::Move => "move",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|h| h.as_str() == s)
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedActivity {
    pub kind: ActivityKind,
    pub id: Option<String>,
    pub actor: Option<String>,
    pub object_id: Option<String>,
    pub object_type: Option<String>,
}

impl ClassifiedActivity {
    /// Actor URIs this activity would make known locally: the sender, plus the
    /// object of a Create/Update when it is itself an actor.
    pub fn actor_candidates(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(a) = &self.actor {
            out.push(a.clone());
        }
        if matches!(self.kind, ActivityKind::Create | ActivityKind::Update) {
            let is_actor = self
                .object_type
                .as_deref()
                .map(|t| ACTOR_TYPES.contains(&t))
                .unwrap_or(false);
            if let (true, Some(id)) = (is_actor, &self.object_id) {
                if !out.contains(id) {
                    out.push(id.clone());
                }
            }
        }
        out
    }
}

pub fn classify(activity: &Value) -> ClassifiedActivity {
    ClassifiedActivity {
        kind: ActivityKind::of(activity),
        id: activity
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        actor: extract_actor(activity),
        object_id: extract_object_id(activity),
        object_type: extract_object_type(activity),
    }
}

/// `actor` may be a string or an object; falls back to `object.attributedTo`.
pub fn extract_actor(activity: &Value) -> Option<String> {
    if let Some(a) = activity.get("actor") {
        if let Some(id) = first_id(a) {
            return Some(id);
        }
    }
    let obj = activity.get("object")?;
    first_id(obj.get("attributedTo")?)
}

pub fn extract_object_id(activity: &Value) -> Option<String> {
    first_id(activity.get("object")?)
}

fn extract_object_type(activity: &Value) -> Option<String> {
    let obj = activity.get("object")?;
    let obj = match obj {
        Value::Array(items) => items.iter().find(|v| v.is_object())?,
        other => other,
    };
    match obj.get("type")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .find(|t| ACTOR_TYPES.contains(t))
            .or_else(|| items.iter().find_map(|v| v.as_str()))
            .map(|s| s.to_string()),
        _ => None,
    }
}

fn first_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()),
        Value::Array(arr) => arr.iter().find_map(|it| match it {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()),
            _ => None,
        }),
        _ => None,
    }
}

/// The activity `id`, or a content hash for activities that carry none.
/// Queue dedup key. The activity `id` is used as-is only when the verified
/// signer shares its host; anything else is hashed together with the signer
/// so one sender cannot claim another origin's ids.
pub fn activity_dedup_id(activity: &Value, signer: Option<&str>) -> String {
    let id = activity
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let (Some(id), Some(signer)) = (id, signer) {
        if host_from_url(id).is_some() && host_from_url(id) == host_from_url(signer) {
            return id.to_string();
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(signer.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    match id {
        Some(id) => {
            hasher.update(b"id:");
            hasher.update(id.as_bytes());
        }
        None => {
            let bytes = serde_json::to_vec(&canonicalize_json(activity)).unwrap_or_else(|_| b"null".to_vec());
            hasher.update(b"body:");
            hasher.update(&bytes);
        }
    }
    format!("urn:fedigate:inbox:{}", hex::encode(hasher.finalize()))
}

fn canonicalize_json(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys = map.keys().cloned().collect::<Vec<_>>();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                if let Some(val) = map.get(&k) {
                    out.insert(k, canonicalize_json(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_json).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_supported_kind_has_one_handler() {
        let cases = [
            ("Accept", HandlerKind::FollowResponse),
            ("Reject", HandlerKind::FollowResponse),
            ("Like", HandlerKind::Vote),
            ("Dislike", HandlerKind::Vote),
            ("EmojiReact", HandlerKind::Vote),
            ("Add", HandlerKind::Collection),
            ("Announce", HandlerKind::Announce),
        ];
        for (name, handler) in cases {
            let kind = ActivityKind::from_type_name(name).unwrap();
            assert_eq!(kind.handler(), Some(handler), "{name}");
        }
        assert_eq!(ActivityKind::of(&json!({"type": "Arrive"})).handler(), None);
    }

    #[test]
    fn type_arrays_use_first_recognised_name() {
        let kind = ActivityKind::of(&json!({"type": ["litepub:ChatMessage", "Create"]}));
        assert_eq!(kind, ActivityKind::Create);
        let kind = ActivityKind::of(&json!({"type": ["Foo", "Bar"]}));
        assert_eq!(kind, ActivityKind::Unsupported("Foo,Bar".to_string()));
        assert_eq!(ActivityKind::of(&json!({})).to_string(), "(missing)");
    }

    #[test]
    fn handler_names_parse_back() {
        for h in HandlerKind::ALL {
            assert_eq!(HandlerKind::parse(h.as_str()), Some(h));
            let wire = serde_json::to_value(h).unwrap();
            assert_eq!(wire, json!(h.as_str()));
        }
    }

    #[test]
    fn create_person_adds_actor_candidate() {
        let c = classify(&json!({
            "type": "Update",
            "actor": {"id": "https://a.example/u/1", "type": "Person"},
            "object": {"id": "https://a.example/u/2", "type": "Person"}
        }));
        assert_eq!(c.actor_candidates(), vec!["https://a.example/u/1", "https://a.example/u/2"]);

        let note = classify(&json!({
            "type": "Create",
            "actor": "https://a.example/u/1",
            "object": {"id": "https://a.example/n/1", "type": "Note"}
        }));
        assert_eq!(note.actor_candidates(), vec!["https://a.example/u/1"]);
    }

    #[test]
    fn actor_falls_back_to_attributed_to() {
        let v = json!({"type": "Create", "object": {"attributedTo": [{"id": "https://a.example/u/9"}]}});
        assert_eq!(extract_actor(&v).as_deref(), Some("https://a.example/u/9"));
    }

    #[test]
    fn dedup_id_ignores_key_order() {
        let a = json!({"type": "Like", "actor": "https://a.example/u/1", "object": "https://b.example/n/1"});
        let b: Value = serde_json::from_str(
            r#"{"object":"https://b.example/n/1","actor":"https://a.example/u/1","type":"Like"}"#,
        )
        .unwrap();
        assert_eq!(activity_dedup_id(&a, None), activity_dedup_id(&b, None));
        assert!(activity_dedup_id(&a, None).starts_with("urn:fedigate:inbox:"));
    }

    #[test]
    fn same_origin_ids_are_kept() {
        let v = json!({"id": " https://a.example/act/1 "});
        assert_eq!(activity_dedup_id(&v, Some("https://a.example/u/1")), "https://a.example/act/1");
    }

    #[test]
    fn foreign_ids_are_scoped_to_the_signer() {
        let v = json!({"id": "https://victim.example/act/1", "type": "Create"});
        let forged = activity_dedup_id(&v, Some("https://evil.example/u/1"));
        let real = activity_dedup_id(&v, Some("https://victim.example/u/1"));
        assert_eq!(real, "https://victim.example/act/1");
        assert!(forged.starts_with("urn:fedigate:inbox:"));
        assert_ne!(forged, real);
        // unsigned traffic never takes the plain id either
        let unsigned = activity_dedup_id(&v, None);
        assert_ne!(unsigned, real);
        assert_ne!(unsigned, forged);
    }
}
