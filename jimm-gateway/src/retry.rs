//! §4.5 Permission Retry — detection half.
//!
//! The actual retry *procedure* (mint token, rewrite Login, re-issue both messages) lives in
//! [`crate::proxy`] since it needs the live controller socket and in-flight table. This
//! module is the pure, easily-tested half: deciding whether a controller response is a
//! retry trigger at all, and if so, computing the union permission map.

use crate::message::{Message, ACCESS_REQUIRED_CODE};
use std::collections::HashMap;

/// Inspect a controller response for the two `access required` shapes described in §4.5:
/// a top-level error, or a bulk `results` list where every error-bearing entry carries the
/// code. Returns `None` when the message is not a retry trigger at all (including when the
/// response body is empty).
pub fn required_permissions(response: &Message) -> Option<HashMap<String, String>> {
    if response.is_access_required() {
        let info = response.error_info.clone().unwrap_or_default();
        return Some(to_string_map(info));
    }

    let Some(serde_json::Value::Object(obj)) = &response.response else {
        return None;
    };

    let results = obj.get("results")?.as_array()?;

    let mut union = HashMap::new();
    let mut saw_access_required = false;

    for result in results {
        let Some(error) = result.get("error") else { continue };
        let code = error.get("code").and_then(serde_json::Value::as_str);
        if code != Some(ACCESS_REQUIRED_CODE) {
            continue;
        }
        saw_access_required = true;

        let Some(info) = error.get("info").and_then(serde_json::Value::as_object) else {
            continue;
        };

        for (entity, level) in info {
            // Non-string levels fail the retry entirely per §4.5.
            let level = level.as_str()?;
            union.insert(entity.clone(), level.to_owned());
        }
    }

    saw_access_required.then_some(union)
}

fn to_string_map(info: std::collections::HashMap<String, serde_json::Value>) -> HashMap<String, String> {
    info.into_iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_owned())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn top_level_access_required() {
        let msg = Message {
            request_id: 1,
            error: Some("access required".to_owned()),
            error_code: Some("access required".to_owned()),
            error_info: Some([("model-deadbeef".to_owned(), json!("write"))].into_iter().collect()),
            ..Default::default()
        };
        let perms = required_permissions(&msg).unwrap();
        assert_eq!(perms.get("model-deadbeef").unwrap(), "write");
    }

    #[test]
    fn bulk_union_of_multiple_entries() {
        let msg = Message {
            request_id: 1,
            response: Some(json!({
                "results": [
                    {"error": {"code": "access required", "info": {"model-x": "admin"}}},
                    {"error": {"code": "access required", "info": {"model-y": "read"}}}
                ]
            })),
            ..Default::default()
        };
        let perms = required_permissions(&msg).unwrap();
        assert_eq!(perms.len(), 2);
        assert_eq!(perms.get("model-x").unwrap(), "admin");
        assert_eq!(perms.get("model-y").unwrap(), "read");
    }

    #[test]
    fn ordinary_error_is_not_a_trigger() {
        let msg = Message {
            request_id: 1,
            error: Some("boom".to_owned()),
            error_code: Some("some other code".to_owned()),
            ..Default::default()
        };
        assert!(required_permissions(&msg).is_none());
    }

    #[test]
    fn empty_response_is_not_a_trigger() {
        let msg = Message {
            request_id: 1,
            ..Default::default()
        };
        assert!(required_permissions(&msg).is_none());
    }

    #[test]
    fn plain_success_response_is_not_a_trigger() {
        let msg = Message {
            request_id: 1,
            response: Some(json!({"models": []})),
            ..Default::default()
        };
        assert!(required_permissions(&msg).is_none());
    }

    proptest! {
        /// However many `access required` bulk entries a controller packs into `results`,
        /// the union carries every `entity -> level` pair and nothing else, regardless of
        /// how the entities happen to be named or ordered.
        #[test]
        fn bulk_union_carries_every_entry(entities in proptest::collection::vec("[a-z][a-z0-9-]{0,12}", 1..8)) {
            let results: Vec<_> = entities
                .iter()
                .enumerate()
                .map(|(i, entity)| {
                    json!({"error": {"code": "access required", "info": {entity.clone(): format!("level-{i}")}}})
                })
                .collect();

            let msg = Message {
                request_id: 1,
                response: Some(json!({"results": results})),
                ..Default::default()
            };

            let perms = required_permissions(&msg).expect("bulk access-required results must trigger a retry");

            let mut expected = HashMap::new();
            for (i, entity) in entities.iter().enumerate() {
                expected.insert(entity.clone(), format!("level-{i}"));
            }

            prop_assert_eq!(perms, expected);
        }
    }
}
