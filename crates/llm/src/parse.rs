//! Lenient extraction of JSON from model replies.
//!
//! Models asked for JSON still wrap it in prose or code fences often enough
//! that callers need a tolerant first pass. Validation of the *content*
//! happens downstream; this module only finds and deserializes the block.

use serde::de::DeserializeOwned;

/// Pull the first JSON value out of a model reply.
///
/// Tries, in order: the whole trimmed reply, a ```json fenced block, and
/// the outermost `{…}` span. Returns `None` when nothing deserializes.
pub fn extract_json_block<T: DeserializeOwned>(reply: &str) -> Option<T> {
    let trimmed = reply.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(body) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(body.trim()) {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        serde_json::from_str(&trimmed[start..=end]).ok()
    } else {
        None
    }
}

/// Body of the first ```json (or bare ```) fence, if any.
fn fenced_block(text: &str) -> Option<&str> {
    let after_open = text
        .split_once("```json")
        .or_else(|| text.split_once("```"))
        .map(|(_, rest)| rest)?;
    let (body, _) = after_open.split_once("```")?;
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn bare_json_object() {
        let value: Value = extract_json_block(r#"{"status":"ok"}"#).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn fenced_json_with_prose() {
        let reply = "Here you go:\n```json\n{\"memories\": []}\n```\nAnything else?";
        let value: Value = extract_json_block(reply).unwrap();
        assert!(value["memories"].as_array().unwrap().is_empty());
    }

    #[test]
    fn bare_fence_without_language_tag() {
        let reply = "```\n{\"n\": 3}\n```";
        let value: Value = extract_json_block(reply).unwrap();
        assert_eq!(value["n"], 3);
    }

    #[test]
    fn embedded_object_in_prose() {
        let reply = "I decided {\"action\":\"REJECTED\"} after checking.";
        let value: Value = extract_json_block(reply).unwrap();
        assert_eq!(value["action"], "REJECTED");
    }

    #[test]
    fn nested_braces_survive() {
        let reply = r#"{"outer":{"inner":"{}"}}"#;
        let value: Value = extract_json_block(reply).unwrap();
        assert_eq!(value["outer"]["inner"], "{}");
    }

    #[test]
    fn plain_text_yields_none() {
        assert!(extract_json_block::<Value>("no json here").is_none());
        assert!(extract_json_block::<Value>("").is_none());
    }

    #[test]
    fn typed_extraction() {
        #[derive(serde::Deserialize)]
        struct Reply {
            answer: String,
        }
        let parsed: Reply = extract_json_block("```json\n{\"answer\":\"42\"}\n```").unwrap();
        assert_eq!(parsed.answer, "42");
    }
}
