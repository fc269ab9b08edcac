//! Element reference handles and the inbound format guard.
//!
//! The worker hands out opaque handles of the form `ref_<n>`, optionally
//! prefixed `find_` or `page_` by the tool that minted them. Any inbound
//! reference that does not match is rejected before it can reach a selector,
//! which keeps attacker-shaped strings out of DOM and debugger calls.

use serde_json::Value;

use crate::protocol::{ErrorCode, ToolError};

/// Whether `candidate` matches `^(find_|page_)?ref_\d+$`.
#[must_use]
pub fn is_valid_element_ref(candidate: &str) -> bool {
    let rest = candidate
        .strip_prefix("find_")
        .or_else(|| candidate.strip_prefix("page_"))
        .unwrap_or(candidate);
    let Some(digits) = rest.strip_prefix("ref_") else {
        return false;
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Input fields that carry element references.
const REF_FIELDS: &[&str] = &["ref", "startRef", "endRef"];

/// Reject any reference-shaped input field that fails the format guard.
pub fn validate_input_refs(input: &Value) -> Result<(), ToolError> {
    for field in REF_FIELDS {
        match input.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::String(candidate)) if is_valid_element_ref(candidate) => {}
            Some(other) => {
                return Err(ToolError::new(
                    ErrorCode::InvalidParams,
                    format!("field '{field}' is not a valid element ref: {other}"),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_and_prefixed_refs_are_accepted() {
        for candidate in ["ref_0", "ref_123456", "find_ref_7", "page_ref_42"] {
            assert!(is_valid_element_ref(candidate), "{candidate} must be accepted");
        }
    }

    #[test]
    fn test_malformed_refs_are_rejected() {
        for candidate in [
            "",
            "ref_",
            "ref_12a",
            "Ref_1",
            "find_page_ref_1",
            "page_find_ref_1",
            "ref_1; drop table",
            "#selector",
            "ref_1 ",
            " ref_1",
            "findref_1",
        ] {
            assert!(
                !is_valid_element_ref(candidate),
                "{candidate:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_validate_input_refs_rejects_injection_shaped_ref() {
        let err = validate_input_refs(&json!({"ref": "ref_1'); window.close(); //"}))
            .expect_err("injection-shaped ref must be rejected");
        assert_eq!(err.code, ErrorCode::InvalidParams);
    }

    #[test]
    fn test_validate_input_refs_ignores_absent_fields_and_checks_all_ref_fields() {
        validate_input_refs(&json!({"url": "https://example.com/"})).expect("no refs present");
        validate_input_refs(&json!({"ref": "find_ref_3", "startRef": "ref_1"}))
            .expect("valid refs pass");
        validate_input_refs(&json!({"endRef": "page_ref"}))
            .expect_err("invalid endRef must be rejected");
        validate_input_refs(&json!({"ref": 17}))
            .expect_err("non-string ref must be rejected");
    }
}
