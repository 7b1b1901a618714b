use sjtagent_core::error::ModelError;

/// Extract JSON from a response that may contain markdown code fences or
/// surrounding prose.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return &trimmed[start..=end];
            }
        }
    }
    trimmed
}

/// Parse the first JSON object out of a model answer.
///
/// Anything that is not a JSON object is `MalformedOutput`.
pub fn parse_json_object(text: &str) -> Result<serde_json::Value, ModelError> {
    let candidate = extract_json(text);
    match serde_json::from_str::<serde_json::Value>(candidate) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) => Err(ModelError::malformed("expected a JSON object")),
        Err(e) => Err(ModelError::malformed(format!("unparseable JSON: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sjtagent_core::error::ModelErrorKind;

    #[test]
    fn test_extract_json_plain() {
        let input = r#"{"A": "x"}"#;
        assert_eq!(extract_json(input), input);
    }

    #[test]
    fn test_extract_json_code_fence() {
        let input = "Here you go:\n```json\n{\"options\": []}\n```";
        assert_eq!(extract_json(input), "{\"options\": []}");
    }

    #[test]
    fn test_extract_json_with_text() {
        let input = r#"The answer is: {"winner": "B"} thanks"#;
        assert_eq!(extract_json(input), r#"{"winner": "B"}"#);
    }

    #[test]
    fn test_parse_rejects_non_object() {
        let err = parse_json_object("[1, 2, 3]").unwrap_err();
        assert_eq!(err.kind, ModelErrorKind::MalformedOutput);
    }

    #[test]
    fn test_parse_rejects_prose() {
        let err = parse_json_object("I cannot answer that.").unwrap_err();
        assert_eq!(err.kind, ModelErrorKind::MalformedOutput);
    }

    #[test]
    fn test_parse_object() {
        let value = parse_json_object("```\n{\"a\": 1}\n```").unwrap();
        assert_eq!(value["a"], 1);
    }
}
