use crate::fast::requests::Request;
use std::borrow::Cow;

/// The app script carrying the API token.
pub(crate) struct AppScript {
    pub path: String,
}

impl Request for AppScript {
    type Response = String;

    fn endpoint(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.path)
    }
}

/// Extract the API token embedded in the minified app script as
/// `token:"..."`.
pub(crate) fn extract_token(script: &str) -> Option<String> {
    let mut rest = script;

    while let Some(at) = rest.find("token") {
        let after = rest[at + "token".len()..].trim_start();
        rest = &rest[at + "token".len()..];

        let Some(value) = after.strip_prefix(':').map(str::trim_start) else {
            continue;
        };
        let Some(quote) = value.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            continue;
        };

        let value = &value[1..];
        if let Some(end) = value.find(quote) {
            let token = &value[..end];
            if !token.is_empty() && token.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Some(token.to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_token_from_minified_script() {
        let script = r#"var a={https:!0,urlCount:5,token:"YXNkZmFzZGxmbnNkYWZoYXNkZmhrYWxm"};"#;
        assert_eq!(
            extract_token(script).as_deref(),
            Some("YXNkZmFzZGxmbnNkYWZoYXNkZmhrYWxm")
        );
    }

    #[test]
    fn test_extract_token_skips_unrelated_mentions() {
        let script = r#"function token(){};var tokenizer=1;e={token : 'abc123'}"#;
        assert_eq!(extract_token(script).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_extract_token_missing() {
        assert_eq!(extract_token("var x = 1;"), None);
        assert_eq!(extract_token(r#"token:"""#), None);
    }
}
