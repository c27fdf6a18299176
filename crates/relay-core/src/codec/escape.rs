//! Escaping for the flat-text dialect.
//!
//! Encoding order matters: `&` is replaced first so that the entities
//! introduced for brackets and commas are not themselves re-escaped.
//! Decoding applies the same table in reverse, finishing with `&amp;`.

/// Escape a literal text run.
pub fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('[', "&#91;")
        .replace(']', "&#93;")
}

/// Escape a tag parameter value (text rules plus commas).
pub fn escape_param(s: &str) -> String {
    escape_text(s).replace(',', "&#44;")
}

/// Reverse [`escape_text`].
pub fn unescape_text(s: &str) -> String {
    s.replace("&#93;", "]")
        .replace("&#91;", "[")
        .replace("&amp;", "&")
}

/// Reverse [`escape_param`].
pub fn unescape_param(s: &str) -> String {
    unescape_text(&s.replace("&#44;", ","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ampersand_is_escaped_before_brackets() {
        assert_eq!(escape_text("a&[b]"), "a&amp;&#91;b&#93;");
    }

    #[test]
    fn literal_entity_survives() {
        // The text literally contains an entity; it must not decode to '['.
        let original = "&#91;not a bracket";
        let encoded = escape_text(original);
        assert_eq!(encoded, "&amp;#91;not a bracket");
        assert_eq!(unescape_text(&encoded), original);
    }

    #[test]
    fn commas_only_escaped_in_params() {
        assert_eq!(escape_text("a,b"), "a,b");
        assert_eq!(escape_param("a,b"), "a&#44;b");
        assert_eq!(unescape_param("a&#44;b"), "a,b");
    }

    #[test]
    fn literal_comma_entity_in_param_survives() {
        let original = "x&#44;y";
        assert_eq!(unescape_param(&escape_param(original)), original);
    }

    proptest! {
        #[test]
        fn text_round_trip(s in ".*") {
            prop_assert_eq!(unescape_text(&escape_text(&s)), s);
        }

        #[test]
        fn param_round_trip(s in "[a-z&\\[\\],#;0-9 ]*") {
            let escaped = escape_param(&s);
            prop_assert!(!escaped.contains(','));
            prop_assert!(!escaped.contains('['));
            prop_assert!(!escaped.contains(']'));
            prop_assert_eq!(unescape_param(&escaped), s);
        }
    }
}
