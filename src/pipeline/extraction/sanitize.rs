/// Clean the text of one extracted token.
/// Strips control and zero-width characters and collapses whitespace runs,
/// leaving punctuation (colons included) untouched.
pub fn sanitize_token_text(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .filter(|c| {
            !c.is_control()
                && !matches!(
                    c,
                    '\u{FFFD}' // Replacement character from lossy decoding
                        | '\u{200B}' // Zero-width space
                        | '\u{200C}'
                        | '\u{200D}'
                        | '\u{FEFF}' // BOM
                )
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_null_bytes() {
        let clean = sanitize_token_text("Jane\x00Smith");
        assert_eq!(clean, "JaneSmith");
    }

    #[test]
    fn strips_control_characters() {
        let clean = sanitize_token_text("Weight:\x01\x02\x03 92 kg");
        assert_eq!(clean, "Weight: 92 kg");
    }

    #[test]
    fn collapses_internal_whitespace() {
        assert_eq!(sanitize_token_text("  Date   of\tbirth: "), "Date of birth:");
    }

    #[test]
    fn preserves_clinical_punctuation() {
        let raw = "BP: 120/80 mmHg (normal), BMI 31.2 kg/m²";
        assert_eq!(sanitize_token_text(raw), raw);
    }

    #[test]
    fn strips_zero_width_and_bom() {
        assert_eq!(sanitize_token_text("\u{FEFF}Name\u{200B}:"), "Name:");
    }

    #[test]
    fn only_control_chars_returns_empty() {
        assert_eq!(sanitize_token_text("\x00\x01\x02"), "");
    }

    #[test]
    fn preserves_accented_names() {
        assert_eq!(sanitize_token_text("Zoë O’Brien-Łukasz"), "Zoë O’Brien-Łukasz");
    }
}
