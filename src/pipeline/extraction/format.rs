use serde::{Deserialize, Serialize};

/// Attachment formats the parser can read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Rtf,
    Unsupported,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Rtf => "rtf",
            Self::Unsupported => "unsupported",
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }
}

/// Detect the document format from magic bytes (NOT the file name).
/// Registry titles are free text typed by referrers and are often wrong.
pub fn detect_format(bytes: &[u8]) -> DocumentFormat {
    // A UTF-8 BOM or leading whitespace occasionally precedes RTF markup.
    let start = bytes
        .strip_prefix(&[0xEF, 0xBB, 0xBF])
        .unwrap_or(bytes);
    let trimmed = match start.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(i) => &start[i..],
        None => return DocumentFormat::Unsupported,
    };

    match trimmed {
        // PDF: starts with %PDF
        [0x25, 0x50, 0x44, 0x46, ..] => DocumentFormat::Pdf,
        // RTF: starts with {\rtf
        [b'{', b'\\', b'r', b't', b'f', ..] => DocumentFormat::Rtf,
        _ => DocumentFormat::Unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_pdf() {
        assert_eq!(detect_format(b"%PDF-1.4\n..."), DocumentFormat::Pdf);
    }

    #[test]
    fn detects_rtf() {
        assert_eq!(detect_format(b"{\\rtf1\\ansi hello}"), DocumentFormat::Rtf);
    }

    #[test]
    fn detects_rtf_after_bom_and_whitespace() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF, b'\r', b'\n'];
        bytes.extend_from_slice(b"{\\rtf1 x}");
        assert_eq!(detect_format(&bytes), DocumentFormat::Rtf);
    }

    #[test]
    fn docx_and_images_unsupported() {
        assert_eq!(detect_format(b"PK\x03\x04"), DocumentFormat::Unsupported);
        assert_eq!(detect_format(&[0xFF, 0xD8, 0xFF, 0xE0]), DocumentFormat::Unsupported);
        assert!(!detect_format(b"plain text").is_supported());
    }

    #[test]
    fn empty_or_blank_unsupported() {
        assert_eq!(detect_format(b""), DocumentFormat::Unsupported);
        assert_eq!(detect_format(b"   \n"), DocumentFormat::Unsupported);
    }

    #[test]
    fn truncated_headers_unsupported() {
        assert_eq!(detect_format(b"%PD"), DocumentFormat::Unsupported);
        assert_eq!(detect_format(b"{\\rt"), DocumentFormat::Unsupported);
    }
}
