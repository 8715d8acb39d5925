pub mod types;
pub mod sanitize;
pub mod format;
pub mod preprocess;
pub mod pdf;
pub mod rtf;
pub mod column_detect;
pub mod parser;
pub mod fields;

pub use types::*;
pub use sanitize::*;
pub use format::{detect_format, DocumentFormat};
pub use preprocess::{FilterRule, Preprocessor, DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};
pub use parser::parse_tokens;
pub use fields::{map_referral, validate_nhs_number, ReferralFields, ReferralRequest};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),

    #[error("RTF parsing failed: {0}")]
    RtfParsing(String),

    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Preprocessing buffer size {0} is below the minimum of {MIN_BUFFER_SIZE}")]
    InvalidBufferSize(usize),
}

/// Extract positioned tokens from a raw attachment.
///
/// RTF markup runs through `preprocessor` before tokenisation; PDF content
/// streams are binary and are read as-is.
pub fn extract_tokens(
    bytes: &[u8],
    preprocessor: &Preprocessor,
) -> Result<Vec<TextToken>, ExtractionError> {
    match detect_format(bytes) {
        DocumentFormat::Pdf => pdf::extract_tokens(bytes),
        DocumentFormat::Rtf => {
            let markup = String::from_utf8_lossy(bytes);
            let filtered = preprocessor.apply(&markup);
            rtf::extract_tokens(&filtered)
        }
        DocumentFormat::Unsupported => Err(ExtractionError::UnsupportedFormat(
            describe_header(bytes),
        )),
    }
}

/// Extract tokens and parse them into label/value pairs.
pub fn parse_document(
    bytes: &[u8],
    preprocessor: &Preprocessor,
    tolerances: &LayoutTolerances,
) -> Result<ParsedDocument, ExtractionError> {
    let tokens = extract_tokens(bytes, preprocessor)?;
    Ok(parse_tokens(&tokens, tolerances))
}

fn describe_header(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "empty document".to_string();
    }
    let head: String = bytes
        .iter()
        .take(8)
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("unrecognised header [{head}]")
}
