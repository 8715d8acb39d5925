//! Markup preprocessing ahead of layout extraction.
//!
//! Referral RTF exported by some GP systems embeds sequences that confuse
//! the tokeniser (stray `\'` escapes, field instructions, template
//! placeholders). Filter rules strip or replace those literal substrings.
//!
//! Large documents are processed in fixed-size windows. A window never
//! commits the last `pattern - 1` characters unless input is exhausted, so
//! a match spanning a window boundary is still found and the result is the
//! same as a whole-string replacement.

use serde::{Deserialize, Serialize};

use super::ExtractionError;

pub const DEFAULT_BUFFER_SIZE: usize = 256;
pub const MIN_BUFFER_SIZE: usize = 2;

/// Replace every occurrence of `pattern` with `replacement`.
/// An empty replacement strips the pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRule {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

impl FilterRule {
    pub fn strip(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            replacement: String::new(),
        }
    }

    pub fn replace(pattern: &str, replacement: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    rules: Vec<FilterRule>,
    buffer_size: usize,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Preprocessor {
    pub fn new(rules: Vec<FilterRule>, buffer_size: usize) -> Result<Self, ExtractionError> {
        if buffer_size < MIN_BUFFER_SIZE {
            return Err(ExtractionError::InvalidBufferSize(buffer_size));
        }
        let rules = rules
            .into_iter()
            .filter(|r| !r.pattern.is_empty())
            .collect();
        Ok(Self { rules, buffer_size })
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Apply every rule, in order, to `input`.
    pub fn apply(&self, input: &str) -> String {
        let mut text = input.to_string();
        for rule in &self.rules {
            text = apply_rule_windowed(&text, rule, self.buffer_size);
        }
        text
    }
}

/// One rule over `input`, reading at most `buffer_size` new characters per window.
fn apply_rule_windowed(input: &str, rule: &FilterRule, buffer_size: usize) -> String {
    let pattern: Vec<char> = rule.pattern.chars().collect();
    let chars: Vec<char> = input.chars().collect();
    let window = buffer_size.max(pattern.len());

    let mut output = String::with_capacity(input.len());
    let mut buffer: Vec<char> = Vec::with_capacity(window + pattern.len());
    let mut consumed = 0;

    while consumed < chars.len() {
        let end = (consumed + window).min(chars.len());
        buffer.extend_from_slice(&chars[consumed..end]);
        consumed = end;
        let at_end = consumed == chars.len();

        let mut i = 0;
        while i < buffer.len() {
            if buffer[i..].starts_with(&pattern) {
                output.push_str(&rule.replacement);
                i += pattern.len();
            } else if !at_end && buffer.len() - i < pattern.len() {
                // Possible partial match: carry into the next window.
                break;
            } else {
                output.push(buffer[i]);
                i += 1;
            }
        }
        buffer.drain(..i);
    }

    output.extend(buffer);
    output
}
