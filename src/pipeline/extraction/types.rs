use serde::{Deserialize, Serialize};

/// A run of text at a position on a page.
///
/// Coordinates use a top-left origin: `y` grows down the page, so sorting by
/// `(page, y, x)` gives reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextToken {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub page: usize,
}

impl TextToken {
    pub fn new(text: impl Into<String>, x: f32, y: f32, page: usize) -> Self {
        Self {
            text: text.into(),
            x,
            y,
            page,
        }
    }

    /// Tokens with blank text or non-finite coordinates are skipped.
    pub fn is_well_formed(&self) -> bool {
        !self.text.trim().is_empty() && self.x.is_finite() && self.y.is_finite()
    }

    /// Candidate label: trimmed text ending in a colon.
    pub fn is_label(&self) -> bool {
        let t = self.text.trim();
        t.ends_with(':') && t.len() > 1
    }

    /// Split `Label: value` carried in one token at its first `": "`.
    /// The value token sits `char_advance` points per character to the right
    /// of the label start. `None` when there is no label or no value.
    pub fn split_inline_label(&self, char_advance: f32) -> Option<(TextToken, TextToken)> {
        let colon = self.text.find(": ")?;
        let (label, rest) = self.text.split_at(colon + 1);
        let value = rest.trim();
        if label.trim().len() <= 1 || value.is_empty() {
            return None;
        }
        let offset = (label.chars().count() + 1) as f32 * char_advance;
        Some((
            TextToken::new(label.trim(), self.x, self.y, self.page),
            TextToken::new(value, self.x + offset, self.y, self.page),
        ))
    }
}

/// Tolerances that steer column detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutTolerances {
    /// Slack (points) when matching x positions to the answer column.
    pub column_x_tolerance: f32,
    /// Below this many labels, use the single-pass heuristic.
    pub minimum_colon_count: usize,
    /// Label rows that must share an answer x before two columns are assumed.
    pub minimum_question_rows: usize,
    /// Labels must start left of this x in single-column layouts.
    pub margin_size: f32,
}

impl Default for LayoutTolerances {
    fn default() -> Self {
        Self {
            column_x_tolerance: 5.0,
            minimum_colon_count: 5,
            minimum_question_rows: 3,
            margin_size: 72.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    /// No colon-terminated tokens.
    Empty,
    /// Too few labels for layout analysis; sequential association.
    Heuristic,
    /// Enough labels but no consistent answer column.
    SingleColumn,
    /// Question column on the left, answers aligned on the right.
    TwoColumn,
}

impl LayoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Heuristic => "heuristic",
            Self::SingleColumn => "single_column",
            Self::TwoColumn => "two_column",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutDiagnostics {
    pub mode: LayoutMode,
    pub colon_count: usize,
    /// Detected x of the answer column (two-column layouts).
    pub answer_column_x: Option<f32>,
    /// Labels whose following token sat in the best answer-column cluster.
    pub column_row_matches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub label: String,
    pub value: String,
}

/// Label/value pairs extracted from one attachment, in document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub fields: Vec<ExtractedField>,
    pub layout: LayoutDiagnostics,
}

impl ParsedDocument {
    pub fn empty() -> Self {
        Self {
            fields: Vec::new(),
            layout: LayoutDiagnostics {
                mode: LayoutMode::Empty,
                colon_count: 0,
                answer_column_x: None,
                column_row_matches: 0,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// First value whose label matches, ignoring case, spacing and a trailing colon.
    pub fn get(&self, label: &str) -> Option<&str> {
        let wanted = normalize_label(label);
        self.fields
            .iter()
            .find(|f| normalize_label(&f.label) == wanted)
            .map(|f| f.value.as_str())
    }
}

/// Lowercase, collapse whitespace, drop a trailing colon.
pub fn normalize_label(label: &str) -> String {
    let collapsed = label.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(':')
        .trim_end()
        .to_lowercase()
}
