//! Label/value extraction from positioned tokens.
//!
//! Three strategies, chosen per document:
//! - heuristic: too few labels to analyse layout, each label takes the
//!   tokens after it up to the next label;
//! - two-column: answers aligned on a common x, questions on the left, and
//!   questions may wrap over several lines;
//! - single-column: like heuristic, but only labels at the left margin
//!   start a field.

use super::column_detect::{detect_answer_column, group_into_lines, Line, LINE_Y_TOLERANCE};
use super::types::{
    ExtractedField, LayoutDiagnostics, LayoutMode, LayoutTolerances, ParsedDocument, TextToken,
};

/// Largest baseline gap (points) across which unanswered question text is
/// joined with the next line. Wider gaps separate headings from questions.
const WRAP_MAX_GAP: f32 = 14.0;

/// Parse tokens into label/value pairs. Never fails; a document with no
/// labels yields an empty result.
pub fn parse_tokens(tokens: &[TextToken], tolerances: &LayoutTolerances) -> ParsedDocument {
    let lines = group_into_lines(tokens, LINE_Y_TOLERANCE);
    let ordered: Vec<&TextToken> = lines.iter().flat_map(|l| l.tokens.iter()).collect();

    let colon_count = ordered.iter().filter(|t| t.is_label()).count();
    if colon_count == 0 {
        tracing::debug!(tokens = ordered.len(), "No labels found in document");
        return ParsedDocument::empty();
    }

    if colon_count < tolerances.minimum_colon_count {
        return ParsedDocument {
            fields: parse_sequential(&ordered, |_| true),
            layout: diagnostics(LayoutMode::Heuristic, colon_count, None, 0),
        };
    }

    let following_x: Vec<f32> = lines
        .iter()
        .flat_map(|line| {
            line.tokens
                .windows(2)
                .filter(|pair| pair[0].is_label())
                .map(|pair| pair[1].x)
        })
        .collect();

    match detect_answer_column(
        &following_x,
        tolerances.column_x_tolerance,
        tolerances.minimum_question_rows,
    ) {
        Some(column) => {
            tracing::debug!(
                answer_x = column.x,
                matches = column.matches,
                "Two-column layout detected"
            );
            ParsedDocument {
                fields: parse_two_column(&lines, column.x - tolerances.column_x_tolerance),
                layout: diagnostics(
                    LayoutMode::TwoColumn,
                    colon_count,
                    Some(column.x),
                    column.matches,
                ),
            }
        }
        None => {
            let margin = tolerances.margin_size;
            ParsedDocument {
                fields: parse_sequential(&ordered, |t| t.x <= margin),
                layout: diagnostics(LayoutMode::SingleColumn, colon_count, None, 0),
            }
        }
    }
}

fn diagnostics(
    mode: LayoutMode,
    colon_count: usize,
    answer_column_x: Option<f32>,
    column_row_matches: usize,
) -> LayoutDiagnostics {
    LayoutDiagnostics {
        mode,
        colon_count,
        answer_column_x,
        column_row_matches,
    }
}

#[derive(Debug, Default)]
struct FieldBuilder {
    label: Vec<String>,
    value: Vec<String>,
}

impl FieldBuilder {
    fn finish(self) -> ExtractedField {
        let label = self.label.join(" ");
        let label = label.split_whitespace().collect::<Vec<_>>().join(" ");
        ExtractedField {
            label: label.trim_end_matches(':').trim_end().to_string(),
            value: self.value.join(" ").trim().to_string(),
        }
    }
}

/// Each label that satisfies `starts_field` opens a field; everything else
/// is value text for the open field. Text before the first label is dropped.
fn parse_sequential(
    tokens: &[&TextToken],
    starts_field: impl Fn(&TextToken) -> bool,
) -> Vec<ExtractedField> {
    let mut fields = Vec::new();
    let mut current: Option<FieldBuilder> = None;

    for token in tokens {
        if token.is_label() && starts_field(token) {
            if let Some(done) = current.take() {
                fields.push(done.finish());
            }
            current = Some(FieldBuilder {
                label: vec![token.text.clone()],
                value: Vec::new(),
            });
        } else if let Some(open) = current.as_mut() {
            open.value.push(token.text.clone());
        }
    }

    fields.extend(current.map(FieldBuilder::finish));
    fields
}

/// Tokens left of `boundary` are question text, the rest answers.
fn parse_two_column(lines: &[Line], boundary: f32) -> Vec<ExtractedField> {
    let mut fields = Vec::new();
    let mut current: Option<FieldBuilder> = None;
    // Question-column text without a colon yet, from the previous line.
    let mut pending: Option<(FieldBuilder, f32)> = None;

    for line in lines {
        let (questions, answers): (Vec<&TextToken>, Vec<&TextToken>) =
            line.tokens.iter().partition(|t| t.x < boundary);

        // A wrapped question only continues onto the immediately following
        // line, and only if it already has an answer or the lines are close.
        let completes_question = questions.iter().any(|t| t.is_label());
        let mut open = match pending.take() {
            Some((fragment, y))
                if completes_question
                    && (!fragment.value.is_empty() || (line.y - y).abs() <= WRAP_MAX_GAP) =>
            {
                Some(fragment)
            }
            Some((fragment, _)) => {
                spill(Some(fragment), &mut current);
                None
            }
            None => None,
        };

        for token in questions {
            let builder = open.get_or_insert_with(FieldBuilder::default);
            builder.label.push(token.text.clone());
            if token.is_label() {
                let question = std::mem::take(builder);
                open = None;
                if let Some(done) = current.replace(question) {
                    fields.push(done.finish());
                }
            }
        }

        let answer_text = answers.into_iter().map(|t| t.text.clone());
        match (open.as_mut(), current.as_mut()) {
            (Some(unfinished), _) => unfinished.value.extend(answer_text),
            (None, Some(field)) => field.value.extend(answer_text),
            (None, None) => {}
        }

        pending = open.map(|fragment| (fragment, line.y));
    }

    spill(pending.map(|(fragment, _)| fragment), &mut current);
    fields.extend(current.map(FieldBuilder::finish));
    fields
}

/// Question-column text that never reached a colon is value text of the
/// open field, or dropped before the first question.
fn spill(unfinished: Option<FieldBuilder>, current: &mut Option<FieldBuilder>) {
    if let (Some(text), Some(field)) = (unfinished, current.as_mut()) {
        field.value.extend(text.label);
        field.value.extend(text.value);
    }
}
