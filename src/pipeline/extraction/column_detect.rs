// Line grouping and answer-column detection for positioned tokens.
// Referral forms are usually a question column on the left with answers
// aligned on the right. This module finds that alignment from the x of the
// token that follows each label.

use super::types::TextToken;

/// Tokens whose baselines differ by at most this many points share a line.
pub const LINE_Y_TOLERANCE: f32 = 2.0;

/// One visual line: tokens on the same page and baseline, left to right.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub page: usize,
    pub y: f32,
    pub tokens: Vec<TextToken>,
}

/// Detected answer column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnswerColumn {
    /// Leftmost x of the answers in the winning cluster.
    pub x: f32,
    /// Labels whose following token fell in the cluster.
    pub matches: usize,
}

/// Drop malformed tokens and group the rest into reading-order lines.
///
/// Sorting is stable, so tokens at identical positions keep their
/// extraction order.
pub fn group_into_lines(tokens: &[TextToken], y_tolerance: f32) -> Vec<Line> {
    let mut sorted: Vec<&TextToken> = tokens.iter().filter(|t| t.is_well_formed()).collect();
    sorted.sort_by(|a, b| a.page.cmp(&b.page).then(a.y.total_cmp(&b.y)));

    let mut lines: Vec<Line> = Vec::new();
    for token in sorted {
        match lines.last_mut() {
            Some(line) if line.page == token.page && (token.y - line.y).abs() <= y_tolerance => {
                line.tokens.push(token.clone());
            }
            _ => lines.push(Line {
                page: token.page,
                y: token.y,
                tokens: vec![token.clone()],
            }),
        }
    }

    for line in &mut lines {
        line.tokens.sort_by(|a, b| a.x.total_cmp(&b.x));
    }
    lines
}

/// Find the answer column from the x of each label's following token.
///
/// Returns `None` when no cluster reaches `minimum_rows` members.
pub fn detect_answer_column(
    following_x: &[f32],
    tolerance: f32,
    minimum_rows: usize,
) -> Option<AnswerColumn> {
    let (x, matches) = find_best_cluster(following_x, tolerance)?;
    if matches >= minimum_rows.max(1) {
        Some(AnswerColumn { x, matches })
    } else {
        None
    }
}

/// Find the position cluster with the most entries.
/// Returns (leftmost_position_in_cluster, count). Ties keep the first position seen.
fn find_best_cluster(positions: &[f32], tolerance: f32) -> Option<(f32, usize)> {
    let mut best: Option<(f32, usize)> = None;

    for &pos in positions {
        let count = positions
            .iter()
            .filter(|&&p| (p - pos).abs() <= tolerance)
            .count();

        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((pos, count));
        }
    }

    best.map(|(center, count)| {
        let leftmost = positions
            .iter()
            .copied()
            .filter(|p| (p - center).abs() <= tolerance)
            .fold(center, f32::min);
        (leftmost, count)
    })
}
