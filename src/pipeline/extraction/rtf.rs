//! RTF referral letters → positioned tokens.
//!
//! RTF carries no page geometry, so positions are synthesised from the
//! plain-text rendering: one line per `\par`, a fixed character width, and
//! tab stops every eight columns. Tab-separated or widely spaced runs become
//! separate tokens, which is enough for the column parser to see the answer
//! column in form-style letters. `Label: value` on one line is split after
//! the colon.

use super::sanitize::sanitize_token_text;
use super::types::TextToken;
use super::ExtractionError;

const RTF_CHAR_WIDTH: f32 = 6.0;
const RTF_LINE_HEIGHT: f32 = 12.0;
const TAB_STOP: usize = 8;

/// Destination groups whose content is never document text.
const SKIPPED_DESTINATIONS: &[&str] = &[
    "fonttbl",
    "colortbl",
    "stylesheet",
    "info",
    "pict",
    "header",
    "headerl",
    "headerr",
    "footer",
    "footerl",
    "footerr",
    "listtable",
    "listoverridetable",
    "rsidtbl",
    "generator",
    "xmlnstbl",
    "themedata",
    "colorschememapping",
    "latentstyles",
    "datastore",
    "fldinst",
    "object",
];

/// Tokenise RTF markup.
pub fn extract_tokens(markup: &str) -> Result<Vec<TextToken>, ExtractionError> {
    let text = rtf_to_text(markup)?;
    Ok(text
        .lines()
        .enumerate()
        .flat_map(|(line_no, line)| line_tokens(line, line_no))
        .collect())
}

/// Render RTF markup to plain text with `\n` line breaks and `\t` tabs.
pub fn rtf_to_text(markup: &str) -> Result<String, ExtractionError> {
    let body = markup.trim_start_matches(|c: char| c.is_whitespace() || c == '\u{FEFF}');
    if !body.starts_with("{\\rtf") {
        return Err(ExtractionError::RtfParsing("missing {\\rtf header".into()));
    }

    let chars: Vec<char> = body.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(len / 2);
    let mut group_stack: Vec<bool> = Vec::new();
    let mut skipping = false;
    let mut unicode_fallback = 1usize;
    let mut pending_fallback = 0usize;
    let mut i = 0;

    while i < len {
        let c = chars[i];
        match c {
            '{' => {
                group_stack.push(skipping);
                i += 1;
            }
            '}' => {
                // Unbalanced closing braces are tolerated.
                skipping = group_stack.pop().unwrap_or(false);
                i += 1;
            }
            '\\' => {
                i += 1;
                let Some(&next) = chars.get(i) else { break };

                if next.is_ascii_alphabetic() {
                    let word_start = i;
                    while i < len && chars[i].is_ascii_alphabetic() {
                        i += 1;
                    }
                    let word: String = chars[word_start..i].iter().collect();

                    let param_start = i;
                    if i < len && (chars[i] == '-' || chars[i].is_ascii_digit()) {
                        i += 1;
                        while i < len && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                    let param: Option<i32> = if i > param_start {
                        chars[param_start..i].iter().collect::<String>().parse().ok()
                    } else {
                        None
                    };
                    if i < len && chars[i] == ' ' {
                        i += 1;
                    }

                    if SKIPPED_DESTINATIONS.contains(&word.as_str()) {
                        skipping = true;
                        continue;
                    }
                    if skipping {
                        continue;
                    }

                    match word.as_str() {
                        "par" | "line" | "row" | "sect" | "page" => out.push('\n'),
                        "tab" | "cell" => out.push('\t'),
                        "uc" => unicode_fallback = param.unwrap_or(1).max(0) as usize,
                        "u" => {
                            if let Some(code) = param {
                                let code = if code < 0 { code + 65536 } else { code };
                                if let Some(ch) = char::from_u32(code as u32) {
                                    out.push(ch);
                                }
                                pending_fallback = unicode_fallback;
                            }
                        }
                        "emdash" | "endash" => out.push('-'),
                        "lquote" | "rquote" => out.push('\''),
                        "ldblquote" | "rdblquote" => out.push('"'),
                        "bullet" => out.push('•'),
                        _ => {}
                    }
                } else {
                    i += 1;
                    match next {
                        '*' => skipping = true,
                        '\'' => {
                            let hex: String = chars[i..len.min(i + 2)].iter().collect();
                            i = len.min(i + 2);
                            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                                push_text(&mut out, cp1252_to_char(byte), skipping, &mut pending_fallback);
                            }
                        }
                        '\\' | '{' | '}' => push_text(&mut out, next, skipping, &mut pending_fallback),
                        '~' => push_text(&mut out, ' ', skipping, &mut pending_fallback),
                        '_' => push_text(&mut out, '-', skipping, &mut pending_fallback),
                        '\n' | '\r' if !skipping => out.push('\n'),
                        _ => {}
                    }
                }
            }
            '\r' | '\n' => i += 1,
            _ => {
                push_text(&mut out, c, skipping, &mut pending_fallback);
                i += 1;
            }
        }
    }

    Ok(out)
}

fn push_text(out: &mut String, c: char, skipping: bool, pending_fallback: &mut usize) {
    if skipping {
        return;
    }
    if *pending_fallback > 0 {
        *pending_fallback -= 1;
        return;
    }
    out.push(c);
}

/// Windows-1252 byte to char. Only 0x80-0x9F differ from Latin-1.
fn cp1252_to_char(byte: u8) -> char {
    match byte {
        0x80 => '€',
        0x85 => '…',
        0x91 => '\u{2018}',
        0x92 => '\u{2019}',
        0x93 => '\u{201C}',
        0x94 => '\u{201D}',
        0x95 => '•',
        0x96 => '-',
        0x97 => '-',
        0xA0 => ' ',
        other => char::from(other),
    }
}

/// Split one rendered line into tokens at tabs and runs of 2+ spaces.
/// A `Label: value` run is split after its colon.
fn line_tokens(line: &str, line_no: usize) -> Vec<TextToken> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut column = 0usize;
    let mut start_column = 0usize;
    let mut spaces = 0usize;
    let y = line_no as f32 * RTF_LINE_HEIGHT;

    let mut flush = |current: &mut String, start_column: usize| {
        let text = sanitize_token_text(current);
        if !text.is_empty() {
            let token = TextToken::new(text, start_column as f32 * RTF_CHAR_WIDTH, y, 1);
            match token.split_inline_label(RTF_CHAR_WIDTH) {
                Some((label, value)) => tokens.extend([label, value]),
                None => tokens.push(token),
            }
        }
        current.clear();
    };

    for c in line.chars() {
        match c {
            '\t' => {
                flush(&mut current, start_column);
                column = (column / TAB_STOP + 1) * TAB_STOP;
                spaces = 0;
            }
            ' ' => {
                spaces += 1;
                column += 1;
                if spaces == 2 {
                    flush(&mut current, start_column);
                }
            }
            _ => {
                if current.is_empty() {
                    start_column = column;
                } else if spaces == 1 {
                    current.push(' ');
                }
                current.push(c);
                spaces = 0;
                column += 1;
            }
        }
    }
    flush(&mut current, start_column);

    tokens
}
