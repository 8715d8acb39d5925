use lopdf::content::Content;
use lopdf::{Document, Object, ObjectId};

use super::sanitize::sanitize_token_text;
use super::types::TextToken;
use super::ExtractionError;

/// US Letter height, used when a page carries no usable MediaBox.
const DEFAULT_PAGE_HEIGHT: f32 = 792.0;

/// Glyph advance estimate as a fraction of the font size.
/// Only used to decide whether consecutive show operators belong together.
const AVERAGE_GLYPH_WIDTH: f32 = 0.5;

/// TJ adjustments (thousandths of an em) more negative than this render as a space.
const TJ_SPACE_THRESHOLD: f32 = -250.0;

/// Extract positioned tokens from every page of a PDF.
///
/// Each text-showing operator becomes a token at the current text position.
/// Runs that continue on the same baseline with no visible gap are merged so
/// a label split across several `Tj` operators stays one token.
pub fn extract_tokens(pdf_bytes: &[u8]) -> Result<Vec<TextToken>, ExtractionError> {
    let doc = Document::load_mem(pdf_bytes)
        .map_err(|e| ExtractionError::PdfParsing(e.to_string()))?;

    let mut tokens = Vec::new();
    for (page_number, page_id) in doc.get_pages() {
        match page_tokens(&doc, page_id, page_number as usize) {
            Ok(page) => tokens.extend(page),
            Err(e) => {
                tracing::warn!(page = page_number, error = %e, "Skipping undecodable PDF page");
            }
        }
    }
    Ok(tokens)
}

fn page_tokens(
    doc: &Document,
    page_id: ObjectId,
    page_number: usize,
) -> Result<Vec<TextToken>, ExtractionError> {
    let data = doc
        .get_page_content(page_id)
        .map_err(|e| ExtractionError::PdfParsing(e.to_string()))?;
    let content =
        Content::decode(&data).map_err(|e| ExtractionError::PdfParsing(e.to_string()))?;

    let mut state = TextState::new(page_height(doc, page_id), page_number);
    for op in &content.operations {
        let operands = &op.operands;
        match op.operator.as_str() {
            "BT" => state.begin_text(),
            "Tf" => {
                if let Some(size) = operands.get(1).and_then(number) {
                    state.font_size = size;
                }
            }
            "TL" => {
                if let Some(leading) = operands.first().and_then(number) {
                    state.leading = leading;
                }
            }
            "Td" => {
                if let (Some(tx), Some(ty)) = (operand(operands, 0), operand(operands, 1)) {
                    state.move_line(tx, ty);
                }
            }
            "TD" => {
                if let (Some(tx), Some(ty)) = (operand(operands, 0), operand(operands, 1)) {
                    state.leading = -ty;
                    state.move_line(tx, ty);
                }
            }
            "Tm" => {
                let m: Vec<f32> = operands.iter().filter_map(number).collect();
                if m.len() == 6 {
                    state.set_matrix(m[0], m[3], m[4], m[5]);
                }
            }
            "T*" => state.next_line(),
            "Tj" => {
                if let Some(text) = operands.first().and_then(string) {
                    state.show(&text);
                }
            }
            "'" => {
                state.next_line();
                if let Some(text) = operands.first().and_then(string) {
                    state.show(&text);
                }
            }
            "\"" => {
                state.next_line();
                if let Some(text) = operands.get(2).and_then(string) {
                    state.show(&text);
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = operands.first() {
                    let mut text = String::new();
                    for item in items {
                        if let Some(s) = string(item) {
                            text.push_str(&s);
                        } else if let Some(adjust) = number(item) {
                            if adjust < TJ_SPACE_THRESHOLD && !text.ends_with(' ') {
                                text.push(' ');
                            }
                        }
                    }
                    state.show(&text);
                }
            }
            _ => {}
        }
    }

    Ok(state.tokens)
}

/// Text position tracking for the subset of the PDF text model we need:
/// translation plus axis scale, no rotation or skew.
struct TextState {
    page_height: f32,
    page: usize,
    font_size: f32,
    leading: f32,
    scale_x: f32,
    scale_y: f32,
    line_x: f32,
    line_y: f32,
    x: f32,
    y: f32,
    tokens: Vec<TextToken>,
    /// Estimated x where the last token ends, on the same baseline.
    last_end: Option<(f32, f32)>,
    trailing_space: bool,
}

impl TextState {
    fn new(page_height: f32, page: usize) -> Self {
        Self {
            page_height,
            page,
            font_size: 12.0,
            leading: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            line_x: 0.0,
            line_y: 0.0,
            x: 0.0,
            y: 0.0,
            tokens: Vec::new(),
            last_end: None,
            trailing_space: false,
        }
    }

    fn begin_text(&mut self) {
        self.scale_x = 1.0;
        self.scale_y = 1.0;
        self.line_x = 0.0;
        self.line_y = 0.0;
        self.x = 0.0;
        self.y = 0.0;
        self.last_end = None;
    }

    fn set_matrix(&mut self, a: f32, d: f32, e: f32, f: f32) {
        self.scale_x = if a == 0.0 { 1.0 } else { a };
        self.scale_y = if d == 0.0 { 1.0 } else { d };
        self.line_x = e;
        self.line_y = f;
        self.x = e;
        self.y = f;
    }

    fn move_line(&mut self, tx: f32, ty: f32) {
        self.line_x += tx * self.scale_x;
        self.line_y += ty * self.scale_y;
        self.x = self.line_x;
        self.y = self.line_y;
    }

    fn next_line(&mut self) {
        self.move_line(0.0, -self.leading);
    }

    fn show(&mut self, raw: &str) {
        let text = sanitize_token_text(raw);
        let em = self.font_size * self.scale_x.abs();
        let advance = raw.chars().count() as f32 * em * AVERAGE_GLYPH_WIDTH;
        if text.is_empty() {
            self.x += advance;
            return;
        }

        let top_y = self.page_height - self.y;
        if let (Some((end_x, end_y)), Some(last)) = (self.last_end, self.tokens.last_mut()) {
            let gap = self.x - end_x;
            let same_baseline = (end_y - top_y).abs() < 0.5;
            // A finished label never absorbs its value.
            let open_label = last.text.ends_with(':');
            if same_baseline && !open_label && gap > -em * 0.5 && gap < em * 0.6 {
                if gap > em * 0.15 || self.trailing_space || raw.starts_with(' ') {
                    last.text.push(' ');
                }
                last.text.push_str(&text);
                self.split_last_label(em * AVERAGE_GLYPH_WIDTH);
                self.x += advance;
                self.last_end = Some((self.x, top_y));
                self.trailing_space = raw.ends_with(' ');
                return;
            }
        }

        self.tokens
            .push(TextToken::new(text, self.x, top_y, self.page));
        self.split_last_label(em * AVERAGE_GLYPH_WIDTH);
        self.x += advance;
        self.last_end = Some((self.x, top_y));
        self.trailing_space = raw.ends_with(' ');
    }

    /// `Label: value` shown in one run becomes two tokens.
    fn split_last_label(&mut self, char_advance: f32) {
        let Some(split) = self.tokens.last().and_then(|t| t.split_inline_label(char_advance))
        else {
            return;
        };
        self.tokens.pop();
        self.tokens.extend([split.0, split.1]);
    }
}

/// Page-tree levels searched for an inherited MediaBox.
const MAX_PAGE_TREE_DEPTH: usize = 32;

/// MediaBox height of the page, inherited from ancestor `Pages` nodes when
/// the page itself has none.
fn page_height(doc: &Document, page_id: ObjectId) -> f32 {
    let mut node = doc.get_dictionary(page_id).ok();
    for _ in 0..MAX_PAGE_TREE_DEPTH {
        let Some(dict) = node else {
            break;
        };
        if let Some(height) = dict.get(b"MediaBox").ok().and_then(|obj| box_height(doc, obj)) {
            return height;
        }
        node = dict
            .get(b"Parent")
            .and_then(|parent| parent.as_reference())
            .and_then(|id| doc.get_dictionary(id))
            .ok();
    }
    DEFAULT_PAGE_HEIGHT
}

fn box_height(doc: &Document, obj: &Object) -> Option<f32> {
    let obj = match obj {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    let coords: Vec<f32> = obj.as_array().ok()?.iter().filter_map(number).collect();
    match coords.as_slice() {
        [_, y0, _, y1] => Some((y1 - y0).abs()),
        _ => None,
    }
}

fn operand(operands: &[Object], index: usize) -> Option<f32> {
    operands.get(index).and_then(number)
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

/// Decode a PDF string operand: UTF-16BE when BOM-prefixed, else Latin-1.
fn string(obj: &Object) -> Option<String> {
    let Object::String(bytes, _) = obj else {
        return None;
    };
    if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return Some(String::from_utf16_lossy(&units));
    }
    Some(bytes.iter().map(|&b| char::from(b)).collect())
}
