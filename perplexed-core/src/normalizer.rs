use unicode_normalization::UnicodeNormalization;

use crate::error::{CoreResult, SearchError};

/// Message the search service itself returns for a blank prompt.
pub const EMPTY_PROMPT_MESSAGE: &str = "Please provide a user prompt.";

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Clean a prompt before it is submitted. Blank prompts never reach the wire.
pub fn normalize_prompt(prompt: &str) -> CoreResult<String> {
    let cleaned = clean_text(prompt);
    if cleaned.is_empty() {
        return Err(SearchError::Validation(EMPTY_PROMPT_MESSAGE.into()));
    }
    Ok(cleaned)
}
