//! Splits a model reply into free-form reasoning and the JSON decision array.

use decision_engine::ProposedIntent;

use crate::error::{ProposalError, ProposalResult};

#[derive(Debug, Clone)]
pub struct ParsedReply {
    pub rationale: String,
    pub intents: Vec<ProposedIntent>,
}

/// Replace typographic quotes that models like to emit inside JSON.
pub fn normalize_quotes(text: &str) -> String {
    text.replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

/// Text before the first `[`, trimmed. The whole reply when there is none.
pub fn extract_rationale(text: &str) -> String {
    match text.find('[') {
        Some(idx) => clean_rationale(&text[..idx]),
        None => clean_rationale(text),
    }
}

fn clean_rationale(text: &str) -> String {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_suffix("```json")
        .or_else(|| trimmed.strip_suffix("```"))
        .unwrap_or(trimmed);
    trimmed.trim().to_string()
}

/// End index (exclusive) of the bracketed block starting at `start`, if balanced.
/// Brackets inside JSON strings are ignored.
fn matching_bracket(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Locate and decode the decision array.
///
/// Tries each `[` in turn so that bracketed words in the reasoning (e.g.
/// "[BTC]") do not hide the real array. An empty array is a valid reply.
pub fn parse_reply(reply: &str) -> ProposalResult<ParsedReply> {
    let text = normalize_quotes(reply);
    let mut last_error = None;

    for (start, _) in text.match_indices('[') {
        let Some(end) = matching_bracket(&text, start) else {
            continue;
        };
        match serde_json::from_str::<Vec<ProposedIntent>>(&text[start..end]) {
            Ok(intents) => {
                return Ok(ParsedReply {
                    rationale: clean_rationale(&text[..start]),
                    intents,
                });
            }
            Err(e) => last_error = Some(e),
        }
    }

    let message = match last_error {
        Some(e) => format!("decision array is not valid JSON: {e}"),
        None => "no JSON decision array found in reply".to_string(),
    };
    Err(ProposalError::Parse {
        message,
        rationale: extract_rationale(&text),
    })
}
