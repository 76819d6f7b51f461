//! Tool result envelopes and body formatting.

use std::fmt::Write as _;

use rust_mcp_sdk::schema::{CallToolResult, ContentBlock, TextContent};
use serde::Serialize;

use super::errors::ToolError;

/// Tool results go over the wire as the SDK's `CallToolResult`.
pub type ToolResult = CallToolResult;

pub fn text_block(text: impl Into<String>) -> ContentBlock {
    TextContent::from(text.into()).into()
}

pub fn text_result(text: impl Into<String>) -> ToolResult {
    CallToolResult::text_content(vec![TextContent::from(text.into())])
}

pub fn error_result(text: impl Into<String>) -> ToolResult {
    let mut result = text_result(text);
    result.is_error = Some(true);
    result
}

pub fn is_failure(result: &ToolResult) -> bool {
    result.is_error == Some(true)
}

/// Text of every text block, in order.
pub fn texts(result: &ToolResult) -> impl Iterator<Item = &str> {
    result.content.iter().filter_map(|block| match block {
        ContentBlock::TextContent(text) => Some(text.text.as_str()),
        _ => None,
    })
}

pub fn first_text(result: &ToolResult) -> &str {
    texts(result).next().unwrap_or_default()
}

pub fn joined_text(result: &ToolResult) -> String {
    texts(result).collect::<Vec<_>>().join("\n")
}

/// Rewrites the text of every text block in place.
pub fn map_texts(result: &mut ToolResult, mut f: impl FnMut(&str) -> String) {
    for block in &mut result.content {
        if let ContentBlock::TextContent(text) = block {
            text.text = f(&text.text);
        }
    }
}

pub type ToolOutcome = Result<ToolResult, ToolError>;

/// Summary line followed by the compact JSON body.
pub fn json_response<T: Serialize>(summary: &str, value: &T) -> ToolOutcome {
    let body = serde_json::to_string(value).map_err(|e| {
        ToolError::new(
            super::errors::ErrorCode::MarshalFailed,
            format!("Failed to serialize response: {e}"),
            "Internal serialization error. Do not retry",
        )
    })?;
    Ok(text_result(format!("{summary}\n{body}")))
}

/// Like [`json_response`] but flagged as a failure.
pub fn json_failure<T: Serialize>(summary: &str, value: &T) -> ToolOutcome {
    let mut result = json_response(summary, value)?;
    result.is_error = Some(true);
    Ok(result)
}

pub fn markdown_response(summary: &str, markdown: &str) -> ToolOutcome {
    Ok(text_result(format!("{summary}\n\n{markdown}")))
}

/// Renders a Markdown table. Pipes and newlines in cells are escaped.
pub fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "| {} |", headers.join(" | "));
    let _ = writeln!(
        out,
        "|{}|",
        headers.iter().map(|_| " --- ").collect::<Vec<_>>().join("|")
    );
    for row in rows {
        let cells: Vec<String> = row.iter().map(|c| escape_cell(c)).collect();
        let _ = writeln!(out, "| {} |", cells.join(" | "));
    }
    out.trim_end().to_string()
}

fn escape_cell(cell: &str) -> String {
    cell.replace('|', "\\|").replace('\n', " ")
}

/// Shortens `s` to at most `max` chars, marking the cut with an ellipsis.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
