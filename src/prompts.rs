// prompts.rs - Prompt set used by the pipeline stages
//
// Each prompt has a built-in default and can be replaced by a text file named
// in digestconf.txt.

use crate::error::{DigestError, DigestResult};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;

static LIST_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[-*•]+|\d+[.)])\s*").expect("list marker pattern is valid")
});

pub const DEFAULT_ATTACHMENT_PROMPT: &str = "Describe this image from a group chat in two or three sentences. \
Mention any visible text, people, places or objects that could matter to the conversation.";

pub const DEFAULT_LINK_PROMPT: &str = "Summarize the following web page in a short paragraph. \
Focus on the facts a group chat member would want to know.";

pub const DEFAULT_THEME_PROMPT: &str = "List the recurring discussion themes in the following group chat messages. \
Write one short theme label per line, without numbering or commentary.";

pub const DEFAULT_SUMMARY_PROMPT: &str = "Write a concise summary of the following group chat. \
Organize it by the discussion themes provided, highlight decisions, plans and open questions.";

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSet {
    pub attachment: String,
    pub link: String,
    pub theme: String,
    pub summary: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            attachment: DEFAULT_ATTACHMENT_PROMPT.to_string(),
            link: DEFAULT_LINK_PROMPT.to_string(),
            theme: DEFAULT_THEME_PROMPT.to_string(),
            summary: DEFAULT_SUMMARY_PROMPT.to_string(),
        }
    }
}

/// Reads a prompt override file, or falls back to `default` when no file is configured.
pub fn load_prompt(path: Option<&Path>, default: &str) -> DigestResult<String> {
    let Some(path) = path else {
        return Ok(default.to_string());
    };
    let content = fs::read_to_string(path)
        .map_err(|e| DigestError::Config(format!("cannot read prompt file {}: {}", path.display(), e)))?;
    // Remove BOM if present
    let content = content.strip_prefix('\u{feff}').unwrap_or(&content).trim().to_string();
    if content.is_empty() {
        return Err(DigestError::Config(format!("prompt file {} is empty", path.display())));
    }
    debug!("📄 Prompt loaded from: {}", path.display());
    Ok(content)
}

pub fn link_summary_prompt(prompts: &PromptSet, url: &str, page_text: &str) -> String {
    format!("{}\n\nURL: {}\n\n{}", prompts.link, url, page_text)
}

pub fn theme_prompt(prompts: &PromptSet, transcript: &str) -> String {
    format!("{}\n\nMESSAGES:\n{}", prompts.theme, transcript)
}

pub fn summary_prompt(prompts: &PromptSet, group_name: &str, theme_outline: &str, transcript: &str) -> String {
    format!(
        "{}\n\nGROUP: {}\n\nTHEMES:\n{}\n\nMESSAGES:\n{}",
        prompts.summary, group_name, theme_outline, transcript
    )
}

/// One theme per line; bullets, numbering, blanks and repeats are dropped.
pub fn parse_themes(response: &str) -> Vec<String> {
    let mut themes: Vec<String> = Vec::new();
    for line in response.lines() {
        let stripped = LIST_MARKER.replace(line, "");
        let theme = stripped.trim().trim_matches('"').trim();
        if theme.is_empty() {
            continue;
        }
        if !themes.iter().any(|t| t.eq_ignore_ascii_case(theme)) {
            themes.push(theme.to_string());
        }
    }
    themes
}
