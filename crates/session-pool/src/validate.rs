//! Query validation
//!
//! Stateless checks run once per query before any member is touched.
//! Stateful checks (model choice, account capabilities) run per member,
//! because the answer depends on whether the member owns an account.

use session::{Attachment, Mode};

/// Longest accepted query, in characters, after trimming.
pub const MAX_QUERY_CHARS: usize = 10_000;

pub const SUPPORTED_LANGUAGES: &[&str] =
    &["en-US", "en-GB", "pt-BR", "es-ES", "fr-FR", "de-DE", "zh-CN"];

pub const SUPPORTED_SOURCES: &[&str] = &["web", "scholar", "social"];

pub const DEFAULT_SOURCE: &str = "web";
pub const DEFAULT_LANGUAGE: &str = "en-US";

/// User-facing validation failure. The message is surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

type Result<T> = std::result::Result<T, ValidationError>;

/// Trim and bound the query text.
pub fn sanitize_query(query: &str) -> Result<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(ValidationError("Query cannot be empty".into()));
    }
    if trimmed.chars().count() > MAX_QUERY_CHARS {
        return Err(ValidationError(format!(
            "Query is too long (max {MAX_QUERY_CHARS} characters)"
        )));
    }
    Ok(trimmed.to_string())
}

pub fn validate_language(language: &str) -> Result<()> {
    if SUPPORTED_LANGUAGES.contains(&language) {
        Ok(())
    } else {
        Err(ValidationError(format!(
            "Invalid language '{language}'. Choose from: {}",
            SUPPORTED_LANGUAGES.join(", ")
        )))
    }
}

pub fn validate_sources(sources: &[String]) -> Result<()> {
    if sources.is_empty() {
        return Err(ValidationError("At least one source must be specified".into()));
    }
    let invalid: Vec<&str> = sources
        .iter()
        .map(String::as_str)
        .filter(|s| !SUPPORTED_SOURCES.contains(s))
        .collect();
    if !invalid.is_empty() {
        return Err(ValidationError(format!(
            "Invalid sources: {}. Valid sources: {}",
            invalid.join(", "),
            SUPPORTED_SOURCES.join(", ")
        )));
    }
    Ok(())
}

pub fn validate_attachments(attachments: &[Attachment]) -> Result<()> {
    if attachments.iter().any(|a| a.filename.trim().is_empty()) {
        return Err(ValidationError("Filename cannot be empty".into()));
    }
    Ok(())
}

/// Named models selectable in each mode. An empty list means only the
/// upstream default is available.
pub fn models_for(mode: Mode) -> &'static [&'static str] {
    match mode {
        Mode::Auto | Mode::DeepResearch => &[],
        Mode::Pro => &["sonar", "gpt-5.2", "claude-4.5-sonnet", "grok-4.1"],
        Mode::Reasoning => &[
            "gpt-5.2-thinking",
            "claude-4.5-sonnet-thinking",
            "gemini-3.0-pro",
            "kimi-k2-thinking",
            "grok-4.1-reasoning",
        ],
    }
}

/// Model must exist for the mode, and picking one requires an account.
pub fn validate_model(mode: Mode, model: Option<&str>, owns_account: bool) -> Result<()> {
    let Some(model) = model else {
        return Ok(());
    };
    let valid = models_for(mode);
    if !valid.contains(&model) {
        let listed = if valid.is_empty() {
            "default only".to_string()
        } else {
            valid.join(", ")
        };
        return Err(ValidationError(format!(
            "Invalid model '{model}' for mode '{mode}'. Valid models: {listed}"
        )));
    }
    if !owns_account {
        return Err(ValidationError(
            "Model selection requires an account with cookies".into(),
        ));
    }
    Ok(())
}

/// Sessions without an account have no metered queries and no uploads.
///
/// Both messages match the limit vocabulary, so the cascade treats them as
/// this member's problem rather than the caller's.
pub fn validate_limits(owns_account: bool, mode: Mode, attachment_count: usize) -> Result<()> {
    if owns_account {
        return Ok(());
    }
    if mode.is_metered() {
        return Err(ValidationError(format!(
            "No remaining enhanced queries for mode '{mode}'. Create a new account or use mode='auto'."
        )));
    }
    if attachment_count > 0 {
        return Err(ValidationError(format!(
            "Insufficient file uploads. Requested: {attachment_count}, Available: 0"
        )));
    }
    Ok(())
}
