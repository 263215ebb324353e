//! Collection id generation
//!
//! An id is the sanitized identity fields followed by a date suffix:
//!
//! ```text
//! ("Google Inc", "Software Engineer") on 2025-07-30
//!     => google_inc_software_engineer_20250730
//! ```
//!
//! Sanitization lowercases, turns every run of non-alphanumeric characters
//! into one separator and drops separators at either end. When the result is
//! longer than `max_length`, only the part before the date is shortened; the
//! date suffix always survives intact.

use sdk::errors::{EngineError, Result};

use super::clock::GenerationContext;
use crate::config::CollectionIdConfig;

/// Lowercase `text` and collapse non-alphanumeric runs into `separator`
pub fn sanitize(text: &str, separator: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut gap = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if gap && !out.is_empty() {
                out.push_str(separator);
            }
            gap = false;
            out.extend(c.to_lowercase());
        } else {
            gap = true;
        }
    }
    out
}

/// Build the id for `fields` using the date from `ctx`
pub fn generate_collection_id(
    fields: &[&str],
    rules: &CollectionIdConfig,
    ctx: &GenerationContext,
) -> Result<String> {
    let separator = rules.sanitize_spaces.as_str();
    let base = sanitize(&fields.join(" "), separator);
    if base.is_empty() {
        return Err(EngineError::Validation(
            "identity fields contain no letters or digits".to_string(),
        ));
    }

    let date = rules.render_date(ctx.now())?;
    let suffix_len = separator.chars().count() + date.chars().count();
    let budget = rules.max_length.saturating_sub(suffix_len);
    if budget == 0 {
        return Err(EngineError::Config(format!(
            "collection_id.max_length {} leaves no room before the date suffix",
            rules.max_length
        )));
    }

    let mut base: String = base.chars().take(budget).collect();
    if !separator.is_empty() {
        while base.ends_with(separator) {
            base.truncate(base.len() - separator.len());
        }
    }

    Ok(format!("{}{}{}", base, separator, date))
}
