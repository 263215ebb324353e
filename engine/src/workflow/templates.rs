//! `{{placeholder}}` substitution for template bodies and file names

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("Invalid placeholder pattern")
    })
}

/// Variables available to templates, keyed by dotted name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    vars: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn extend<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.vars.extend(vars);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Replace known placeholders; unknown ones are left as written
    pub fn render(&self, text: &str) -> String {
        placeholder()
            .replace_all(text, |caps: &Captures| match self.vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_known_and_unknown() {
        let vars = TemplateVars::new()
            .with("user.name", "Ada")
            .with("company", "Analytical Engines");

        assert_eq!(
            vars.render("Dear {{ company }}, from {{user.name}} {{user.phone}}"),
            "Dear Analytical Engines, from Ada {{user.phone}}"
        );
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let vars = TemplateVars::new().with("a", "{{b}}").with("b", "x");
        assert_eq!(vars.render("{{a}}"), "{{b}}");
    }
}
