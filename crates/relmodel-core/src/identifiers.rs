//! Identifier validation for model names.
//!
//! Entity, class, property and navigation names must be plain identifiers so
//! that derived names (owned entity types, shadow foreign keys) stay
//! unambiguous: `Parent.Child1#Child` can only be produced by the builder.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, ModelErrorKind, Result};

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn identifier_regex() -> std::result::Result<&'static Regex, &'static regex::Error> {
    static REGEX: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(IDENTIFIER_PATTERN)).as_ref()
}

/// Check whether `name` is a plain identifier.
pub fn is_identifier(name: &str) -> bool {
    identifier_regex().is_ok_and(|re| re.is_match(name))
}

/// Validate a model name, naming what it is in the error.
pub fn validate_identifier(what: &str, name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(Error::model(
            ModelErrorKind::InvalidName,
            format!("{what} name '{name}' must match {IDENTIFIER_PATTERN}"),
        ))
    }
}

/// Name of an owned entity type reached through `navigation` on `owner`.
pub fn owned_type_name(owner: &str, navigation: &str, class: &str) -> String {
    format!("{owner}.{navigation}#{class}")
}
