//! Module Specifier Resolution
//!
//! Canonical module identity is the absolute URL a specifier resolves to.

use url::Url;

/// Resolve `specifier` against `base`
///
/// Absolute specifiers ignore the base. Relative ones need one.
pub fn resolve(specifier: &str, base: Option<&Url>) -> Result<Url, url::ParseError> {
    match base {
        Some(base) => base.join(specifier),
        None => Url::parse(specifier),
    }
}

/// Parse an absolute URL string, as stored for module records and scripts
pub fn parse_base(base: &str) -> Option<Url> {
    Url::parse(base).ok()
}
