//! Parsing for Gentoo `category/package-version` (CPV) strings.

use std::fmt;

/// A CPV string didn't match `category/package-version`.
#[derive(Debug, thiserror::Error)]
pub struct CpvError(pub String);

impl fmt::Display for CpvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a valid cpv: {:?}", self.0)
    }
}

/// Split a CPV into `(category, package, version)`.
///
/// Equivalent to the original's `CPV_RE = r"(.*)/(.*)-([0-9].*)"`: category is
/// everything before the first `/`; package/version is split at the last `-`
/// that's immediately followed by a digit.
pub fn split_cpv(cpv: &str) -> Result<(String, String, String), CpvError> {
    let (category, rest) = cpv.split_once('/').ok_or_else(|| CpvError(cpv.to_string()))?;
    if category.is_empty() || rest.is_empty() {
        return Err(CpvError(cpv.to_string()));
    }

    let split_at = rest
        .char_indices()
        .filter(|&(i, c)| c == '-' && rest[i + 1..].chars().next().is_some_and(|d| d.is_ascii_digit()))
        .next_back()
        .map(|(i, _)| i)
        .ok_or_else(|| CpvError(cpv.to_string()))?;

    let (package, version) = (&rest[..split_at], &rest[split_at + 1..]);
    if package.is_empty() || version.is_empty() {
        return Err(CpvError(cpv.to_string()));
    }
    Ok((category.to_string(), package.to_string(), version.to_string()))
}
