//! Parser for the rsync-style `binpkgs/Packages` index: key/value sections
//! separated by blank lines. The first (preamble) section is discarded.

use gbp_types::Package;

#[derive(Debug, thiserror::Error)]
#[error("malformed Packages entry: missing {0}")]
pub struct ParseError(pub &'static str);

const REQUIRED_KEYS: [&str; 6] = ["CPV", "REPO", "PATH", "BUILD_ID", "SIZE", "BUILD_TIME"];

/// Split `content` into blank-line-separated sections, then parse every
/// section after the first as a [`Package`].
pub fn parse_packages_index(content: &str) -> Result<Vec<Package>, ParseError> {
    let sections = get_sections(content);
    let mut packages = Vec::new();
    for section in sections.into_iter().skip(1) {
        if section.trim().is_empty() {
            continue;
        }
        packages.push(parse_section(&section)?);
    }
    Ok(packages)
}

/// Split on blank lines (`until_blank` repeated over the whole input).
fn get_sections(content: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        sections.push(current);
    }
    sections
}

fn parse_section(section: &str) -> Result<Package, ParseError> {
    let mut fields = std::collections::HashMap::new();
    for line in section.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim().to_ascii_uppercase(), value.trim().to_string());
        }
    }

    let get = |key: &'static str| fields.get(key).cloned().ok_or(ParseError(key));

    Ok(Package {
        cpv: get("CPV")?,
        repo: get("REPO")?,
        path: get("PATH")?,
        build_id: get("BUILD_ID")?.parse().map_err(|_| ParseError("BUILD_ID"))?,
        size: get("SIZE")?.parse().map_err(|_| ParseError("SIZE"))?,
        build_time: get("BUILD_TIME")?.parse().map_err(|_| ParseError("BUILD_TIME"))?,
    })
}
