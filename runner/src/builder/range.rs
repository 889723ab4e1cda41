//! Index list syntax shared by exclusions and dependency selectors: `[0:3],5`.
//! Ranges are inclusive on both ends.

use crate::config::ConfigErrors;
use std::collections::BTreeSet;

pub fn parse_indices(expr: &str) -> Result<BTreeSet<u32>, ConfigErrors> {
    let invalid = || ConfigErrors::InvalidRange(expr.to_owned());
    let mut indices = BTreeSet::new();

    for part in split_top_level(expr).map_err(|_| invalid())? {
        let part = part.trim();
        let inner = part
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(part)
            .trim();

        if inner.is_empty() {
            return Err(invalid());
        }

        match inner.split_once(':') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().map_err(|_| invalid())?;
                let end: u32 = end.trim().parse().map_err(|_| invalid())?;

                if start > end {
                    return Err(invalid());
                }

                indices.extend(start..=end);
            }
            None => {
                // a bracketed list like `[1,3]` was split already, so this is a single index
                indices.insert(inner.parse().map_err(|_| invalid())?);
            }
        }
    }

    Ok(indices)
}

/// Split on commas outside brackets so `[0:2],4` yields `[0:2]` and `4` while
/// `[1,3]` is flattened into `1` and `3`
fn split_top_level(expr: &str) -> Result<Vec<String>, ()> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in expr.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.checked_sub(1).ok_or(())?;
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            ',' => {
                // inside brackets: close the current element and reopen
                current.push(']');
                parts.push(std::mem::take(&mut current));
                current.push('[');
            }
            c => current.push(c),
        }
    }

    if depth != 0 {
        return Err(());
    }

    parts.push(current);

    Ok(parts)
}

/// Which coordinates of a parent a dependency reaches along one axis
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selector {
    /// the child's own coordinate
    #[default]
    Natural,
    All,
    Indices(BTreeSet<u32>),
}

impl Selector {
    pub fn parse(expr: &str) -> Result<Self, ConfigErrors> {
        match expr.trim().to_ascii_lowercase().as_str() {
            "" | "natural" => Ok(Self::Natural),
            "all" | "any" => Ok(Self::All),
            _ => parse_indices(expr).map(Self::Indices),
        }
    }

    pub fn parse_optional(expr: Option<&String>) -> Result<Self, ConfigErrors> {
        expr.map_or(Ok(Self::Natural), |expr| Self::parse(expr))
    }
}
