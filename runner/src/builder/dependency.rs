use super::range::Selector;
use crate::config::{ConfigErrors, DependencyFilter};

/// `SECTION`, `SECTION-N` or `SECTION+N`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyExpr {
    pub section: String,
    /// negative reaches back along the parent's running axis, positive forward
    pub offset: i64,
}

impl DependencyExpr {
    pub fn parse(expr: &str) -> Result<Self, ConfigErrors> {
        let expr = expr.trim();
        let invalid = || ConfigErrors::InvalidDependency(expr.to_owned());

        if expr.is_empty() || expr.contains(char::is_whitespace) {
            return Err(invalid());
        }

        if let Some(position) = expr.rfind(&['-', '+'][..]) {
            let (section, suffix) = expr.split_at(position);
            let digits = &suffix[1..];

            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                if section.is_empty() {
                    return Err(invalid());
                }

                let amount: i64 = digits.parse().map_err(|_| invalid())?;

                return Ok(Self {
                    section: section.to_owned(),
                    offset: if suffix.starts_with('-') { -amount } else { amount },
                });
            }
        }

        Ok(Self {
            section: expr.to_owned(),
            offset: 0,
        })
    }
}

/// A parsed dependency entry of a section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub expr: DependencyExpr,
    pub dates: Selector,
    pub members: Selector,
    pub chunks: Selector,
    pub splits: Selector,
}

impl Dependency {
    pub fn new(expr: &str, filter: &DependencyFilter) -> Result<Self, ConfigErrors> {
        Ok(Self {
            expr: DependencyExpr::parse(expr)?,
            dates: Selector::parse_optional(filter.dates.as_ref())?,
            members: Selector::parse_optional(filter.members.as_ref())?,
            chunks: Selector::parse_optional(filter.chunks.as_ref())?,
            splits: Selector::parse_optional(filter.splits.as_ref())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_offsets() {
        assert_eq!(
            DependencyExpr::parse("SIM-1").unwrap(),
            DependencyExpr {
                section: "SIM".into(),
                offset: -1
            }
        );
        assert_eq!(DependencyExpr::parse("SIM+2").unwrap().offset, 2);
        assert_eq!(DependencyExpr::parse(" INI ").unwrap().section, "INI");
        // a dash without digits belongs to the section name
        assert_eq!(DependencyExpr::parse("POST-PROC").unwrap().section, "POST-PROC");
        assert!(DependencyExpr::parse("-1").is_err());
        assert!(DependencyExpr::parse("").is_err());
    }

    #[test]
    fn selectors_default_to_natural() {
        let dependency = Dependency::new(
            "SIM",
            &DependencyFilter {
                members: Some("all".into()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(dependency.dates, Selector::Natural);
        assert_eq!(dependency.members, Selector::All);
    }
}
