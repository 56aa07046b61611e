use thiserror::Error;

use crate::targets::Target;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    Index(usize),
    Port(String),
}

impl std::fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetSelector::Index(i) => write!(f, "index:{i}"),
            TargetSelector::Port(p) => write!(f, "serial:{p}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SelectorError {
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("index out of range: {index} (have {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("no target matched: {selector}")]
    NoMatch { selector: String },

    #[error("multiple targets matched: {selector}")]
    MultipleMatches { selector: String },
}

/// `index:<n>`, bare digits, `serial:<port>`, or a bare port name.
pub fn parse_selector(s: &str) -> Result<TargetSelector, SelectorError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SelectorError::InvalidSelector("empty".to_string()));
    }

    let index = s
        .strip_prefix("index:")
        .map(str::trim)
        .or_else(|| s.chars().all(|c| c.is_ascii_digit()).then_some(s));
    if let Some(rest) = index {
        return rest
            .parse()
            .map(TargetSelector::Index)
            .map_err(|_| SelectorError::InvalidSelector(format!("invalid index: {rest}")));
    }

    let port = s.strip_prefix("serial:").unwrap_or(s).trim();
    if port.is_empty() {
        return Err(SelectorError::InvalidSelector(format!("missing port: {s}")));
    }
    Ok(TargetSelector::Port(port.to_string()))
}

pub fn resolve_one(selector: &TargetSelector, targets: &[Target]) -> Result<usize, SelectorError> {
    match selector {
        TargetSelector::Index(i) if *i >= targets.len() => Err(SelectorError::IndexOutOfRange {
            index: *i,
            len: targets.len(),
        }),
        TargetSelector::Index(i) => Ok(*i),
        TargetSelector::Port(port) => {
            let mut matches = targets
                .iter()
                .enumerate()
                .filter(|(_, t)| t.matches_port(port))
                .map(|(i, _)| i);
            match (matches.next(), matches.next()) {
                (Some(i), None) => Ok(i),
                (None, _) => Err(SelectorError::NoMatch {
                    selector: selector.to_string(),
                }),
                (Some(_), Some(_)) => Err(SelectorError::MultipleMatches {
                    selector: selector.to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_selector_forms() {
        assert_eq!(parse_selector("index:0").unwrap(), TargetSelector::Index(0));
        assert_eq!(parse_selector(" 2 ").unwrap(), TargetSelector::Index(2));
        assert_eq!(
            parse_selector("serial:/dev/ttyUSB0").unwrap(),
            TargetSelector::Port("/dev/ttyUSB0".to_string())
        );
        assert_eq!(
            parse_selector("COM6").unwrap(),
            TargetSelector::Port("COM6".to_string())
        );
        assert!(parse_selector("index:x").is_err());
        assert!(parse_selector("serial:").is_err());
        assert!(parse_selector("").is_err());
    }

    #[test]
    fn resolve_by_port_and_index() {
        let targets = vec![
            Target::from_port_name("/dev/ttyUSB0"),
            Target::from_port_name("/dev/ttyUSB1"),
        ];

        let sel = parse_selector("serial:/dev/ttyUSB1").unwrap();
        assert_eq!(resolve_one(&sel, &targets).unwrap(), 1);

        assert_eq!(resolve_one(&TargetSelector::Index(0), &targets).unwrap(), 0);
        assert!(matches!(
            resolve_one(&TargetSelector::Index(5), &targets).unwrap_err(),
            SelectorError::IndexOutOfRange { index: 5, len: 2 }
        ));
        assert!(matches!(
            resolve_one(&parse_selector("/dev/ttyACM0").unwrap(), &targets).unwrap_err(),
            SelectorError::NoMatch { .. }
        ));
    }
}
