//! A subset of the containerd filter syntax, enough to select snapshots.
//!
//! `name==base,labels."containerd.io/gc.root"` matches the snapshot named `base`
//! carrying the given label. Selectors separated by commas must all match, and
//! a snapshot is selected when any of the filters matches it.

use crate::{Error, Info, Result};

#[derive(Debug, PartialEq)]
enum Field {
    Name,
    Parent,
    Kind,
    Label(String),
}

#[derive(Debug, PartialEq)]
enum Operator {
    Present,
    Equal(String),
    NotEqual(String),
}

#[derive(Debug, PartialEq)]
struct Selector {
    field: Field,
    operator: Operator,
}

impl Selector {
    fn parse(input: &str) -> Result<Self> {
        let (field, operator) = match find_unquoted(input, &["==", "!="]) {
            Some(position) => {
                let value = unquote(input[position + 2..].trim());
                let operator = if &input[position..position + 2] == "==" {
                    Operator::Equal(value)
                } else {
                    Operator::NotEqual(value)
                };
                (input[..position].trim(), operator)
            }
            None => (input.trim(), Operator::Present),
        };

        let field = match field {
            "name" => Field::Name,
            "parent" => Field::Parent,
            "kind" => Field::Kind,
            _ => match field.strip_prefix("labels.") {
                Some(label) if !label.is_empty() => Field::Label(unquote(label)),
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown filter field {:?}",
                        field
                    )))
                }
            },
        };

        Ok(Self { field, operator })
    }

    fn matches(&self, info: &Info) -> bool {
        let value = match &self.field {
            Field::Name => Some(info.name.as_str()),
            Field::Parent => info.parent.as_deref(),
            Field::Kind => Some(info.kind.as_str()),
            Field::Label(key) => info.labels.get(key).map(String::as_str),
        };

        match (&self.operator, value) {
            (Operator::Present, value) => value.map_or(false, |v| !v.is_empty()),
            (Operator::Equal(expected), Some(value)) => self.compare(expected, value),
            (Operator::Equal(_), None) => false,
            (Operator::NotEqual(expected), Some(value)) => !self.compare(expected, value),
            (Operator::NotEqual(_), None) => true,
        }
    }

    fn compare(&self, expected: &str, value: &str) -> bool {
        match self.field {
            Field::Kind => expected.eq_ignore_ascii_case(value),
            _ => expected == value,
        }
    }
}

/// A list of filters, any of which selects a snapshot.
#[derive(Debug, PartialEq)]
pub(crate) struct Filter {
    alternatives: Vec<Vec<Selector>>,
}

impl Filter {
    pub fn parse(filters: &[String]) -> Result<Self> {
        let alternatives = filters
            .iter()
            .filter(|filter| !filter.trim().is_empty())
            .map(|filter| {
                split_unquoted(filter, ',')
                    .into_iter()
                    .map(Selector::parse)
                    .collect::<Result<Vec<Selector>>>()
            })
            .collect::<Result<Vec<Vec<Selector>>>>()?;

        Ok(Self { alternatives })
    }

    pub fn matches(&self, info: &Info) -> bool {
        self.alternatives.is_empty()
            || self
                .alternatives
                .iter()
                .any(|selectors| selectors.iter().all(|s| s.matches(info)))
    }
}

/// Find the first occurrence of one of `needles` outside double quotes.
fn find_unquoted(input: &str, needles: &[&str]) -> Option<usize> {
    let mut quoted = false;
    for (position, c) in input.char_indices() {
        if c == '"' {
            quoted = !quoted;
        } else if !quoted && needles.iter().any(|n| input[position..].starts_with(n)) {
            return Some(position);
        }
    }
    None
}

fn split_unquoted(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (position, c) in input.char_indices() {
        if c == '"' {
            quoted = !quoted;
        } else if c == separator && !quoted {
            parts.push(&input[start..position]);
            start = position + c.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}

fn unquote(input: &str) -> String {
    input
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(input)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::Filter;
    use crate::{Info, Kind};
    use std::collections::HashMap;
    use std::time::SystemTime;

    fn info(name: &str, parent: Option<&str>, kind: Kind, labels: &[(&str, &str)]) -> Info {
        Info {
            name: name.to_string(),
            parent: parent.map(str::to_string),
            kind,
            created_at: SystemTime::now(),
            updated_at: SystemTime::now(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn filter(filters: &[&str]) -> Filter {
        Filter::parse(&filters.iter().map(|f| f.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(filter(&[]).matches(&info("base", None, Kind::Committed, &[])));
    }

    #[test]
    fn test_selectors_are_and_filters_are_or() {
        let base = info("base", None, Kind::Committed, &[]);
        let work = info("work", Some("base"), Kind::Active, &[]);

        let both = filter(&["parent==base,kind==active"]);
        assert!(!both.matches(&base));
        assert!(both.matches(&work));

        let either = filter(&["name==base", "kind==Active"]);
        assert!(either.matches(&base));
        assert!(either.matches(&work));

        assert!(filter(&["name!=base"]).matches(&work));
        assert!(!filter(&["parent"]).matches(&base));
    }

    #[test]
    fn test_quoted_label_keys() {
        let rooted = info(
            "base",
            None,
            Kind::Committed,
            &[("containerd.io/gc.root", "2022-01-01"), ("a,b", "c==d")],
        );

        assert!(filter(&["labels.\"containerd.io/gc.root\""]).matches(&rooted));
        assert!(filter(&["labels.\"a,b\"==\"c==d\""]).matches(&rooted));
        assert!(!filter(&["labels.missing"]).matches(&rooted));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(Filter::parse(&["size==1".to_string()]).is_err());
        assert!(Filter::parse(&["labels.".to_string()]).is_err());
    }
}
