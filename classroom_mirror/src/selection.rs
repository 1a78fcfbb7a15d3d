//! Course selection from a listing.
//!
//! Selections are 1-based, as shown to the user: `all`, `2`, `1,3`, `1 3`
//! or ranges like `2-4`.

use std::str::FromStr;

use crate::error::{MirrorError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    /// 1-based positions, de-duplicated, in the order given.
    Indices(Vec<usize>),
}

impl FromStr for Selection {
    type Err = MirrorError;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("all") {
            return Ok(Selection::All);
        }

        let mut indices = Vec::new();
        for part in input
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|p| !p.is_empty())
        {
            match part.split_once('-') {
                Some((start, end)) => {
                    let start = parse_index(start)?;
                    let end = parse_index(end)?;
                    if start > end {
                        return Err(MirrorError::InvalidSelection(format!(
                            "range {} is reversed",
                            part
                        )));
                    }
                    indices.extend(start..=end);
                }
                None => indices.push(parse_index(part)?),
            }
        }

        if indices.is_empty() {
            return Err(MirrorError::InvalidSelection("nothing selected".to_string()));
        }
        Ok(Selection::Indices(dedup(indices)))
    }
}

impl Selection {
    /// Positions (1-based) of the items to process.
    pub fn indices(&self, len: usize) -> Result<Vec<usize>> {
        match self {
            Selection::All => Ok((1..=len).collect()),
            Selection::Indices(indices) => {
                if let Some(bad) = indices.iter().find(|&&i| i > len) {
                    return Err(MirrorError::InvalidSelection(format!(
                        "{} is out of range (1-{})",
                        bad, len
                    )));
                }
                Ok(indices.clone())
            }
        }
    }

    /// The selected items, in selection order.
    pub fn apply<'a, T>(&self, items: &'a [T]) -> Result<Vec<&'a T>> {
        Ok(self
            .indices(items.len())?
            .into_iter()
            .map(|i| &items[i - 1])
            .collect())
    }
}

fn parse_index(part: &str) -> Result<usize> {
    match part.trim().parse::<usize>() {
        Ok(0) | Err(_) => Err(MirrorError::InvalidSelection(format!(
            "'{}' is not a course number",
            part
        ))),
        Ok(n) => Ok(n),
    }
}

fn dedup(indices: Vec<usize>) -> Vec<usize> {
    let mut seen = std::collections::HashSet::new();
    indices.into_iter().filter(|i| seen.insert(*i)).collect()
}
