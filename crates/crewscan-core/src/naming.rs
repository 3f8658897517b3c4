//! Portrait file naming convention.
//!
//! Training portraits are named `<first>_[<middle>_]<last>&<country>.<ext>`,
//! optionally with a `cropped` token among the names.

use crate::types::Identity;
use std::path::Path;
use thiserror::Error;

const IGNORED_TOKEN: &str = "cropped";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("incorrectly formatted file name {0:?}: expected <first>_[<middle>_]<last>&<country>.jpg")]
    Malformed(String),
}

/// Identity fields parsed from a portrait file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityName {
    pub first: String,
    pub middle: Option<String>,
    pub last: String,
    pub country: String,
}

impl IdentityName {
    /// Registry key: `first_last&country`.
    pub fn key(&self) -> String {
        format!("{}_{}&{}", self.first, self.last, self.country)
    }

    /// An identity with these fields and no embedding yet.
    pub fn into_identity(self) -> Identity {
        Identity {
            key: self.key(),
            first_name: self.first,
            middle_name: self.middle,
            last_name: self.last,
            country: self.country,
            embedding: None,
            enrolled_at: None,
        }
    }
}

/// Parse identity fields from a portrait path or bare file name.
pub fn parse_identity_name(path: impl AsRef<Path>) -> Result<IdentityName, NamingError> {
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| NamingError::Malformed(path.display().to_string()))?;
    let malformed = || NamingError::Malformed(file_name.to_string());

    let (names, rest) = file_name.split_once('&').ok_or_else(malformed)?;
    let country = rest.split('.').next().unwrap_or_default();
    if country.is_empty() {
        return Err(malformed());
    }

    let tokens: Vec<&str> = names
        .split('_')
        .filter(|t| *t != IGNORED_TOKEN)
        .collect();
    if tokens.iter().any(|t| t.is_empty()) {
        return Err(malformed());
    }

    let (first, middle, last) = match tokens.as_slice() {
        [first, last] => (*first, None, *last),
        [first, middle, last] => (*first, Some(middle.to_string()), *last),
        _ => return Err(malformed()),
    };

    Ok(IdentityName {
        first: first.to_string(),
        middle,
        last: last.to_string(),
        country: country.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_first_last() {
        let name = parse_identity_name("portraits/sally_ride&usa.jpg").unwrap();
        assert_eq!(name.first, "sally");
        assert_eq!(name.middle, None);
        assert_eq!(name.last, "ride");
        assert_eq!(name.country, "usa");
        assert_eq!(name.key(), "sally_ride&usa");
    }

    #[test]
    fn test_parse_middle_name_not_in_key() {
        let name = parse_identity_name("chris_austin_hadfield&canada.jpg").unwrap();
        assert_eq!(name.middle.as_deref(), Some("austin"));
        assert_eq!(name.key(), "chris_hadfield&canada");
    }

    #[test]
    fn test_parse_ignores_cropped_token() {
        let name = parse_identity_name("cropped_yuri_gagarin&russia.png").unwrap();
        assert_eq!(name.key(), "yuri_gagarin&russia");
        let name = parse_identity_name("yuri_gagarin_cropped&russia.png").unwrap();
        assert_eq!(name.key(), "yuri_gagarin&russia");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "sally_ride.jpg",
            "sally&usa.jpg",
            "a_b_c_d&usa.jpg",
            "sally__ride&usa.jpg",
            "sally_ride&.jpg",
        ] {
            assert!(
                matches!(parse_identity_name(bad), Err(NamingError::Malformed(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_into_identity_untrained() {
        let identity = parse_identity_name("sally_ride&usa.jpg").unwrap().into_identity();
        assert_eq!(identity.key, "sally_ride&usa");
        assert!(identity.embedding.is_none());
    }
}
