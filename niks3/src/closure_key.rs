//! Object and closure keys.
//!
//! A closure key is the narinfo object key that roots it: a 32-character
//! Nix base32 hash prefix followed by `.narinfo`. Other object kinds
//! (`nar`, `listing`, `build_log`, `realisation`) share the same key space
//! but are not required to end in `.narinfo`.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{de, Deserialize, Serialize};

use crate::error::{Niks3Error, Niks3Result};

lazy_static! {
    static ref NARINFO_KEY_REGEX: Regex =
        Regex::new(r"^[0-9a-df-np-sv-z]{32}\.narinfo$").unwrap();
}

/// A closure key: the narinfo object key that roots a closure.
#[derive(Serialize, Deserialize, Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ClosureKey(#[serde(deserialize_with = "ClosureKey::deserialize")] String);

impl ClosureKey {
    /// Creates a closure key from a String, validating that it is a
    /// 32-character Nix base32 hash followed by `.narinfo`.
    pub fn new(key: String) -> Niks3Result<Self> {
        validate_closure_key(&key)?;
        Ok(Self(key))
    }

    /// Returns the string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the 32-character hash prefix, without the `.narinfo` suffix.
    pub fn hash_prefix(&self) -> &str {
        &self.0[..32]
    }

    fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;
        String::deserialize(deserializer).and_then(|s| {
            validate_closure_key(&s).map_err(|e| Error::custom(e.to_string()))?;
            Ok(s)
        })
    }
}

impl FromStr for ClosureKey {
    type Err = Niks3Error;

    fn from_str(key: &str) -> Niks3Result<Self> {
        Self::new(key.to_owned())
    }
}

impl Display for ClosureKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate_closure_key(key: &str) -> Niks3Result<()> {
    if !key.ends_with(".narinfo") {
        return Err(Niks3Error::InvalidClosureKey {
            key: key.to_owned(),
            reason: "must end in .narinfo",
        });
    }

    if !NARINFO_KEY_REGEX.is_match(key) {
        return Err(Niks3Error::InvalidClosureKey {
            key: key.to_owned(),
            reason: "hash prefix must be a 32-character Nix base32 string",
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_closure_key() {
        let key = "00bgd045z0d4icpbc2yyz4gx48ak44la.narinfo";
        assert_eq!(key, ClosureKey::new(key.to_string()).unwrap().as_str());
    }

    #[test]
    fn test_rejects_wrong_suffix() {
        ClosureKey::new("00bgd045z0d4icpbc2yyz4gx48ak44la.nar".to_string()).unwrap_err();
    }

    #[test]
    fn test_rejects_forbidden_characters() {
        // 'e', 't', 'u', 'o' are not in the Nix base32 alphabet.
        ClosureKey::new("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee.narinfo".to_string()).unwrap_err();
    }

    #[test]
    fn test_rejects_wrong_length() {
        ClosureKey::new("abc.narinfo".to_string()).unwrap_err();
    }

    #[test]
    fn test_hash_prefix() {
        let key = ClosureKey::new("00bgd045z0d4icpbc2yyz4gx48ak44la.narinfo".to_string()).unwrap();
        assert_eq!(key.hash_prefix(), "00bgd045z0d4icpbc2yyz4gx48ak44la");
    }
}
