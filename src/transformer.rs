//! User id rewriting before the id is handed to upstreams.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One rewrite rule as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRule {
    /// Pattern the user id must match
    pub matches: String,
    /// Replacement; may reference capture groups (`$1`, `${name}`)
    pub replace: String,
}

/// Ordered rewrite rules. The first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct UserIdTransformer {
    rules: Vec<(Regex, String)>,
}

impl UserIdTransformer {
    /// Compile `rules`; an invalid pattern is a configuration error.
    pub fn new(rules: &[TransformRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.matches)
                    .map(|re| (re, rule.replace.clone()))
                    .map_err(|e| {
                        Error::Config(format!("Invalid user id pattern '{}': {e}", rule.matches))
                    })
            })
            .collect::<Result<_>>()?;
        Ok(Self { rules })
    }

    /// Rewrite `user_id` with the first matching rule, or return it unchanged.
    #[must_use]
    pub fn transform(&self, user_id: &str) -> String {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(user_id))
            .map_or_else(
                || user_id.to_string(),
                |(re, replace)| re.replace_all(user_id, replace.as_str()).into_owned(),
            )
    }
}
