use regex::Regex;
use tracing::debug;

use crate::domain::{Location, SourceLocation};
use crate::error::IngestError;
use crate::storage::{self, Backends};

#[derive(Clone)]
pub struct SourceLister {
    backends: Backends,
}

impl SourceLister {
    pub fn new(backends: Backends) -> Self {
        Self { backends }
    }

    pub fn list(&self, pattern: &str) -> Result<Vec<SourceLocation>, IngestError> {
        let parsed: Location = pattern.parse().map_err(|err: IngestError| {
            IngestError::Discovery {
                pattern: pattern.to_string(),
                reason: err.to_string(),
            }
        })?;
        let glob = parsed.key();
        let prefix = literal_prefix(glob);
        let matcher = glob_to_regex(glob).map_err(|reason| IngestError::Discovery {
            pattern: pattern.to_string(),
            reason,
        })?;

        let discovery_error = |err: IngestError| IngestError::Discovery {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        };
        let store = self.backends.resolve(&parsed).map_err(discovery_error)?;
        let keys = if prefix == glob {
            // No wildcard: the pattern names a single object.
            if storage::exists(&*store, glob).map_err(discovery_error)? {
                vec![glob.to_string()]
            } else {
                Vec::new()
            }
        } else {
            storage::list(&*store, prefix).map_err(discovery_error)?
        };

        let mut matched: Vec<SourceLocation> = keys
            .into_iter()
            .filter(|key| matcher.is_match(key))
            .map(|key| Location::new(parsed.scheme(), key))
            .collect();
        matched.sort();

        debug!(pattern, count = matched.len(), "listed sources");
        if matched.is_empty() {
            return Err(IngestError::NoSources(pattern.to_string()));
        }
        Ok(matched)
    }
}

/// Directory part of `glob` before the first segment holding a wildcard.
pub(crate) fn literal_prefix(glob: &str) -> &str {
    let Some(first_wild) = glob.find(['*', '?', '[']) else {
        return glob;
    };
    match glob[..first_wild].rfind('/') {
        Some(slash) => &glob[..slash],
        None => "",
    }
}

pub fn glob_to_regex(glob: &str) -> Result<Regex, String> {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` also matches zero directories.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == ']' && !class.is_empty() {
                        closed = true;
                        break;
                    }
                    class.push(next);
                }
                if !closed {
                    return Err(format!("unterminated character class in `{glob}`"));
                }
                let class = match class.strip_prefix('!') {
                    Some(rest) => format!("^{rest}"),
                    None => class,
                };
                out.push('[');
                out.push_str(&class.replace('\\', "\\\\"));
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|err| err.to_string())
}
