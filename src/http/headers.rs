//! Ordered, case-insensitive header multimap.
//!
//! # Design Decisions
//! - Insertion order is preserved so responses serialize headers in the
//!   order handlers set them.
//! - [`Headers::set`] is last-write-wins: every existing entry with the same
//!   name is dropped and the new value takes the first entry's position.
//!   Request parsing uses `set`, so a duplicated request header keeps only
//!   its final value.
//! - [`Headers::append`] keeps duplicates (e.g. several `Set-Cookie`).
//! - Names keep the casing they were given; lookups ignore case.

use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value of `name`; with duplicates, the last one.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Replace every value of `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let Some(first) = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name))
        else {
            self.entries.push((name, value));
            return;
        };

        let mut index = 0;
        self.entries.retain(|(n, _)| {
            let keep = index <= first || !n.eq_ignore_ascii_case(&name);
            index += 1;
            keep
        });
        self.entries[first] = (name, value);
    }

    /// Add a value without touching existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Append a folded continuation line to the value of `name`.
    ///
    /// Returns false if there is no such header to continue.
    pub fn extend_value(&mut self, name: &str, continuation: &str) -> bool {
        match self
            .entries
            .iter_mut()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, value)) => {
                let continuation = continuation.trim();
                if !continuation.is_empty() {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(continuation);
                }
                true
            }
            None => false,
        }
    }

    /// Remove all values of `name`, returning the last one.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut removed = None;
        self.entries.retain(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                removed = Some(v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Comma-separated tokens across every value of `name`, trimmed.
    pub fn tokens<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// True if `name` lists `token` (case-insensitive), e.g. `Connection: keep-alive, Upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.tokens(name).any(|t| t.eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert!(headers.contains("CONTENT-TYPE"));
    }

    #[test]
    fn set_is_last_write_wins_in_first_position() {
        let mut headers = Headers::new();
        headers.append("X-A", "1");
        headers.append("Host", "a");
        headers.append("x-a", "2");
        headers.set("X-a", "3");

        let collected: Vec<_> = headers.iter().collect();
        assert_eq!(collected, vec![("X-a", "3"), ("Host", "a")]);
    }

    #[test]
    fn folded_continuation_matches_single_line() {
        let mut folded = Headers::new();
        folded.set("x-list", "alpha,");
        assert!(folded.extend_value("X-List", "   beta"));

        let mut single = Headers::new();
        single.set("x-list", "alpha, beta");
        assert_eq!(folded.get("x-list"), single.get("x-list"));
    }

    #[test]
    fn tokens_span_values() {
        let mut headers = Headers::new();
        headers.append("Connection", "keep-alive, Upgrade");
        headers.append("Connection", "HTTP2-Settings");
        assert!(headers.has_token("connection", "upgrade"));
        assert!(headers.has_token("connection", "http2-settings"));
        assert!(!headers.has_token("connection", "close"));
    }

    #[test]
    fn remove_returns_last_value() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("Set-Cookie", "b=2");
        assert_eq!(headers.remove("set-cookie").as_deref(), Some("b=2"));
        assert!(headers.is_empty());
        assert!(!headers.extend_value("set-cookie", "x"));
    }
}
