//! HTTP header map with case-insensitive name lookup.
//!
//! Header fields keep their arrival order and may repeat (RFC 9110 §5.3),
//! which matters for `Cookie` on the way in and `Set-Cookie` on the way out.

use std::fmt;

/// A case-insensitive, multi-value HTTP header map.
///
/// # Examples
///
/// ```
/// use webby::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Set-Cookie", "sid=abc");
/// headers.insert("Set-Cookie", "theme=dark");
/// headers.set("Content-Type", "text/plain");
/// headers.set("content-type", "text/html");
///
/// assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
/// let cookies: Vec<_> = headers.get_all("set-cookie").collect();
/// assert_eq!(cookies, vec!["sid=abc", "theme=dark"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Appends an entry, keeping any existing values for the same name.
    ///
    /// CR and LF are dropped from both name and value, so a field can never
    /// spill into a second header line.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries
            .push((strip_line_breaks(name.into()), strip_line_breaks(value.into())));
    }

    /// Replaces every value for `name` with a single new value.
    ///
    /// Line breaks are dropped as in [`insert`](Self::insert).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = strip_line_breaks(name.into());
        self.remove(&name);
        self.entries.push((name, strip_line_breaks(value.into())));
    }

    /// Returns the first value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes all entries named `name`. Returns `true` if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.entries.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Number of entries (not unique names).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn strip_line_breaks(mut field: String) -> String {
    if field.contains(['\r', '\n']) {
        field.retain(|c| c != '\r' && c != '\n');
    }
    field
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn repeated_set_cookie_keeps_order() {
        let mut h = Headers::new();
        h.insert("Set-Cookie", "a=1");
        h.insert("set-cookie", "b=2");
        let vals: Vec<_> = h.get_all("Set-Cookie").collect();
        assert_eq!(vals, vec!["a=1", "b=2"]);
    }

    #[test]
    fn set_replaces_all_values() {
        let mut h = Headers::new();
        h.insert("X-Foo", "one");
        h.insert("x-foo", "two");
        h.set("X-Foo", "three");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("x-foo"), Some("three"));
    }

    #[test]
    fn remove_reports_whether_anything_went() {
        let mut h = Headers::new();
        h.insert("Location", "/home");
        assert!(h.remove("location"));
        assert!(h.is_empty());
        assert!(!h.remove("location"));
    }

    #[test]
    fn display_is_wire_format() {
        let mut h = Headers::new();
        h.insert("Location", "/login");
        assert_eq!(h.to_string(), "Location: /login\r\n");
    }

    #[test]
    fn line_breaks_cannot_split_a_field() {
        let mut h = Headers::new();
        h.insert("Location", "/home\r\nSet-Cookie: admin=1");
        h.set("X-Name\n", "a\rb");
        assert_eq!(h.len(), 2);
        assert_eq!(h.get("location"), Some("/homeSet-Cookie: admin=1"));
        assert_eq!(h.get("x-name"), Some("ab"));
        assert_eq!(h.get("set-cookie"), None);
        assert_eq!(
            h.to_string(),
            "Location: /homeSet-Cookie: admin=1\r\nX-Name: ab\r\n"
        );
    }
}
