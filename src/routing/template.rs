//! Route templates such as `/users/{id}/posts/{post}`.

use regex::{Regex, RegexBuilder};
use std::fmt;

/// Values captured from `{name}` placeholders, in template order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    /// Value captured for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }
}

/// Compiled form of a route template.
///
/// Templates without placeholders compare the path exactly and
/// case-sensitively. Templates with placeholders become an anchored,
/// case-insensitive regex where each `{name}` becomes a named group matching
/// one non-empty path segment (`[^/]+`) and the literal text between them
/// is escaped. Names must be valid, distinct group names.
#[derive(Clone)]
pub(crate) enum Matcher {
    Exact(String),
    Pattern { regex: Regex, names: Vec<String> },
}

impl Matcher {
    pub(crate) fn compile(template: &str) -> Result<Self, regex::Error> {
        if !template.contains('{') {
            return Ok(Matcher::Exact(template.to_string()));
        }

        let mut pattern = String::with_capacity(template.len() + 16);
        let mut names = Vec::new();
        let mut rest = template;

        pattern.push('^');
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|i| open + i) else {
                break;
            };

            let name = rest[open + 1..close].trim();
            pattern.push_str(&regex::escape(&rest[..open]));
            pattern.push_str("(?P<");
            pattern.push_str(name);
            pattern.push_str(">[^/]+)");
            names.push(name.to_string());
            rest = &rest[close + 1..];
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');

        let regex = RegexBuilder::new(&pattern).case_insensitive(true).build()?;
        Ok(Matcher::Pattern { regex, names })
    }

    /// Returns the captured parameters when `path` matches.
    pub(crate) fn extract(&self, path: &str) -> Option<Params> {
        match self {
            Matcher::Exact(template) => (template == path).then(Params::default),
            Matcher::Pattern { regex, names } => {
                let captures = regex.captures(path)?;
                let mut params = Params(Vec::with_capacity(names.len()));

                for name in names {
                    if let Some(value) = captures.name(name) {
                        params.push(name, value.as_str());
                    }
                }

                Some(params)
            }
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Exact(t) => f.debug_tuple("Exact").field(t).finish(),
            Matcher::Pattern { regex, names } => f
                .debug_struct("Pattern")
                .field("regex", &regex.as_str())
                .field("names", names)
                .finish(),
        }
    }
}

#[cfg(test)]
mod template_tests {
    use super::*;

    #[test]
    fn extraction() {
        #[rustfmt::skip]
        let cases: [(&str, &str, Option<&[(&str, &str)]>); 10] = [
            ("/users/{id}", "/users/42", Some(&[("id", "42")][..])),
            ("/users/{id}", "/USERS/42", Some(&[("id", "42")][..])),
            ("/users/{id}", "/users/42/x", None),
            ("/users/{id}", "/users/", None),
            ("/a/{x}/b/{y}", "/a/1/b/two", Some(&[("x", "1"), ("y", "two")][..])),
            ("/files/{name}.json", "/files/report.json", Some(&[("name", "report")][..])),
            ("/v1.0/{id}", "/v1x0/5", None),
            ("/health", "/health", Some(&[][..])),
            ("/health", "/Health", None),
            ("/health", "/health/", None),
        ];

        for (template, path, expected) in cases {
            let matcher = Matcher::compile(template).unwrap();
            let got = matcher.extract(path);

            match expected {
                None => assert!(got.is_none(), "{template} ~ {path}"),
                Some(pairs) => {
                    let got = got.unwrap_or_else(|| panic!("{template} !~ {path}"));
                    assert_eq!(got.len(), pairs.len());
                    for (name, value) in pairs {
                        assert_eq!(got.get(name), Some(*value), "{template} ~ {path}");
                    }
                }
            }
        }
    }

    #[test]
    fn invalid_names() {
        for template in ["/a/{}", "/a/{x}/{x}", "/a/{bad name}", "/a/{1st}"] {
            assert!(Matcher::compile(template).is_err(), "{template}");
        }
    }

    #[test]
    fn unclosed_placeholder_is_literal() {
        let matcher = Matcher::compile("/odd/{id").unwrap();
        assert!(matcher.extract("/odd/{id").is_some());
        assert!(matcher.extract("/odd/5").is_none());
    }
}
