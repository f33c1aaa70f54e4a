//! RFC 6570 (levels 1/2) URI template expansion and matching.
//!
//! A pure helper with no protocol awareness of its own, per spec.md §1 — it
//! just turns `{var}` templates into concrete URIs and back. Grounded on the
//! original SDK's `Utilities/URI/URI_Template.cpp`, narrowed to the variable
//! forms MCP resource templates actually use: simple (`{var}`) and
//! reserved-expansion (`{+var}`) substitution.

use std::collections::BTreeMap;

use thiserror::Error;

const MAX_TEMPLATE_LENGTH: usize = 1_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriTemplateError {
    #[error("template exceeds maximum length of {0} bytes")]
    TooLong(usize),
    #[error("unterminated variable expression in template")]
    Unterminated,
    #[error("empty variable name in template")]
    EmptyVariable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    /// `reserved` marks `{+var}` (reserved characters pass through unencoded).
    Variable { name: String, reserved: bool },
}

/// A parsed RFC 6570 URI template.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    source: String,
    parts: Vec<Part>,
}

impl UriTemplate {
    pub fn parse(template: &str) -> Result<Self, UriTemplateError> {
        if template.len() > MAX_TEMPLATE_LENGTH {
            return Err(UriTemplateError::TooLong(MAX_TEMPLATE_LENGTH));
        }

        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '{' {
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                let mut expr = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    expr.push(c);
                }
                if !closed {
                    return Err(UriTemplateError::Unterminated);
                }
                let (reserved, name) = match expr.strip_prefix('+') {
                    Some(rest) => (true, rest),
                    None => (false, expr.as_str()),
                };
                if name.is_empty() {
                    return Err(UriTemplateError::EmptyVariable);
                }
                parts.push(Part::Variable {
                    name: name.to_string(),
                    reserved,
                });
            } else {
                literal.push(c);
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Variable { name, .. } => Some(name.as_str()),
                Part::Literal(_) => None,
            })
            .collect()
    }

    /// Substitutes `variables` into the template, percent-encoding values
    /// unless the variable uses reserved (`{+var}`) expansion.
    pub fn expand(&self, variables: &BTreeMap<String, String>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(lit) => out.push_str(lit),
                Part::Variable { name, reserved } => {
                    if let Some(value) = variables.get(name) {
                        if *reserved {
                            out.push_str(value);
                        } else {
                            out.push_str(&encode_component(value));
                        }
                    }
                }
            }
        }
        out
    }

    /// Attempts to match a concrete URI against this template, extracting
    /// variable bindings. Returns `None` if the URI does not match the
    /// template's literal structure.
    pub fn matches(&self, uri: &str) -> Option<BTreeMap<String, String>> {
        let mut bindings = BTreeMap::new();
        let mut remaining = uri;

        for (i, part) in self.parts.iter().enumerate() {
            match part {
                Part::Literal(lit) => {
                    if !remaining.starts_with(lit.as_str()) {
                        return None;
                    }
                    remaining = &remaining[lit.len()..];
                }
                Part::Variable { name, .. } => {
                    let next_literal = self.parts[i + 1..].iter().find_map(|p| match p {
                        Part::Literal(lit) => Some(lit.as_str()),
                        Part::Variable { .. } => None,
                    });
                    let value = match next_literal {
                        Some(stop) => {
                            let idx = remaining.find(stop)?;
                            let (value, rest) = remaining.split_at(idx);
                            remaining = rest;
                            value
                        }
                        None => {
                            let value = remaining;
                            remaining = "";
                            value
                        }
                    };
                    if value.is_empty() {
                        return None;
                    }
                    bindings.insert(name.clone(), decode_component(value));
                }
            }
        }

        if remaining.is_empty() {
            Some(bindings)
        } else {
            None
        }
    }
}

fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        let unreserved = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~');
        if unreserved {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_component(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&value[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_simple_variable() {
        let tpl = UriTemplate::parse("file:///{path}").unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("path".to_string(), "a b/c".to_string());
        assert_eq!(tpl.expand(&vars), "file:///a%20b%2Fc");
    }

    #[test]
    fn reserved_expansion_passes_through_slashes() {
        let tpl = UriTemplate::parse("file://{+path}").unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("path".to_string(), "a/b/c".to_string());
        assert_eq!(tpl.expand(&vars), "file://a/b/c");
    }

    #[test]
    fn matches_extracts_variables() {
        let tpl = UriTemplate::parse("file:///projects/{project}/{file}").unwrap();
        let bindings = tpl.matches("file:///projects/acme/readme.md").unwrap();
        assert_eq!(bindings.get("project").unwrap(), "acme");
        assert_eq!(bindings.get("file").unwrap(), "readme.md");
    }

    #[test]
    fn non_matching_uri_returns_none() {
        let tpl = UriTemplate::parse("file:///projects/{project}").unwrap();
        assert!(tpl.matches("http://other/").is_none());
    }

    #[test]
    fn rejects_unterminated_expression() {
        assert_eq!(
            UriTemplate::parse("file:///{path").unwrap_err(),
            UriTemplateError::Unterminated
        );
    }
}
