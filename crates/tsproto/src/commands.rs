//! The TS3 command sublanguage.
//!
//! Commands are newline-terminated UTF-8 lines of the shape
//! `<name> key1=value1 key2=value2 | key1=value1 ... | ...` where `|`
//! separates repeated items of the same logical command. Values use a
//! fixed escape table so that separators can never occur inside them.

use crate::types::Error;

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

/// Escape a raw value for embedding in a command line.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '|' => out.push_str("\\p"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '/' => out.push_str("\\/"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape`]. Unknown escape sequences are a protocol error.
pub fn unescape(escaped: &str) -> Result<String, Error> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('s') => out.push(' '),
            Some('p') => out.push('|'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('/') => out.push('/'),
            Some(other) => {
                return Err(Error::Protocol(format!("unknown escape sequence \\{}", other)))
            }
            None => return Err(Error::Protocol("dangling escape at end of value".into())),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A parsed or under-construction command.
///
/// `items` always holds at least one entry; single-record commands simply
/// keep all their parameters in the first item. Parameter order is
/// preserved so serialization round-trips.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub items: Vec<Vec<(String, String)>>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: vec![Vec::new()],
        }
    }

    /// Append a key/value pair to the first item.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.items[0].push((key.into(), value.into()));
        self
    }

    /// Append a bare flag (key with empty value) to the first item.
    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.items[0].push((key.into(), String::new()));
        self
    }

    /// Start a new `|`-separated item.
    pub fn push_item(&mut self, item: Vec<(String, String)>) {
        self.items.push(item);
    }

    /// Look up a parameter in the first item.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items[0]
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up and parse a parameter from the first item.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key)?.parse().ok()
    }

    /// Serialize to the wire line (no trailing newline).
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (idx, item) in self.items.iter().enumerate() {
            if idx > 0 {
                out.push('|');
            } else if !self.name.is_empty() {
                out.push_str(&self.name);
                if !item.is_empty() {
                    out.push(' ');
                }
            }
            for (pidx, (key, value)) in item.iter().enumerate() {
                if pidx > 0 {
                    out.push(' ');
                }
                out.push_str(key);
                if !value.is_empty() {
                    out.push('=');
                    out.push_str(&escape(value));
                }
            }
        }
        out
    }

    /// Parse a wire line. Nameless lines are rejected; the engine never
    /// expects a continuation body outside an established exchange.
    pub fn parse(line: &str) -> Result<Self, Error> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut items = Vec::new();
        let mut name = String::new();

        // Escaped pipes arrive as `\p`, so a raw `|` is always a separator.
        for (item_idx, raw_item) in line.split('|').enumerate() {
            let mut item = Vec::new();
            for (tok_idx, token) in raw_item.split(' ').enumerate() {
                if token.is_empty() {
                    continue;
                }
                match token.split_once('=') {
                    Some((key, value)) => {
                        item.push((key.to_string(), unescape(value)?));
                    }
                    None if item_idx == 0 && tok_idx == 0 && is_command_name(token) => {
                        name = token.to_string();
                    }
                    None => {
                        // Bare token: a flag parameter.
                        item.push((unescape(token)?, String::new()));
                    }
                }
            }
            items.push(item);
        }

        if name.is_empty() {
            return Err(Error::Protocol("nameless command".into()));
        }
        if items.is_empty() {
            items.push(Vec::new());
        }
        Ok(Self { name, items })
    }
}

/// Command names are plain lowercase identifiers.
fn is_command_name(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
