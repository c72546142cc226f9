//! Line-based request/response messages.
//!
//! A message is one method line, zero or more `Name: Value` header
//! lines, a blank line, and an optional raw body whose length matches
//! an explicit `Content-Length` header. Header names are
//! case-sensitive; header order is insignificant. The parser consumes
//! exactly one complete message from a byte stream and reports how many
//! bytes it used, or 0 when more bytes are needed.

use std::collections::BTreeMap;

pub const CONTENT_LENGTH: &str = "Content-Length";

/// One request or response: method line, headers, body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub method_line: String,
    pub headers: BTreeMap<String, String>,
    pub content: String,
}

impl Message {
    pub fn new(method_line: impl Into<String>) -> Self {
        Self {
            method_line: method_line.into(),
            headers: BTreeMap::new(),
            content: String::new(),
        }
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Header value parsed as an integer, if present and numeric.
    pub fn calc(&self, name: &str) -> Option<i64> {
        self.get(name)?.trim().parse().ok()
    }

    /// Drop everything but the method line.
    pub fn clear(&mut self) {
        self.headers.clear();
        self.content.clear();
    }

    /// Serialize to the wire form. `Content-Length` is always emitted
    /// from the actual body length, never from a stored header.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::with_capacity(self.method_line.len() + self.content.len() + 64);
        out.push_str(&self.method_line);
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            if name == CONTENT_LENGTH {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        if !self.content.is_empty() {
            out.push_str(CONTENT_LENGTH);
            out.push_str(": ");
            out.push_str(&self.content.len().to_string());
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.content);
        out.into_bytes()
    }

    /// Parse one complete message from the front of `data` into `self`.
    ///
    /// Returns the number of bytes consumed, or 0 when the buffer does
    /// not yet hold a complete message (`self` is left untouched).
    /// Lines may end in `\n` or `\r\n`. Lines without a colon between
    /// the method line and the blank line are ignored.
    pub fn parse(&mut self, data: &[u8]) -> usize {
        let mut method_line: Option<String> = None;
        let mut headers = BTreeMap::new();

        let mut pos = 0;
        let body_start = loop {
            let Some(eol) = data[pos..].iter().position(|&b| b == b'\n') else {
                return 0;
            };
            let line = trim_cr(&data[pos..pos + eol]);
            pos += eol + 1;

            if method_line.is_none() {
                if line.is_empty() {
                    // A message cannot start with a blank line.
                    return 0;
                }
                method_line = Some(String::from_utf8_lossy(line).into_owned());
            } else if line.is_empty() {
                break pos;
            } else if let Some((name, value)) = split_header(line) {
                headers.insert(name, value);
            }
        };

        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let Some(body_end) = body_start.checked_add(content_length) else {
            return 0;
        };
        if data.len() < body_end {
            return 0;
        }

        self.method_line = method_line.unwrap_or_default();
        self.headers = headers;
        self.content = String::from_utf8_lossy(&data[body_start..body_end]).into_owned();
        body_end
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn split_header(line: &[u8]) -> Option<(String, String)> {
    let colon = line.iter().position(|&b| b == b':')?;
    let name = String::from_utf8_lossy(&line[..colon]).trim_end().to_string();
    let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
    if name.is_empty() {
        return None;
    }
    Some((name, value))
}
