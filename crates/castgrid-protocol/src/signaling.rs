//! Text framing for the client signaling channel.
//!
//! A frame is a method line, zero or more `key: value` header lines, and
//! optionally a blank line followed by a raw body. Header keys are
//! case-insensitive; everything after the first blank line is the body
//! verbatim, embedded newlines included.

use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalingMessage {
    pub method: String,
    pub params: HashMap<String, String>,
    pub body: String,
}

impl SignalingMessage {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            params: HashMap::new(),
            body: String::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = body;
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Parses a raw frame. Never fails: a malformed frame comes back with
    /// an empty method and gets rejected at dispatch.
    pub fn parse(raw: &str) -> SignalingMessage {
        let mut msg = SignalingMessage::default();
        let mut lines = raw.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

        for line in lines.by_ref() {
            let line = line.trim();
            if !line.is_empty() {
                msg.method = line.to_ascii_uppercase();
                break;
            }
        }

        let mut body_lines: Option<Vec<&str>> = None;
        for line in lines {
            match &mut body_lines {
                Some(body) => body.push(line),
                None => {
                    if line.trim().is_empty() {
                        body_lines = Some(Vec::new());
                    } else if let Some(colon) = line.find(':') {
                        let key = line[..colon].trim().to_ascii_lowercase();
                        if !key.is_empty() {
                            let value = line[colon + 1..].trim().to_string();
                            msg.params.insert(key, value);
                        }
                    }
                }
            }
        }

        if let Some(body) = body_lines {
            msg.body = body.join("\n");
        }

        msg
    }

    pub fn serialize(&self) -> String {
        let mut raw = String::new();
        raw.push_str(&self.method.to_ascii_uppercase());
        raw.push('\n');
        for (key, value) in &self.params {
            raw.push_str(key);
            raw.push_str(": ");
            raw.push_str(value);
            raw.push('\n');
        }
        if !self.body.is_empty() {
            raw.push('\n');
            raw.push_str(&self.body);
        }
        raw
    }
}
