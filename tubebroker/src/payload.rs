//! Routing of job bodies to executor working directories.
//!
//! Job bodies are PHP-serialized arrays. The only thing the broker needs from
//! them is the string under the top-level `"domain"` key, so the decoder here
//! walks the serialized form and skips everything else without building it.

use std::path::{Path, PathBuf};

use crate::config::BrokerConfig;

/// Top-level key carrying the routing domain.
pub const DOMAIN_KEY: &str = "domain";

/// Domain routed to the cluster checkout instead of an instance.
pub const CLUSTER_DOMAIN: &str = "cluster";

/// Directory inside a checkout the executor runs in.
pub const WORKER_SUBDIR: &str = "worker";

/// Why a job body could not be routed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("failed to unserialize job body at byte {offset}: {reason}")]
    Decode { offset: usize, reason: &'static str },
    #[error("job body is not a map")]
    NotAMap,
    #[error("job body has no \"domain\" key")]
    MissingDomain,
    #[error("value of \"domain\" is not a string")]
    DomainNotString,
    #[error("domain {0:?} cannot be used as a directory name")]
    InvalidDomain(String),
}

/// Extract the routing key from a serialized job body.
pub fn extract_routing_key(body: &[u8]) -> Result<String, PayloadError> {
    let mut decoder = Decoder::new(body);
    let domain = decoder.find_top_level_domain()?;
    decoder.expect_end()?;
    domain.ok_or(PayloadError::MissingDomain)
}

/// Where executors run, keyed by routing domain.
#[derive(Clone, Debug)]
pub struct WorkdirLayout {
    pub instance_root: PathBuf,
    pub cluster_root: PathBuf,
}

impl WorkdirLayout {
    pub fn new(instance_root: impl Into<PathBuf>, cluster_root: impl Into<PathBuf>) -> Self {
        Self {
            instance_root: instance_root.into(),
            cluster_root: cluster_root.into(),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(&config.instance_root, &config.cluster_root)
    }

    /// Working directory for `domain`.
    pub fn resolve(&self, domain: &str) -> Result<PathBuf, PayloadError> {
        if domain.eq_ignore_ascii_case(CLUSTER_DOMAIN) {
            return Ok(self.cluster_root.join(WORKER_SUBDIR));
        }
        if !is_plain_component(domain) {
            return Err(PayloadError::InvalidDomain(domain.to_string()));
        }
        Ok(self.instance_root.join(domain).join(WORKER_SUBDIR))
    }

    /// Extract the routing key from `body` and resolve it.
    pub fn working_dir_for(&self, body: &[u8]) -> Result<PathBuf, PayloadError> {
        let domain = extract_routing_key(body)?;
        self.resolve(&domain)
    }
}

fn is_plain_component(domain: &str) -> bool {
    let mut components = Path::new(domain).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    ) && !domain.contains(['/', '\\', '\0'])
}

/// Deepest array or object nesting the decoder walks into.
pub const MAX_NESTING: usize = 512;

/// Cursor over PHP's `serialize()` format.
struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

/// A decoded array key.
enum Key<'a> {
    Int,
    Str(&'a [u8]),
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
        }
    }

    fn error(&self, reason: &'static str) -> PayloadError {
        PayloadError::Decode {
            offset: self.pos,
            reason,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn next(&mut self) -> Result<u8, PayloadError> {
        let byte = self.peek().ok_or_else(|| self.error("unexpected end of input"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn expect(&mut self, byte: u8, reason: &'static str) -> Result<(), PayloadError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(reason))
        }
    }

    fn expect_end(&self) -> Result<(), PayloadError> {
        if self.pos == self.input.len() {
            Ok(())
        } else {
            Err(self.error("trailing data after value"))
        }
    }

    /// Bytes up to (not including) `terminator`, which is consumed.
    fn until(&mut self, terminator: u8) -> Result<&'a [u8], PayloadError> {
        let rest = &self.input[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == terminator)
            .ok_or_else(|| self.error("unterminated token"))?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }

    fn length(&mut self, terminator: u8) -> Result<usize, PayloadError> {
        let start = self.pos;
        let digits = self.until(terminator)?;
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            self.pos = start;
            return Err(self.error("invalid length"));
        }
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.error("length out of range"))
    }

    fn integer(&mut self) -> Result<(), PayloadError> {
        let start = self.pos;
        let digits = self.until(b';')?;
        let digits = digits.strip_prefix(b"-").unwrap_or(digits);
        let digits = digits.strip_prefix(b"+").unwrap_or(digits);
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            self.pos = start;
            return Err(self.error("invalid integer"));
        }
        Ok(())
    }

    /// `"<len bytes>"` as used by strings and class names.
    fn quoted(&mut self, len: usize) -> Result<&'a [u8], PayloadError> {
        self.expect(b'"', "expected opening quote")?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.input.len())
            .ok_or_else(|| self.error("string runs past end of input"))?;
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        self.expect(b'"', "expected closing quote")?;
        Ok(bytes)
    }

    fn string(&mut self) -> Result<&'a [u8], PayloadError> {
        let len = self.length(b':')?;
        let bytes = self.quoted(len)?;
        self.expect(b';', "expected ';' after string")?;
        Ok(bytes)
    }

    fn key(&mut self) -> Result<Key<'a>, PayloadError> {
        let tag = self.next()?;
        self.expect(b':', "expected ':' after key tag")?;
        match tag {
            b'i' => self.integer().map(|_| Key::Int),
            b's' => self.string().map(Key::Str),
            _ => {
                self.pos -= 2;
                Err(self.error("array key must be an integer or string"))
            }
        }
    }

    /// Skip `count` key/value pairs and the closing brace.
    fn skip_entries(&mut self, count: usize) -> Result<(), PayloadError> {
        for _ in 0..count {
            self.key()?;
            self.skip_value()?;
        }
        self.expect(b'}', "expected '}' closing entries")
    }

    /// Skip the entries of a nested array or object.
    fn skip_nested(&mut self, count: usize) -> Result<(), PayloadError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let skipped = self.skip_entries(count);
        self.depth -= 1;
        skipped
    }

    fn skip_value(&mut self) -> Result<(), PayloadError> {
        let tag = self.next()?;
        match tag {
            b'N' => return self.expect(b';', "expected ';' after null"),
            b'b' | b'i' | b'r' | b'R' | b'd' | b's' | b'E' | b'a' | b'O' | b'C' => {}
            _ => {
                self.pos -= 1;
                return Err(self.error("unknown type tag"));
            }
        }
        self.expect(b':', "expected ':' after type tag")?;
        match tag {
            b'b' => {
                match self.next()? {
                    b'0' | b'1' => {}
                    _ => return Err(self.error("invalid boolean")),
                }
                self.expect(b';', "expected ';' after boolean")
            }
            b'i' | b'r' | b'R' => self.integer(),
            b'd' => self.until(b';').map(|_| ()),
            b's' | b'E' => self.string().map(|_| ()),
            b'a' => {
                let count = self.length(b':')?;
                self.expect(b'{', "expected '{' opening array")?;
                self.skip_nested(count)
            }
            b'O' => {
                let name_len = self.length(b':')?;
                self.quoted(name_len)?;
                self.expect(b':', "expected ':' after class name")?;
                let count = self.length(b':')?;
                self.expect(b'{', "expected '{' opening object")?;
                self.skip_nested(count)
            }
            b'C' => {
                let name_len = self.length(b':')?;
                self.quoted(name_len)?;
                self.expect(b':', "expected ':' after class name")?;
                let data_len = self.length(b':')?;
                self.expect(b'{', "expected '{' opening custom data")?;
                let end = self
                    .pos
                    .checked_add(data_len)
                    .filter(|end| *end <= self.input.len())
                    .ok_or_else(|| self.error("custom data runs past end of input"))?;
                self.pos = end;
                self.expect(b'}', "expected '}' closing custom data")
            }
            _ => Err(self.error("unknown type tag")),
        }
    }

    /// Walk the top-level array and return the `domain` string if present.
    fn find_top_level_domain(&mut self) -> Result<Option<String>, PayloadError> {
        if self.input.starts_with(b"a:") {
            self.pos = 2;
        } else {
            // Still has to be a well-formed value to tell "not a map" from garbage.
            self.skip_value()?;
            self.expect_end()?;
            return Err(PayloadError::NotAMap);
        }

        let count = self.length(b':')?;
        self.expect(b'{', "expected '{' opening array")?;

        let mut domain = None;
        for _ in 0..count {
            let key = self.key()?;
            match key {
                Key::Str(name) if name == DOMAIN_KEY.as_bytes() && domain.is_none() => {
                    domain = Some(self.domain_value()?);
                }
                _ => self.skip_value()?,
            }
        }
        self.expect(b'}', "expected '}' closing array")?;
        Ok(domain)
    }

    fn domain_value(&mut self) -> Result<String, PayloadError> {
        if self.input[self.pos..].starts_with(b"s:") {
            self.pos += 2;
            let bytes = self.string()?;
            return String::from_utf8(bytes.to_vec()).map_err(|_| PayloadError::DomainNotString);
        }
        self.skip_value()?;
        Err(PayloadError::DomainNotString)
    }
}
