//! Command Codec
//!
//! Commands travel between tasks as plain text of the form
//! `function(parameters)`. There is no escaping and no nesting. Decoded
//! commands are stored in fixed-capacity buffers so that a command never
//! allocates.

use std::fmt;

use crate::error::CodecError;

/// Maximum length of a function name in bytes.
pub const MAX_FUNCTION_LEN: usize = 15;

/// Maximum length of the parameter text in bytes.
pub const MAX_PARAMETERS_LEN: usize = 47;

/// Default capacity of a plugin's response buffer in bytes.
pub const DEFAULT_RESPONSE_CAPACITY: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Fixed-capacity string
// ─────────────────────────────────────────────────────────────────────────────

/// An inline UTF-8 string holding at most `N` bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedStr<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedStr<N> {
    /// The empty string.
    pub const fn new() -> Self {
        Self {
            bytes: [0; N],
            len: 0,
        }
    }

    /// Copy `s` into a new fixed string, or `None` if it does not fit.
    pub fn try_from_str(s: &str) -> Option<Self> {
        if s.len() > N {
            return None;
        }
        let mut out = Self::new();
        out.bytes[..s.len()].copy_from_slice(s.as_bytes());
        out.len = s.len();
        Some(out)
    }

    pub fn as_str(&self) -> &str {
        // Only whole `&str` values are ever copied in.
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> PartialEq<str> for FixedStr<N> {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl<const N: usize> PartialEq<&str> for FixedStr<N> {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded `function(parameters)` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Command {
    pub function: FixedStr<MAX_FUNCTION_LEN>,
    pub parameters: FixedStr<MAX_PARAMETERS_LEN>,
}

impl Command {
    /// Build a command from its parts, enforcing the same bounds as `parse`.
    pub fn new(function: &str, parameters: &str) -> Result<Self, CodecError> {
        if function.is_empty() {
            return Err(CodecError::EmptyFunction);
        }
        if function.contains(['(', ')']) {
            return Err(CodecError::MissingOpenParen);
        }
        if parameters.contains('(') {
            return Err(CodecError::NestedParen);
        }
        if parameters.contains(')') {
            return Err(CodecError::MissingCloseParen);
        }
        let function = FixedStr::try_from_str(function).ok_or(CodecError::FunctionTooLong {
            max: MAX_FUNCTION_LEN,
        })?;
        let parameters =
            FixedStr::try_from_str(parameters).ok_or(CodecError::ParametersTooLong {
                max: MAX_PARAMETERS_LEN,
            })?;
        Ok(Self {
            function,
            parameters,
        })
    }

    /// Decode wire text.
    ///
    /// The function name runs up to the first `(`, the parameters up to the
    /// first `)` after it. Anything after that `)` is ignored. Input that is
    /// missing either parenthesis, nests them, or overflows a field is
    /// rejected rather than truncated.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let open = text.find('(').ok_or(CodecError::MissingOpenParen)?;
        let function = &text[..open];
        if function.contains(')') {
            return Err(CodecError::MissingOpenParen);
        }

        let rest = &text[open + 1..];
        let close = rest.find(')').ok_or(CodecError::MissingCloseParen)?;
        let parameters = &rest[..close];

        Self::new(function, parameters)
    }

    pub fn function(&self) -> &str {
        self.function.as_str()
    }

    pub fn parameters(&self) -> &str {
        self.parameters.as_str()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.function, self.parameters)
    }
}

impl std::str::FromStr for Command {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response Buffer
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded buffer a handler writes its reply into.
///
/// Writes past the capacity are dropped at the last whole character that
/// fits; `is_truncated` reports whether that happened.
#[derive(Debug, Clone)]
pub struct ResponseBuffer {
    text: String,
    capacity: usize,
    truncated: bool,
}

impl ResponseBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            text: String::with_capacity(capacity),
            capacity,
            truncated: false,
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.truncated = false;
    }

    /// Append as much of `s` as fits.
    pub fn push_str(&mut self, s: &str) {
        let room = self.capacity - self.text.len();
        if s.len() <= room {
            self.text.push_str(s);
            return;
        }
        let mut end = room;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&s[..end]);
        self.truncated = true;
    }

    /// Replace the contents with `s`.
    pub fn set(&mut self, s: &str) {
        self.clear();
        self.push_str(s);
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RESPONSE_CAPACITY)
    }
}

impl fmt::Write for ResponseBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
