use std::io::{BufRead, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("malformed header line: {0:?}")]
    MalformedLine(String),
    #[error("continuation line with no preceding field")]
    OrphanContinuation,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An ordered sequence of `(name, value)` header fields.
///
/// Insertion order is preserved and duplicate names are allowed;
/// values are stored unfolded (no embedded line breaks).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<(String, String)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn push<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.fields.push((name.into(), value.into()));
    }

    /// Insert a field at the top of the header, the position trace
    /// fields like `Authentication-Results` and `Received` go.
    pub fn prepend<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.fields.insert(0, (name.into(), value.into()));
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parse a textproto header block: `Name: value` lines up to the
    /// first blank line (or EOF), with leading-whitespace continuation
    /// lines unfolded into the preceding value.
    pub fn read_from<R: BufRead>(reader: R) -> Result<Self, HeaderError> {
        let mut header = Self::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                match header.fields.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim_start());
                    }
                    None => return Err(HeaderError::OrphanContinuation),
                }
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => header.push(name.trim(), value.trim()),
                None => return Err(HeaderError::MalformedLine(line.to_string())),
            }
        }
        Ok(header)
    }

    /// Emit the textproto form: CRLF terminated fields followed by the
    /// blank separator line.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for (name, value) in &self.fields {
            write!(writer, "{name}: {value}\r\n")?;
        }
        write!(writer, "\r\n")?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out)
            .expect("writing to a Vec cannot fail");
        out
    }
}
