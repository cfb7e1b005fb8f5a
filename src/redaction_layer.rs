use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;
use std::io::Write;

lazy_static! {
    static ref REDACTION_REGEX: Regex = match Regex::new(
        r"(?i)(sk-ant-[A-Za-z0-9_\-]{10,}|sk-[A-Za-z0-9]{20,}|Bearer\s+[^\s\x22]+|x-api-key\x22?:\s*\x22?[^\s\x22]+)"
    ) {
        Ok(r) => r,
        Err(e) => panic!("Invalid redaction regex: {}", e),
    };
}

pub fn redact(input: &str) -> Cow<'_, str> {
    REDACTION_REGEX.replace_all(input, "[REDACTED]")
}

/// Writer adapter that scrubs credentials before bytes reach the log file.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        self.inner.write_all(redact(&input).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
