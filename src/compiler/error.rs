use std::fmt;

/// A compilation failure. Compilation stops at the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
    /// Source line of the statement being compiled, when known
    pub line: Option<usize>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    pub fn at(message: impl Into<String>, line: Option<usize>) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }

    /// Attach a line unless one is already set.
    pub fn or_line(mut self, line: Option<usize>) -> Self {
        if self.line.is_none() {
            self.line = line;
        }
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<String> for CompileError {
    fn from(message: String) -> Self {
        CompileError::new(message)
    }
}

impl From<&str> for CompileError {
    fn from(message: &str) -> Self {
        CompileError::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_line() {
        let err = CompileError::at("too many constants", Some(12));
        assert_eq!(err.to_string(), "line 12: too many constants");
        assert_eq!(CompileError::new("oops").to_string(), "oops");
    }

    #[test]
    fn test_or_line_keeps_existing() {
        let err = CompileError::at("x", Some(3)).or_line(Some(9));
        assert_eq!(err.line, Some(3));
        let err = CompileError::new("x").or_line(Some(9));
        assert_eq!(err.line, Some(9));
    }
}
