use std::fmt;

/// A fatal runtime error.
///
/// Carries the source line of the faulting instruction (when the chunk has
/// line info for it) and the call stack at the point of failure, innermost
/// frame last.
#[derive(Debug, Clone, PartialEq)]
pub struct VmError {
    pub message: String,
    pub line: Option<usize>,
    pub trace: Vec<String>,
}

impl VmError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            trace: Vec::new(),
        }
    }

    /// Render the error followed by its stack trace.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        for frame in self.trace.iter().rev() {
            out.push_str("\n  at ");
            out.push_str(frame);
        }
        out
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error: {}", self.message)?;
        if let Some(line) = self.line {
            write!(f, " (line {})", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for VmError {}

impl From<String> for VmError {
    fn from(message: String) -> Self {
        VmError::new(message)
    }
}

impl From<&str> for VmError {
    fn from(message: &str) -> Self {
        VmError::new(message)
    }
}
