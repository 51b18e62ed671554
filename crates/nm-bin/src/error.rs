//! Launcher error codes and user-facing formatting.
//!
//! Every initialization step owns a stable code so support can triage from a
//! screenshot. `format` renders the message, technical details, and a
//! suggestion for the player.

use std::fmt;

pub const INIT_LOG: &str = "INIT_LOG";
pub const INIT_CONFIG: &str = "INIT_CONFIG";
pub const INIT_DIRS: &str = "INIT_DIRS";
pub const INIT_PACKS: &str = "INIT_PACKS";
pub const INIT_INPUT: &str = "INIT_INPUT";
pub const INIT_SAVE: &str = "INIT_SAVE";
pub const INIT_LOCALE: &str = "INIT_LOCALE";
pub const INIT_SCRIPT: &str = "INIT_SCRIPT";
pub const RUNTIME: &str = "RUNTIME";

#[derive(Debug, Clone)]
pub struct LauncherError {
    pub code: &'static str,
    pub message: String,
    pub details: String,
    pub suggestion: String,
}

impl LauncherError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: String::new(),
            suggestion: String::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = suggestion.into();
        self
    }
}

impl fmt::Display for LauncherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.details.is_empty() {
            write!(f, "\n  details: {}", self.details)?;
        }
        if !self.suggestion.is_empty() {
            write!(f, "\n  try: {}", self.suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for LauncherError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_code_details_and_suggestion() {
        let err = LauncherError::new(INIT_PACKS, "no packs could be loaded")
            .with_details("packs_index.json listed 2 packs")
            .with_suggestion("verify the packs/ directory next to the executable");
        let text = err.to_string();
        assert!(text.contains("[INIT_PACKS]"));
        assert!(text.contains("details:"));
        assert!(text.contains("try:"));
    }
}
