/// Represents an issue found while validating a composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// A hard error: the composition cannot be built.
    Error(String),
    /// A warning: the composition builds, but probably not as intended.
    Warning(String),
}

/// The result of a composition validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.issues.push(ValidationIssue::Error(msg.into()));
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.issues.push(ValidationIssue::Warning(msg.into()));
    }

    pub fn is_safe(&self) -> bool {
        !self.issues.iter().any(|i| matches!(i, ValidationIssue::Error(_)))
    }

    pub fn has_warnings(&self) -> bool {
        self.issues.iter().any(|i| matches!(i, ValidationIssue::Warning(_)))
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.issues.iter().filter_map(|i| match i {
            ValidationIssue::Error(msg) => Some(msg.as_str()),
            ValidationIssue::Warning(_) => None,
        })
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.issues.iter().filter_map(|i| match i {
            ValidationIssue::Warning(msg) => Some(msg.as_str()),
            ValidationIssue::Error(_) => None,
        })
    }

    pub fn log_summary(&self) {
        if self.is_safe() && !self.has_warnings() {
            log::info!("Composition validation passed");
            return;
        }

        for issue in &self.issues {
            match issue {
                ValidationIssue::Error(msg) => log::error!("Composition error: {}", msg),
                ValidationIssue::Warning(msg) => log::warn!("Composition warning: {}", msg),
            }
        }
    }
}
