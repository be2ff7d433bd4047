use thiserror::Error;

/// A failure to reconcile two observations of the same coverage entity.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    /// Same identity, irreconcilable attributes (e.g. a function on two lines
    /// under strict merge mode).
    #[error("{location} {message}")]
    MergeAssertion { location: String, message: String },

    #[error("{location} source file changed between runs (md5 {left} vs {right})")]
    SourceChanged {
        location: String,
        left: String,
        right: String,
    },

    /// Same key, different shape (decision variant, condition slot count, ...).
    #[error("{location} {message}")]
    StructuralConflict { location: String, message: String },

    #[error("{location} {message}")]
    InvalidData { location: String, message: String },
}

impl MergeError {
    pub fn assertion(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MergeAssertion {
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn conflict(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StructuralConflict {
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn invalid(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidData {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Process exit status for this class of failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            MergeError::MergeAssertion { .. } => 64,
            MergeError::SourceChanged { .. } => 65,
            MergeError::StructuralConflict { .. } => 66,
            MergeError::InvalidData { .. } => 67,
        }
    }

    #[must_use]
    pub fn location(&self) -> &str {
        match self {
            MergeError::MergeAssertion { location, .. }
            | MergeError::SourceChanged { location, .. }
            | MergeError::StructuralConflict { location, .. }
            | MergeError::InvalidData { location, .. } => location,
        }
    }

    fn location_mut(&mut self) -> &mut String {
        match self {
            MergeError::MergeAssertion { location, .. }
            | MergeError::SourceChanged { location, .. }
            | MergeError::StructuralConflict { location, .. }
            | MergeError::InvalidData { location, .. } => location,
        }
    }

    /// Prefix the location with the file the entity belongs to.
    #[must_use]
    pub fn in_file(mut self, filename: &str) -> Self {
        let loc = self.location_mut();
        *loc = if loc.is_empty() {
            filename.to_string()
        } else {
            format!("{filename}:{loc}")
        };
        self
    }

    /// Nest the location inside a parent entity, e.g. a condition on a line
    /// becomes `12 (condition 1)`.
    #[must_use]
    pub fn within(mut self, parent: &str) -> Self {
        let loc = self.location_mut();
        *loc = if loc.is_empty() {
            parent.to_string()
        } else {
            format!("{parent} ({loc})")
        };
        self
    }
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// Every merge failure of one batch, reported together.
#[derive(Error, Debug, Clone, PartialEq, Default)]
#[error("{}", list_errors(.0))]
pub struct MergeErrors(pub Vec<MergeError>);

fn list_errors(errors: &[MergeError]) -> String {
    let mut out = format!("{} merge error(s):", errors.len());
    for err in errors {
        out.push_str(&format!("\n  {err}"));
    }
    out
}

impl MergeErrors {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, err: MergeError) {
        self.0.push(err);
    }

    pub fn iter(&self) -> impl Iterator<Item = &MergeError> {
        self.0.iter()
    }

    /// Exit status of the first failure, or 0 if there was none.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.0.first().map_or(0, MergeError::exit_code)
    }

    pub fn into_result(self) -> std::result::Result<(), MergeErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

/// Failure of the parallel collection phase.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("coverage extraction failed: {0:#}")]
    Extraction(anyhow::Error),

    #[error(transparent)]
    Merge(#[from] MergeErrors),
}

impl CollectError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            CollectError::Extraction(_) => 1,
            CollectError::Merge(errs) => errs.exit_code(),
        }
    }
}

/// Failure to decode the JSON interchange encoding.
#[derive(Error, Debug)]
pub enum JsonError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported format version {found}, expected {expected}")]
    Version { found: String, expected: String },

    #[error(transparent)]
    Merge(#[from] MergeError),
}
