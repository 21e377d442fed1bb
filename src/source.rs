use serde::{Deserialize, Serialize};

/// The text of one template together with its logical name and physical path.
///
/// Sources are immutable; errors keep their own copy so a loader swapping its
/// backing store cannot change a diagnostic that was already raised.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Source {
    code: String,
    name: String,
    path: String,
}

impl Source {
    pub fn new(code: impl Into<String>, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Same identity, code blanked. Compiled units keep this shape unless
    /// `debug` is on.
    pub fn without_code(&self) -> Self {
        Self {
            code: String::new(),
            name: self.name.clone(),
            path: self.path.clone(),
        }
    }
}
