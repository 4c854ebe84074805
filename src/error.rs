//! Typed errors for the selective-compilation pipeline
//!
//! Every failure that can surface from `run_cell` carries a kind tag and a
//! human-readable message. Partial-evaluation fallback is not an error and
//! never appears here.

use std::fmt;

/// Compilation / caching error surfaced to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NbError {
    /// The input tree is malformed: bad hole annotation, nested holes,
    /// or a missing top-level block.
    InvalidAst { message: String },

    /// The IR builder met an expression form it cannot lower, or signature
    /// inference produced a mismatch.
    IrBuild { message: String },

    /// The constructed IR module failed the verifier.
    Verification { message: String },

    /// Object emission or the linker subprocess failed.
    Backend { message: String },

    /// The OS could not open a shared object or a symbol was absent.
    Load { path: String, message: String },

    /// Internal cache invariant breach. Fatal.
    CacheInvariant { message: String },
}

impl NbError {
    pub fn invalid_ast(message: impl Into<String>) -> Self {
        NbError::InvalidAst {
            message: message.into(),
        }
    }

    pub fn ir_build(message: impl Into<String>) -> Self {
        NbError::IrBuild {
            message: message.into(),
        }
    }

    pub fn verification(message: impl Into<String>) -> Self {
        NbError::Verification {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        NbError::Backend {
            message: message.into(),
        }
    }

    pub fn load(path: impl Into<String>, message: impl Into<String>) -> Self {
        NbError::Load {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn cache_invariant(message: impl Into<String>) -> Self {
        NbError::CacheInvariant {
            message: message.into(),
        }
    }

    /// Stable kind tag for host-side dispatch.
    pub fn kind(&self) -> &'static str {
        match self {
            NbError::InvalidAst { .. } => "invalid-ast",
            NbError::IrBuild { .. } => "ir-build",
            NbError::Verification { .. } => "verification",
            NbError::Backend { .. } => "backend",
            NbError::Load { .. } => "load",
            NbError::CacheInvariant { .. } => "cache-invariant",
        }
    }
}

impl fmt::Display for NbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NbError::InvalidAst { message } => write!(f, "invalid AST: {}", message),
            NbError::IrBuild { message } => write!(f, "IR build error: {}", message),
            NbError::Verification { message } => write!(f, "IR verification failed: {}", message),
            NbError::Backend { message } => write!(f, "backend failure: {}", message),
            NbError::Load { path, message } => {
                write!(f, "load failure for '{}': {}", path, message)
            }
            NbError::CacheInvariant { message } => {
                write!(f, "cache invariant violated: {}", message)
            }
        }
    }
}

impl std::error::Error for NbError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_and_message() {
        let e = NbError::load("/tmp/x.so", "no such file");
        assert_eq!(e.kind(), "load");
        assert!(e.to_string().contains("/tmp/x.so"));
        assert!(e.to_string().contains("no such file"));
    }
}
