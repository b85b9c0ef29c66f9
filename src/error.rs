//! Crate-wide error kinds.
//!
//! The kinds here are deliberately coarse: a layer either sets up and runs, or it doesn't, and
//! the caller is expected to abort the containing operation rather than retry. See the module
//! docs on [`crate::engine`] for how these propagate out of a network's `setup`/`forward`.

use std::fmt;

/// A single decoded parameter or uniform requirement that was missing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingParam {
    pub layer_name: String,
    pub subkey: String,
    pub sublayer_index: usize,
}

impl fmt::Display for MissingParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}[{}]",
            self.layer_name, self.subkey, self.sublayer_index
        )
    }
}

/// Coarse, stable error kinds for the whole crate.
///
/// Each variant carries the context named in the error-handling design so that a caller can act
/// on the kind without scraping a message string.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A required adapter feature, limit, or backend capability was missing.
    #[error("required graphics capability unavailable: {detail}")]
    GfxUnavailable { detail: String },

    /// A shader failed to compile or a program failed to link.
    #[error("shader compile/link failure in {label}: {info_log}")]
    ShaderFailure {
        label: String,
        /// The fully `#include`-expanded source that was handed to the backend.
        expanded_source: String,
        info_log: String,
    },

    /// Texture/buffer allocation failed, or a framebuffer was incomplete.
    #[error("resource exhaustion: {detail}")]
    ResourceExhaustion { detail: String },

    /// A layer builder described an unsupported combination of kernel/group/format.
    #[error("invalid layer builder: {detail}")]
    InvalidBuilder { detail: String },

    /// A method was called out of lifecycle order (e.g. `forward` before `setup`).
    #[error("invalid state: {detail}")]
    InvalidState { detail: String },

    /// A parameter provider did not have a requested blob.
    #[error("missing parameter: {0}")]
    ParamMissing(MissingParam),

    /// A non-fatal I/O failure, e.g. writing a result dump.
    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn gfx_unavailable(detail: impl Into<String>) -> Self {
        Error::GfxUnavailable {
            detail: detail.into(),
        }
    }

    pub fn invalid_builder(detail: impl Into<String>) -> Self {
        Error::InvalidBuilder {
            detail: detail.into(),
        }
    }

    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Error::InvalidState {
            detail: detail.into(),
        }
    }

    pub fn resource_exhaustion(detail: impl Into<String>) -> Self {
        Error::ResourceExhaustion {
            detail: detail.into(),
        }
    }

    pub fn shader_failure(label: impl Into<String>, expanded_source: impl Into<String>, info_log: impl Into<String>) -> Self {
        Error::ShaderFailure {
            label: label.into(),
            expanded_source: expanded_source.into(),
            info_log: info_log.into(),
        }
    }
}
