use std::fmt;

use thiserror::Error;

/// Which buffer of a binding context an access targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Output,
    Input,
    RenderParameters,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Output => write!(f, "output"),
            BufferKind::Input => write!(f, "input"),
            BufferKind::RenderParameters => write!(f, "render parameter"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum BindingError {
    #[error("Access of {size} bytes at offset {offset} overflows the {buffer} buffer of {capacity} bytes")]
    OutOfBounds {
        buffer: BufferKind,
        offset: usize,
        size: usize,
        capacity: usize,
    },
}

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("Failed to parse options: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
