use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

use kiln_ast::PoolError;
use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// What kind of content problem a message reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    MissingConnection,
    UnknownTag,
    DuplicateName,
    LayoutStrategyMismatch,
    MissingLayout,
    UnsupportedBlock,
}

impl MessageKind {
    fn code(self) -> &'static str {
        match self {
            MessageKind::MissingConnection => "kiln::codegen::missing_connection",
            MessageKind::UnknownTag => "kiln::codegen::unknown_tag",
            MessageKind::DuplicateName => "kiln::codegen::duplicate_name",
            MessageKind::LayoutStrategyMismatch => "kiln::codegen::layout_strategy_mismatch",
            MessageKind::MissingLayout => "kiln::codegen::missing_layout",
            MessageKind::UnsupportedBlock => "kiln::codegen::unsupported_block",
        }
    }
}

/// A content problem found while generating code.
///
/// Generation recovers from every one of these with a placeholder, so they are
/// reported rather than returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CodegenMessage {
    pub severity: Severity,
    pub kind: MessageKind,
    pub message: String,
    /// Name of the node the message is about, when it has one.
    pub context: Option<SmolStr>,
}

impl Diagnostic for CodegenMessage {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.kind.code()))
    }

    fn severity(&self) -> Option<miette::Severity> {
        Some(match self.severity {
            Severity::Info => miette::Severity::Advice,
            Severity::Warning => miette::Severity::Warning,
            Severity::Error => miette::Severity::Error,
        })
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.context
            .as_ref()
            .map(|context| Box::new(format!("in node `{context}`")) as Box<dyn fmt::Display>)
    }
}

/// Collects [`CodegenMessage`]s from every generation task.
#[derive(Debug, Default)]
pub struct ErrorLog {
    messages: Mutex<Vec<CodegenMessage>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, severity: Severity, kind: MessageKind, message: impl Into<String>, context: Option<&str>) {
        let message = CodegenMessage {
            severity,
            kind,
            message: message.into(),
            context: context.map(SmolStr::new),
        };

        match severity {
            Severity::Info => tracing::info!(code = kind.code(), context = ?message.context, "{}", message.message),
            Severity::Warning => tracing::warn!(code = kind.code(), context = ?message.context, "{}", message.message),
            Severity::Error => tracing::error!(code = kind.code(), context = ?message.context, "{}", message.message),
        }

        self.messages.lock().unwrap_or_else(PoisonError::into_inner).push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn messages(&self) -> Vec<CodegenMessage> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn into_messages(self) -> Vec<CodegenMessage> {
        self.messages.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Error, Debug)]
pub enum CodegenError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Failed to start the generation thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to parse options: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidOption { field: &'static str, reason: String },
}
