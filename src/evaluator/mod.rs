//! Language back-end contract.
//!
//! The kernel never interprets code itself. It hands every request to an
//! [`Evaluator`] and turns the outcome into protocol messages.

pub mod calc;
pub mod special;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use crate::kernel::receipt::DisplayHandle;
pub use crate::kernel::stream::{OutErr, StreamName, StreamWriter};
pub use calc::CalcEvaluator;
pub use special::SpecialCommand;

use crate::data::Data;
use crate::types::{Error, Result};
use crate::wire::PROTOCOL_VERSION;

/// Language description inside `kernel_info_reply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub name: String,
    pub version: String,
    pub mimetype: String,
    pub file_extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pygments_lexer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codemirror_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelpLink {
    pub text: String,
    pub url: String,
}

/// Content of `kernel_info_reply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub protocol_version: String,
    pub implementation: String,
    pub implementation_version: String,
    pub language_info: LanguageInfo,
    pub banner: String,
    #[serde(default)]
    pub help_links: Vec<HelpLink>,
}

impl KernelInfo {
    /// Info for `implementation` at the protocol version this crate speaks.
    pub fn new(implementation: &str, implementation_version: &str, language_info: LanguageInfo) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            implementation: implementation.to_string(),
            implementation_version: implementation_version.to_string(),
            language_info,
            banner: String::new(),
            help_links: Vec::new(),
        }
    }
}

/// Completion candidates replacing `code[cursor_start..cursor_end]`,
/// measured in characters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub cursor_start: usize,
    pub cursor_end: usize,
    pub matches: Vec<String>,
}

/// A language back-end.
///
/// Calls for one execution arrive in this order: `setup_display`,
/// `remove_special_commands`, `evaluate`, `teardown_display`. Calls never
/// overlap. Anything written to the [`OutErr`] pair must be written before
/// the call returns.
#[async_trait]
pub trait Evaluator: Send + Sync + fmt::Debug {
    fn kernel_info(&self) -> KernelInfo;

    /// Candidates for the identifier ending at `cursor_pos`.
    fn complete(&self, code: &str, cursor_pos: usize) -> Completion;

    /// Install the display callback for the current execution.
    fn setup_display(&self, display: DisplayHandle);

    /// Remove the callback installed by `setup_display`.
    fn teardown_display(&self);

    /// Execute the leading `%` directives and `$` shell escapes of `code`,
    /// returning the rest of the code with those lines blanked.
    async fn remove_special_commands(&self, out_err: &OutErr, code: &str) -> Result<String> {
        let (commands, rest) = special::split_special_commands(code);
        for command in commands {
            match command {
                SpecialCommand::Directive(line) => self.run_directive(line, out_err).await?,
                SpecialCommand::ShellEscape(line) => special::run_shell_escape(line, out_err).await?,
            }
        }
        Ok(rest)
    }

    /// Run one `%` directive; `line` excludes the marker.
    async fn run_directive(&self, line: &str, _out_err: &OutErr) -> Result<()> {
        Err(Error::evaluation(format!(
            "unknown special command: \"%{}\"",
            line
        )))
    }

    /// Evaluate `code`. Empty [`Data`] means there is nothing to show.
    async fn evaluate(&self, code: &str, out_err: &OutErr) -> Result<Data>;
}
