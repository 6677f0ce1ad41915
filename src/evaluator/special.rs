//! Special commands: `%` directives and `$` shell escapes.
//!
//! Only the leading lines of a cell are scanned. Blank lines are skipped and
//! the scan stops at the first line that is not a special command.

use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::{OutErr, StreamWriter};
use crate::kernel::stream::Utf8Pending;
use crate::types::{Error, Result};

pub const DIRECTIVE_MARKER: char = '%';
pub const SHELL_ESCAPE_MARKER: char = '$';

/// A special command line with its marker stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCommand<'a> {
    Directive(&'a str),
    ShellEscape(&'a str),
}

/// Split the leading special commands off `code`.
///
/// Command lines are blanked rather than removed so line numbers in the
/// remaining code stay the same.
pub fn split_special_commands(code: &str) -> (Vec<SpecialCommand<'_>>, String) {
    let mut commands = Vec::new();
    let mut lines: Vec<&str> = code.split('\n').collect();
    for line in lines.iter_mut() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let command = if let Some(rest) = trimmed.strip_prefix(DIRECTIVE_MARKER) {
            SpecialCommand::Directive(rest.trim())
        } else if let Some(rest) = trimmed.strip_prefix(SHELL_ESCAPE_MARKER) {
            SpecialCommand::ShellEscape(rest.trim())
        } else {
            break;
        };
        commands.push(command);
        *line = "";
    }
    (commands, lines.join("\n"))
}

/// Run `command_line` as a child process, streaming its output into
/// `out_err`. A non-zero exit status is an evaluation error.
pub async fn run_shell_escape(command_line: &str, out_err: &OutErr) -> Result<()> {
    let mut args = command_line.split_whitespace();
    let Some(program) = args.next() else {
        return Ok(());
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::evaluation(format!("error starting command {:?}: {}", command_line, e)))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (out, err, status) = tokio::join!(
        copy_into(stdout, &out_err.out),
        copy_into(stderr, &out_err.err),
        child.wait(),
    );
    out?;
    err?;

    let status = status?;
    if !status.success() {
        return Err(Error::evaluation(format!(
            "command {:?} failed: {}",
            command_line, status
        )));
    }
    Ok(())
}

/// Copy a pipe into a stream writer, holding back incomplete UTF-8 sequences
/// until the rest of the character arrives.
async fn copy_into<R: AsyncRead + Unpin>(reader: Option<R>, writer: &StreamWriter) -> Result<()> {
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = [0u8; 4096];
    let mut pending = Utf8Pending::default();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_text(pending.push(&buf[..n]));
    }
    writer.write_text(pending.flush());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_leading_commands() {
        let (commands, rest) = split_special_commands("%help\n  $ls -l\n\n1+1\n%late");
        assert_eq!(
            commands,
            vec![SpecialCommand::Directive("help"), SpecialCommand::ShellEscape("ls -l")]
        );
        assert_eq!(rest, "\n\n\n1+1\n%late");
    }

    #[test]
    fn test_plain_code_untouched() {
        let (commands, rest) = split_special_commands("x = 1\n$not_a_command");
        assert!(commands.is_empty());
        assert_eq!(rest, "x = 1\n$not_a_command");
    }

    #[test]
    fn test_only_commands() {
        let (commands, rest) = split_special_commands("$echo hi");
        assert_eq!(commands, vec![SpecialCommand::ShellEscape("echo hi")]);
        assert_eq!(rest.trim(), "");
    }

    #[tokio::test]
    async fn test_shell_escape_streams_stdout() {
        let (pair, mut out_rx, _err_rx) = OutErr::detached();
        run_shell_escape("echo hi", &pair).await.unwrap();
        drop(pair);

        let mut out = String::new();
        while let Some(chunk) = out_rx.recv().await {
            out.push_str(&chunk);
        }
        assert_eq!(out, "hi\n");
    }

    #[tokio::test]
    async fn test_shell_escape_failure_is_evaluation_error() {
        let (pair, _out_rx, _err_rx) = OutErr::detached();
        let err = run_shell_escape("false", &pair).await.unwrap_err();
        assert!(matches!(err, Error::Evaluation(_)));

        let err = run_shell_escape("definitely-not-a-real-program-xyz", &pair)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("error starting command"));
    }

    #[tokio::test]
    async fn test_empty_shell_escape_is_noop() {
        let (pair, _out_rx, _err_rx) = OutErr::detached();
        assert!(run_shell_escape("   ", &pair).await.is_ok());
    }
}
