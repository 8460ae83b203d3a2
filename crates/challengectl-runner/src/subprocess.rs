// crates/challengectl-runner/src/subprocess.rs
// ============================================================================
// Module: Transmit Subprocess
// Description: Invocation of the opaque transmit and spectrum-paint
//              callables (spec.md §4.8, §9 Design Notes: "preserve subprocess
//              + join").
// Purpose: Keep a faulty or hanging external flowgraph from ever running on
//          the async runtime's own threads.
// Dependencies: tokio
// ============================================================================

//! ## Overview
//! The transmit callable is configuration, not code: an argv template with
//! `{freq_hz}`, `{device}`, `{modulation}`, and `{file}` placeholders,
//! substituted once per invocation and run with `std::process::Command`
//! inside `tokio::task::spawn_blocking`. `{file}` is special: a template
//! argument equal to exactly `{file}` expands to one argv entry per resolved
//! file path rather than a single substituted string, since a challenge may
//! reference any number of files.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;

use crate::error::RunnerError;

// ============================================================================
// SECTION: Invocation Context
// ============================================================================

/// The substitution values available to a transmit or spectrum-paint argv
/// template.
#[derive(Debug, Clone)]
pub struct TransmitContext<'a> {
    /// The frequency selected for this attempt, in Hz.
    pub freq_hz: u64,
    /// The device identifier selected for this attempt.
    pub device: &'a str,
    /// The challenge's waveform family identifier.
    pub modulation: &'a str,
    /// Resolved local paths for every file the challenge's config references.
    pub files: &'a [PathBuf],
}

/// Expands `template` against `ctx`, substituting placeholders inside each
/// argument and expanding a bare `{file}` argument into one entry per
/// resolved file path.
#[must_use]
pub fn expand_argv(template: &[String], ctx: &TransmitContext<'_>) -> Vec<String> {
    let mut argv = Vec::with_capacity(template.len() + ctx.files.len());
    for arg in template {
        if arg == "{file}" {
            argv.extend(ctx.files.iter().map(|path| path.to_string_lossy().into_owned()));
            continue;
        }
        let substituted = arg.replace("{freq_hz}", &ctx.freq_hz.to_string()).replace("{device}", ctx.device).replace("{modulation}", ctx.modulation);
        argv.push(substituted);
    }
    argv
}

/// Runs `argv[0]` with `argv[1..]` as arguments inside `working_dir`, waiting
/// for it to exit.
///
/// # Errors
///
/// Returns [`RunnerError::Subprocess`] if the command is empty, fails to
/// spawn, or exits non-zero. Stderr is included in the error message on
/// failure; stdout and stderr are otherwise discarded (the challenge's
/// outcome is reported through [`crate::client::ControllerClient::report_complete`],
/// not by forwarding the callable's own output).
pub async fn run(argv: Vec<String>, working_dir: &Path) -> Result<(), RunnerError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(RunnerError::Subprocess("empty command template".to_owned()));
    };
    let program = program.clone();
    let args = args.to_vec();
    let working_dir = working_dir.to_path_buf();

    let output = tokio::task::spawn_blocking(move || {
        Command::new(&program).args(&args).current_dir(&working_dir).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).output()
    })
    .await
    .map_err(|err| RunnerError::Subprocess(err.to_string()))?
    .map_err(|err| RunnerError::Subprocess(format!("failed to spawn {program}: {err}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(RunnerError::Subprocess(format!("{program} exited with {}: {stderr}", output.status)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]
    use super::*;

    #[test]
    fn expand_argv_substitutes_scalar_placeholders() {
        let template = vec!["transmit".to_owned(), "--freq".to_owned(), "{freq_hz}".to_owned(), "--mod={modulation}".to_owned()];
        let ctx = TransmitContext { freq_hz: 146_520_000, device: "hackrf-0", modulation: "fsk", files: &[] };
        let argv = expand_argv(&template, &ctx);
        assert_eq!(argv, vec!["transmit", "--freq", "146520000", "--mod=fsk"]);
    }

    #[test]
    fn expand_argv_expands_file_placeholder_to_multiple_args() {
        let template = vec!["transmit".to_owned(), "--file".to_owned(), "{file}".to_owned()];
        let files = vec![PathBuf::from("/tmp/a.bin"), PathBuf::from("/tmp/b.bin")];
        let ctx = TransmitContext { freq_hz: 1, device: "d", modulation: "m", files: &files };
        let argv = expand_argv(&template, &ctx);
        assert_eq!(argv, vec!["transmit", "--file", "/tmp/a.bin", "/tmp/b.bin"]);
    }

    #[tokio::test]
    async fn run_succeeds_on_zero_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        run(vec!["true".to_owned()], dir.path()).await.expect("true exits zero");
    }

    #[tokio::test]
    async fn run_fails_on_nonzero_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = run(vec!["false".to_owned()], dir.path()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_fails_on_empty_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = run(vec![], dir.path()).await;
        assert!(matches!(result, Err(RunnerError::Subprocess(_))));
    }
}
