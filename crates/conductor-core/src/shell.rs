//! Shell command construction.
//!
//! Every command the engine runs goes through the user's login shell so that
//! profile files, PATH additions and aliases exported there are honored.
//!
//! # Overview
//!
//! - Default wrapper is `$SHELL -l -c`
//! - Non-POSIX shells (fish, nushell, ...) fall back to bash or sh
//! - A custom prefix such as `/bin/zsh -l -c` can be configured
//!
//! The command string itself is handed to the shell untouched: it is shell
//! code written by the user, not a binary path that needs quoting.

use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShellError {
    #[error("Empty shell prefix")]
    EmptyPrefix,

    #[error("Invalid shell prefix: {0}")]
    InvalidPrefix(String),

    #[error("Empty command")]
    EmptyCommand,
}

/// Build a command that runs `command` inside a login shell.
///
/// The final invocation is `<prefix...> <command>`, e.g.
/// `/bin/zsh -l -c 'npm test'`.
#[cfg(unix)]
pub fn build_login_shell_command(
    command: &str,
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command, ShellError> {
    if command.trim().is_empty() {
        return Err(ShellError::EmptyCommand);
    }

    let prefix = get_shell_prefix(shell_prefix);
    let parts =
        shlex::split(&prefix).ok_or_else(|| ShellError::InvalidPrefix(prefix.clone()))?;
    let (program, args) = parts.split_first().ok_or(ShellError::EmptyPrefix)?;

    let mut cmd = Command::new(program);
    cmd.args(args).arg(command);

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    Ok(cmd)
}

/// Windows version: hands the command to `cmd /C` (no login shell concept).
#[cfg(windows)]
pub fn build_login_shell_command(
    command: &str,
    working_dir: Option<&str>,
    _shell_prefix: Option<&str>,
) -> Result<Command, ShellError> {
    if command.trim().is_empty() {
        return Err(ShellError::EmptyCommand);
    }

    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    Ok(cmd)
}

/// Get the shell prefix to use for command execution.
///
/// A non-empty custom prefix wins. Otherwise `$SHELL -l -c` is used, with a
/// bash/sh fallback when `$SHELL` does not understand `-l -c`.
#[cfg(unix)]
fn get_shell_prefix(custom_prefix: Option<&str>) -> String {
    if let Some(prefix) = custom_prefix {
        if !prefix.trim().is_empty() {
            return prefix.to_string();
        }
    }

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());

    let shell_name = std::path::Path::new(&shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    let non_posix = ["fish", "nu", "nushell", "elvish", "xonsh", "ion"];

    let effective_shell = if non_posix.iter().any(|&s| shell_name == s) {
        if std::path::Path::new("/bin/bash").exists() {
            "/bin/bash"
        } else {
            "/bin/sh"
        }
    } else {
        &shell
    };

    format!("{} -l -c", effective_shell)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn custom_prefix_is_used_verbatim() {
        assert_eq!(get_shell_prefix(Some("/bin/zsh -l -c")), "/bin/zsh -l -c");
        assert_eq!(get_shell_prefix(Some("/usr/bin/bash -c")), "/usr/bin/bash -c");
    }

    #[test]
    #[cfg(unix)]
    fn empty_or_missing_prefix_uses_login_default() {
        assert!(get_shell_prefix(Some("")).ends_with(" -l -c"));
        assert!(get_shell_prefix(Some("   ")).ends_with(" -l -c"));
        assert!(get_shell_prefix(None).ends_with(" -l -c"));
    }

    #[test]
    #[cfg(unix)]
    fn command_is_passed_as_single_shell_argument() {
        let cmd = build_login_shell_command("echo $HOME && ls", None, Some("/bin/bash -c"))
            .unwrap();
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program().to_str().unwrap(), "/bin/bash");
        let args: Vec<_> = std_cmd
            .get_args()
            .map(|a| a.to_str().unwrap().to_string())
            .collect();
        assert_eq!(args, vec!["-c", "echo $HOME && ls"]);
    }

    #[test]
    #[cfg(unix)]
    fn working_dir_is_applied() {
        let cmd = build_login_shell_command("pwd", Some("/tmp"), Some("/bin/sh -c")).unwrap();
        assert_eq!(
            cmd.as_std().get_current_dir(),
            Some(std::path::Path::new("/tmp"))
        );
    }

    #[test]
    #[cfg(unix)]
    fn quoted_prefix_is_split_like_a_shell() {
        let cmd = build_login_shell_command(
            "true",
            None,
            Some("'/opt/my shell/bin/sh' -c"),
        )
        .unwrap();
        assert_eq!(
            cmd.as_std().get_program().to_str().unwrap(),
            "/opt/my shell/bin/sh"
        );
    }

    #[test]
    fn blank_command_is_rejected() {
        let err = build_login_shell_command("  ", None, None).unwrap_err();
        assert_eq!(err, ShellError::EmptyCommand);
    }

    #[test]
    #[cfg(unix)]
    fn unbalanced_prefix_is_rejected() {
        let err = build_login_shell_command("true", None, Some("'/bin/sh -c")).unwrap_err();
        assert!(matches!(err, ShellError::InvalidPrefix(_)));
    }
}
