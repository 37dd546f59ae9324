//! Input validation for every user-derived string.
//!
//! Shell metacharacters are a [`MuxError::Security`] wherever they appear.
//! Other malformed input (empty, too long, characters outside the field's
//! alphabet) is a [`MuxError::Validation`]. `scan_argv` repeats the
//! metacharacter check over the fully rendered argv.

use regex::{Regex, RegexSet};
use std::path::{Component, Path};

use crate::error::MuxError;
use crate::textutil::truncate_with_suffix_by_chars;
use crate::tmux::{FieldKind, MuxOperation};

/// Substrings never admitted in any argument.
pub const SHELL_METACHARACTERS: &[&str] = &[
    ";", "&", "|", "`", "$(", "${", ">", "<", "\n", "\r", "\0",
];

/// `sun_path` limit on Linux, including the terminator.
const MAX_SOCKET_PATH_BYTES: usize = 107;
const MAX_IDENTIFIER_CHARS: usize = 64;
const MAX_TARGET_CHARS: usize = 128;
const MAX_KEY_CHARS: usize = 32;

/// Destructive command shapes refused even without metacharacters.
const DENIED_COMMAND_PATTERNS: &[&str] = &[
    r"(?i)\brm\s+-[a-z]*[rf][a-z]*\s+(/|~|\*)(\s|$)",
    r"(?i)\bmkfs(\.\w+)?\b",
    r"(?i)\bdd\s+if=",
    r"(?i)\b(shutdown|reboot|halt|poweroff)\b",
    r":\(\)\s*\{",
    r"(?i)\bchmod\s+-R\s+0?777\s+/(\s|$)",
];

/// First metacharacter found in `text`, if any.
pub fn find_metacharacter(text: &str) -> Option<&'static str> {
    SHELL_METACHARACTERS
        .iter()
        .copied()
        .find(|meta| text.contains(meta))
}

fn printable(text: &str) -> String {
    truncate_with_suffix_by_chars(&text.escape_debug().to_string(), 40, "...")
}

/// Stateless validator. Construct once and share.
#[derive(Debug, Clone)]
pub struct InputValidator {
    max_command_length: usize,
    denied: RegexSet,
    traversal: Regex,
}

impl InputValidator {
    pub fn new(max_command_length: usize) -> Result<Self, MuxError> {
        let pattern_error = |e: regex::Error| MuxError::Execution(format!("validator pattern: {e}"));
        Ok(Self {
            max_command_length,
            denied: RegexSet::new(DENIED_COMMAND_PATTERNS).map_err(pattern_error)?,
            traversal: Regex::new(r"(^|/)\.\.?(/|$)|//|~").map_err(pattern_error)?,
        })
    }

    fn reject_metacharacters(&self, field: &str, value: &str) -> Result<(), MuxError> {
        if let Some(meta) = find_metacharacter(value) {
            return Err(MuxError::Security(format!(
                "{field} contains shell metacharacter `{}`",
                meta.escape_debug()
            )));
        }
        Ok(())
    }

    /// Socket paths must be absolute, normalized, and fit in `sun_path`.
    pub fn validate_socket_path(&self, path: &Path) -> Result<(), MuxError> {
        let text = path.to_string_lossy();
        self.reject_metacharacters("socket path", &text)?;
        if !path.is_absolute() {
            return Err(MuxError::Validation("socket path must be absolute".into()));
        }
        let suspicious = self.traversal.is_match(&text)
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::CurDir));
        if suspicious {
            return Err(MuxError::Security(
                "socket path contains traversal or home-relative segments".into(),
            ));
        }
        if text.len() > MAX_SOCKET_PATH_BYTES {
            return Err(MuxError::Validation(format!(
                "socket path exceeds {MAX_SOCKET_PATH_BYTES} bytes"
            )));
        }
        Ok(())
    }

    /// Session and window names: `[A-Za-z0-9_-]`, not starting with `-`.
    pub fn validate_identifier(&self, field: &str, value: &str) -> Result<(), MuxError> {
        self.reject_metacharacters(field, value)?;
        if value.is_empty() {
            return Err(MuxError::Validation(format!("{field} cannot be empty")));
        }
        if value.chars().count() > MAX_IDENTIFIER_CHARS {
            return Err(MuxError::Validation(format!(
                "{field} exceeds {MAX_IDENTIFIER_CHARS} characters"
            )));
        }
        if value.starts_with('-') {
            return Err(MuxError::Validation(format!("{field} cannot start with `-`")));
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(MuxError::Validation(format!(
                "{field} `{}` contains disallowed character `{}`",
                printable(value),
                bad.escape_debug()
            )));
        }
        Ok(())
    }

    /// Target expressions such as `=name:`, `%12`, `@3` or `=name:1.0`.
    pub fn validate_target(&self, value: &str) -> Result<(), MuxError> {
        self.reject_metacharacters("target", value)?;
        if value.is_empty() || value.chars().count() > MAX_TARGET_CHARS {
            return Err(MuxError::Validation(format!(
                "target must be 1..={MAX_TARGET_CHARS} characters"
            )));
        }
        if value.starts_with('-') {
            return Err(MuxError::Validation("target cannot start with `-`".into()));
        }
        let allowed = |c: char| c.is_ascii_alphanumeric() || "=:%@._-".contains(c);
        if let Some(bad) = value.chars().find(|c| !allowed(*c)) {
            return Err(MuxError::Validation(format!(
                "target `{}` contains disallowed character `{}`",
                printable(value),
                bad.escape_debug()
            )));
        }
        Ok(())
    }

    /// Literal text typed into a pane.
    pub fn validate_command_text(&self, text: &str) -> Result<(), MuxError> {
        self.reject_metacharacters("command", text)?;
        if self.denied.is_match(text) {
            return Err(MuxError::Security(format!(
                "command `{}` matches a denied pattern",
                printable(text)
            )));
        }
        if text.chars().count() > self.max_command_length {
            return Err(MuxError::Validation(format!(
                "command exceeds {} characters",
                self.max_command_length
            )));
        }
        if let Some(bad) = text.chars().find(|c| c.is_control() && *c != '\t') {
            return Err(MuxError::Validation(format!(
                "command contains control character `{}`",
                bad.escape_debug()
            )));
        }
        Ok(())
    }

    /// tmux key names: `Enter`, `C-c`, `M-x`, `F5`, `Up`.
    pub fn validate_key(&self, key: &str) -> Result<(), MuxError> {
        self.reject_metacharacters("key", key)?;
        let ok = !key.is_empty()
            && key.len() <= MAX_KEY_CHARS
            && !key.starts_with('-')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !ok {
            return Err(MuxError::Validation(format!(
                "key `{}` is not a recognised key name",
                printable(key)
            )));
        }
        Ok(())
    }

    /// Shell binaries must be absolute paths without whitespace.
    pub fn validate_shell(&self, shell: &str) -> Result<(), MuxError> {
        self.reject_metacharacters("shell", shell)?;
        let path = Path::new(shell);
        if !path.is_absolute() || shell.chars().any(char::is_whitespace) {
            return Err(MuxError::Validation(
                "shell must be an absolute path without arguments".into(),
            ));
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(MuxError::Security("shell path contains traversal".into()));
        }
        Ok(())
    }

    /// Validate every user-derived field of an operation.
    pub fn validate_operation(&self, op: &MuxOperation) -> Result<(), MuxError> {
        // Metacharacter checks run over all fields first so a security
        // violation is never masked by an unrelated validation failure.
        for (field, _, value) in op.user_fields() {
            self.reject_metacharacters(field, value)?;
        }
        for (field, kind, value) in op.user_fields() {
            match kind {
                FieldKind::Identifier => self.validate_identifier(field, value)?,
                FieldKind::Target => self.validate_target(value)?,
                FieldKind::CommandText => self.validate_command_text(value)?,
                FieldKind::Key => self.validate_key(value)?,
                FieldKind::Shell => self.validate_shell(value)?,
            }
        }
        Ok(())
    }

    /// Final pass over a rendered argv.
    pub fn scan_argv(&self, argv: &[String]) -> Result<(), MuxError> {
        for (index, arg) in argv.iter().enumerate() {
            if let Some(meta) = find_metacharacter(arg) {
                return Err(MuxError::Security(format!(
                    "rendered argument {index} contains shell metacharacter `{}`",
                    meta.escape_debug()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn validator() -> InputValidator {
        InputValidator::new(256).unwrap()
    }

    fn is_security(result: Result<(), MuxError>) -> bool {
        matches!(result, Err(MuxError::Security(_)))
    }

    fn is_validation(result: Result<(), MuxError>) -> bool {
        matches!(result, Err(MuxError::Validation(_)))
    }

    #[test]
    fn denied_patterns_compile() {
        assert!(RegexSet::new(DENIED_COMMAND_PATTERNS).is_ok());
    }

    #[test]
    fn socket_paths_must_be_absolute_and_clean() {
        let v = validator();
        assert!(v.validate_socket_path(Path::new("/tmp/muxctl/default.sock")).is_ok());
        assert!(is_validation(v.validate_socket_path(Path::new("relative.sock"))));
        assert!(is_security(v.validate_socket_path(Path::new("/tmp/../etc/sock"))));
        assert!(is_security(v.validate_socket_path(Path::new("/tmp//x.sock"))));
        assert!(is_security(v.validate_socket_path(Path::new("/tmp/x;rm.sock"))));
        let long = PathBuf::from(format!("/tmp/{}", "a".repeat(120)));
        assert!(is_validation(v.validate_socket_path(&long)));
    }

    #[test]
    fn metacharacters_are_security_errors_in_every_field() {
        let v = validator();
        for meta in ["a;b", "a&&b", "a|b", "a`b`", "$(id)", "${HOME}", "a>b", "a<b", "a\nb"] {
            assert!(is_security(v.validate_identifier("session", meta)), "{meta:?}");
            assert!(is_security(v.validate_target(meta)), "{meta:?}");
            assert!(is_security(v.validate_command_text(meta)), "{meta:?}");
            assert!(is_security(v.validate_key(meta)), "{meta:?}");
            assert!(is_security(v.scan_argv(&[meta.to_string()])), "{meta:?}");
        }
    }

    #[test]
    fn identifiers_reject_spaces_as_validation_errors() {
        let v = validator();
        assert!(v.validate_identifier("session", "work-1_a").is_ok());
        assert!(is_validation(v.validate_identifier("session", "has space")));
        assert!(is_validation(v.validate_identifier("session", "")));
        assert!(is_validation(v.validate_identifier("session", "-t")));
        assert!(is_validation(v.validate_identifier("session", &"x".repeat(65))));
    }

    #[test]
    fn targets_accept_tmux_addressing_forms() {
        let v = validator();
        for target in ["=s1:", "%12", "@3", "=work-1:0.1", "s1"] {
            assert!(v.validate_target(target).is_ok(), "{target}");
        }
        assert!(is_validation(v.validate_target("s 1")));
    }

    #[test]
    fn command_text_rules() {
        let v = validator();
        assert!(v.validate_command_text("echo hi").is_ok());
        assert!(v.validate_command_text("ls -la\t/tmp").is_ok());
        assert!(is_security(v.validate_command_text("echo test; rm -rf /")));
        assert!(is_security(v.validate_command_text("rm -rf /")));
        assert!(is_security(v.validate_command_text("sudo reboot")));
        assert!(v.validate_command_text("rm -rf ./build").is_ok());
        assert!(is_validation(v.validate_command_text(&"a".repeat(257))));
        assert!(is_validation(v.validate_command_text("bell\u{7}")));
    }

    #[test]
    fn operation_validation_prefers_security_over_validation() {
        let v = validator();
        let op = MuxOperation::NewSession {
            name: "has space".into(),
            window_name: Some("w;x".into()),
            shell: None,
            width: None,
            height: None,
        };
        assert!(is_security(v.validate_operation(&op)));
    }

    #[test]
    fn shells_must_be_absolute() {
        let v = validator();
        assert!(v.validate_shell("/bin/bash").is_ok());
        assert!(is_validation(v.validate_shell("bash")));
        assert!(is_validation(v.validate_shell("/bin/sh -c id")));
        assert!(is_security(v.validate_shell("/bin/../tmp/sh")));
    }

    #[test]
    fn scan_argv_accepts_rendered_formats() {
        let v = validator();
        let op = MuxOperation::ListSessions;
        for argv in op.render() {
            assert!(v.scan_argv(&argv).is_ok());
        }
    }
}

#[cfg(all(test, feature = "fuzz-tests"))]
mod fuzz_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn any_embedded_metacharacter_is_rejected(
            prefix in "[a-z0-9 ]{0,16}",
            meta in prop::sample::select(SHELL_METACHARACTERS.to_vec()),
            suffix in "[a-z0-9 ]{0,16}",
        ) {
            let text = format!("{prefix}{meta}{suffix}");
            let v = InputValidator::new(4096).unwrap();
            prop_assert!(matches!(v.validate_command_text(&text), Err(MuxError::Security(_))));
            prop_assert!(matches!(v.validate_target(&text), Err(MuxError::Security(_))));
        }

        #[test]
        fn plain_identifiers_are_accepted(name in "[a-z][a-z0-9_-]{0,40}") {
            let v = InputValidator::new(4096).unwrap();
            prop_assert!(v.validate_identifier("session", &name).is_ok());
        }
    }
}
