//! Command template rendering with shell-safe quoting
//!
//! Command templates reference parameters as `@name`. Every parameter value is
//! substituted as a single POSIX shell token, so values may contain quotes,
//! `$`, backticks or newlines without changing the shape of the command.

use crate::error::{RemoteError, Result};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// `@name` placeholders not preceded by an identifier character or `@`,
/// so `user@host` and `@@` are left alone.
static PLACEHOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^A-Za-z0-9_@])@([A-Za-z_][A-Za-z0-9_]*)").expect("valid placeholder regex")
});

/// Command parameters keyed by placeholder name (without the `@`)
pub type CommandParameters = HashMap<String, String>;

/// Quote a value as one opaque POSIX shell token
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Placeholder names referenced by a template, in order of appearance
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER_PATTERN
        .captures_iter(template)
        .map(|caps| caps[2].to_string())
        .collect()
}

/// Substitute every `@name` placeholder with its escaped parameter value.
///
/// Fails with [`RemoteError::Sanitization`] if a placeholder has no value.
/// Parameters not referenced by the template are ignored.
pub fn render_command(template: &str, parameters: Option<&CommandParameters>) -> Result<String> {
    let empty = CommandParameters::new();
    let parameters = parameters.unwrap_or(&empty);

    if let Some(missing) = placeholders(template)
        .into_iter()
        .find(|name| !parameters.contains_key(name))
    {
        return Err(RemoteError::Sanitization {
            placeholder: missing,
        });
    }

    let rendered = PLACEHOLDER_PATTERN.replace_all(template, |caps: &Captures| {
        // presence checked above
        let value = parameters.get(&caps[2]).map(String::as_str).unwrap_or_default();
        format!("{}{}", &caps[1], shell_escape(value))
    });

    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> CommandParameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_shell_escape_quote_and_newline() {
        assert_eq!(shell_escape("I'm a test\n"), "'I'\\''m a test\n'");
    }

    #[test]
    fn test_shell_escape_metacharacters() {
        assert_eq!(shell_escape("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_escape("`id`"), "'`id`'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_render_substitutes_all_placeholders() {
        let rendered = render_command(
            "docker pull @image && docker tag @image @target",
            Some(&params(&[("image", "nginx:1.27"), ("target", "web")])),
        )
        .unwrap();
        assert_eq!(
            rendered,
            "docker pull 'nginx:1.27' && docker tag 'nginx:1.27' 'web'"
        );
    }

    #[test]
    fn test_render_missing_parameter() {
        let err = render_command("echo @greeting @name", Some(&params(&[("greeting", "hi")])))
            .unwrap_err();
        match err {
            RemoteError::Sanitization { placeholder } => assert_eq!(placeholder, "name"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_render_without_parameters() {
        assert_eq!(render_command("uptime", None).unwrap(), "uptime");
        assert!(render_command("echo @x", None).is_err());
    }

    #[test]
    fn test_email_like_text_is_not_a_placeholder() {
        let rendered = render_command("ssh deploy@host echo @msg", Some(&params(&[("msg", "ok")])))
            .unwrap();
        assert_eq!(rendered, "ssh deploy@host echo 'ok'");
    }

    #[test]
    fn test_longest_name_wins() {
        let rendered = render_command(
            "echo @dir @dir_name",
            Some(&params(&[("dir", "a"), ("dir_name", "b")])),
        )
        .unwrap();
        assert_eq!(rendered, "echo 'a' 'b'");
    }

    #[test]
    fn test_placeholders_listed_in_order() {
        assert_eq!(
            placeholders("@a x @b y@c (@d)"),
            vec!["a".to_string(), "b".to_string(), "d".to_string()]
        );
    }
}
