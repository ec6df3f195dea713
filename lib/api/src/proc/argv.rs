//! Splitting command lines into arguments and the reverse.
use std::borrow::Cow;

use crate::{Error, Result};

/// Splits `cmdline` into arguments.
///
/// Unquoted whitespace separates arguments. Inside single quotes every
/// character is literal. Inside double quotes a backslash escapes only `"`
/// and `\`. Outside quotes a backslash escapes any character.
pub fn tokenize_to_argv(cmdline: &str) -> Result<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum State {
        Plain,
        Single,
        Double,
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut state = State::Plain;
    let mut chars = cmdline.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Plain => match c {
                c if c.is_whitespace() => {
                    if in_arg {
                        args.push(std::mem::take(&mut current));
                        in_arg = false;
                    }
                }
                '\'' => {
                    state = State::Single;
                    in_arg = true;
                }
                '"' => {
                    state = State::Double;
                    in_arg = true;
                }
                '\\' => {
                    // A trailing backslash stands for itself
                    current.push(chars.next().unwrap_or('\\'));
                    in_arg = true;
                }
                c => {
                    current.push(c);
                    in_arg = true;
                }
            },
            State::Single => match c {
                '\'' => state = State::Plain,
                c => current.push(c),
            },
            State::Double => match c {
                '"' => state = State::Plain,
                '\\' if matches!(chars.peek(), Some('"' | '\\')) => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                }
                c => current.push(c),
            },
        }
    }

    match state {
        State::Plain => {
            if in_arg {
                args.push(current);
            }
            Ok(args)
        }
        State::Single => Err(Error::invalid("unterminated single quote in command line")),
        State::Double => Err(Error::invalid("unterminated double quote in command line")),
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c)
}

/// Renders one argument for `/bin/sh`: bare when it consists only of
/// `[A-Za-z0-9_@%+=:,./-]`, single-quoted otherwise.
pub fn quote_argument(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && arg.chars().all(is_shell_safe) {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

/// Joins already quoted arguments into one shell command line.
pub fn command_line<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| quote_argument(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use portos_types::Errno;
    use pretty_assertions::assert_eq;

    fn argv(cmdline: &str) -> Vec<String> {
        tokenize_to_argv(cmdline).unwrap()
    }

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(argv("  ls   -l\t/tmp \n"), vec!["ls", "-l", "/tmp"]);
        assert!(argv("").is_empty());
        assert!(argv("   ").is_empty());
    }

    #[test]
    fn honours_quotes_and_escapes() {
        assert_eq!(
            argv(r#"echo "a b" 'c d' e\ f"#),
            vec!["echo", "a b", "c d", "e f"]
        );
        assert_eq!(argv(r#"x"y"'z'"#), vec!["xyz"]);
        assert_eq!(argv(r#"'it''s' "" ''"#), vec!["its", "", ""]);
        assert_eq!(argv(r#"'a\"b'"#), vec![r#"a\"b"#]);
        assert_eq!(argv(r#""a\"b\\c\d""#), vec![r#"a"b\c\d"#]);
        assert_eq!(argv(r"trailing\"), vec![r"trailing\"]);
        assert_eq!(argv(r"\'quoted\'"), vec!["'quoted'"]);
    }

    #[test]
    fn rejects_unterminated_quotes() {
        assert_eq!(tokenize_to_argv("'open").unwrap_err().code(), Errno::Inval);
        assert_eq!(tokenize_to_argv("\"open").unwrap_err().code(), Errno::Inval);
    }

    #[test]
    fn quotes_for_the_shell() {
        assert_eq!(quote_argument("plain-arg_1.txt"), "plain-arg_1.txt");
        assert_eq!(quote_argument("user@host:/a,b=c+d%"), "user@host:/a,b=c+d%");
        assert_eq!(quote_argument("two words"), "'two words'");
        assert_eq!(quote_argument("(x)"), "'(x)'");
        assert_eq!(quote_argument("it's"), r"'it'\''s'");
        assert_eq!(quote_argument(""), "''");
        assert_eq!(quote_argument("$HOME"), "'$HOME'");
        assert_eq!(
            command_line(&["printf", "%s\n", "a b"]),
            "printf '%s\n' 'a b'"
        );
    }

    #[test]
    fn quoting_survives_tokenizing() {
        let args = ["a b", "it's", "", "x\"y", "plain"];
        assert_eq!(argv(&command_line(&args)), args);
    }
}
