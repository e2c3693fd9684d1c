//! Shell escaping.
//!
//! Escaping is table driven: callers pass the character mappings for the
//! quoting context they are writing into instead of relying on one global
//! convention. When a command can be expressed as an argument vector, prefer
//! [`join_argv`] (or [`crate::Command::from_argv`]) over hand interpolation.

/// Mappings for text placed inside POSIX single quotes.
pub const POSIX_SINGLE_QUOTED: &[(char, &str)] = &[('\'', r"'\''")];

/// Mappings for text placed inside POSIX double quotes.
pub const POSIX_DOUBLE_QUOTED: &[(char, &str)] = &[
    ('\\', r"\\"),
    ('"', r#"\""#),
    ('$', r"\$"),
    ('`', r"\`"),
];

/// Mappings for text placed inside cmd.exe double quotes.
pub const CMD_DOUBLE_QUOTED: &[(char, &str)] = &[('"', "\"\""), ('%', "%%")];

/// Replace every character found in `table` with its mapping, leaving the
/// rest untouched.
pub fn escape_with(input: &str, table: &[(char, &str)]) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match table.iter().find(|(from, _)| *from == c) {
            Some((_, to)) => out.push_str(to),
            None => out.push(c),
        }
    }
    out
}

/// Quote `s` as a single literal POSIX shell word. Simple words are returned
/// bare.
pub fn posix_quote(s: &str) -> String {
    if is_simple_word(s) {
        return s.to_string();
    }
    format!("'{}'", escape_with(s, POSIX_SINGLE_QUOTED))
}

/// Quote `s` as a single literal cmd.exe argument.
pub fn cmd_quote(s: &str) -> String {
    if is_simple_word_cmd(s) {
        return s.to_string();
    }
    format!("\"{}\"", escape_with(s, CMD_DOUBLE_QUOTED))
}

/// Join an argument vector into one command line for the platform shell.
pub fn join_argv<I, S>(argv: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let quote: fn(&str) -> String = if cfg!(windows) { cmd_quote } else { posix_quote };
    argv.into_iter()
        .map(|arg| quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_simple_word(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
}

/// cmd.exe expands `%VAR%` and splits on `,` and `=`, so those get quoted.
fn is_simple_word_cmd(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || r"-_./:\+@".contains(c))
}
