//! Shell quoting and command-boundary helpers.

/// Sequences that make a command line need a shell to interpret it.
const SHELL_OPERATORS: &[&str] = &["|", "&&", "||", ";", ">", "<", "$(", "`"];

/// Quote a string for POSIX sh, leaving plain words untouched.
pub fn quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if !needs_quoting(s) {
        return s.to_string();
    }
    quote_always(s)
}

/// Quote a string for POSIX sh, always using single quotes.
///
/// abc's -> 'abc'"'"'s'
pub fn quote_always(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

fn needs_quoting(s: &str) -> bool {
    s.chars().any(|c| {
        matches!(
            c,
            ' ' | '\t'
                | '\n'
                | '\r'
                | '"'
                | '\''
                | '\\'
                | '$'
                | '`'
                | '!'
                | '*'
                | '?'
                | '['
                | ']'
                | '{'
                | '}'
                | '('
                | ')'
                | '<'
                | '>'
                | '|'
                | '&'
                | ';'
                | '#'
                | '~'
                | '='
        )
    })
}

/// Join arguments with quoting so `sh -c` sees exactly these words.
pub fn join_args<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|s| quote(s.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether any word of the command contains a shell operator.
pub fn needs_shell_wrap<S: AsRef<str>>(command: &[S]) -> bool {
    command
        .iter()
        .any(|word| SHELL_OPERATORS.iter().any(|op| word.as_ref().contains(op)))
}

/// Build the in-sandbox argv for a user command.
///
/// Commands with shell operators run as `SHELL -c SCRIPT`. A single word is
/// taken verbatim as the script, several words are re-quoted and joined.
pub fn wrap_command(command: &[String], shell: &str) -> Vec<String> {
    if !needs_shell_wrap(command) {
        return command.to_vec();
    }
    let script = if command.len() == 1 {
        command[0].clone()
    } else {
        join_args(command)
    };
    vec![shell.to_string(), "-c".to_string(), script]
}
