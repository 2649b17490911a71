/// Escape single quotes for interpolation into a shell single-quoted string.
///
/// Each `'` becomes `'"'"'`: the quoted region is closed, a double-quoted
/// single quote is emitted, and the quoted region is reopened. With no
/// whitespace in between, the shell reads the result as one word.
pub fn shell_escape_single_quote(command: &str) -> String {
    command.replace('\'', "'\"'\"'")
}

/// Size of the controlling terminal as (columns, rows), with a classic
/// 80x24 fallback when not attached to a terminal.
pub fn terminal_size() -> (u32, u32) {
    match termsize::get() {
        Some(size) => (u32::from(size.cols), u32::from(size.rows)),
        None => (80, 24),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_plain_string_unchanged() {
        assert_eq!(shell_escape_single_quote("ls -d /etc"), "ls -d /etc");
    }

    #[test]
    fn escape_single_quote() {
        assert_eq!(shell_escape_single_quote("it's"), r#"it'"'"'s"#);
    }

    #[test]
    fn escape_idempotent_without_quotes() {
        let input = "echo foo && echo bar | grep foo";
        assert_eq!(
            shell_escape_single_quote(&shell_escape_single_quote(input)),
            input
        );
    }
}
