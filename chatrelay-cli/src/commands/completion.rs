//! Shell completion scripts.

use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::io::Write;

/// Writes the completion script for `shell` to `out`.
pub fn generate_completion(shell: Shell, out: &mut dyn Write) {
    let mut command = crate::Cli::command();
    generate(shell, &mut command, env!("CARGO_PKG_NAME"), out);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bash_script_mentions_subcommands() {
        let mut out = Vec::<u8>::new();
        generate_completion(Shell::Bash, &mut out);
        let script = String::from_utf8(out).unwrap();

        for command in ["send", "watch", "history", "serve"] {
            assert!(script.contains(command), "missing {command}");
        }
    }
}
