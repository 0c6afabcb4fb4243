//! Command-line surface, shared by the primary's own launch and every
//! forwarded invocation.

use clap::{CommandFactory, Parser};

#[derive(Parser, Debug, Default, PartialEq, Eq)]
#[command(
    name = "hangman",
    version,
    about = "A parallel command executor which does not block",
    long_about = "Runs commands through a single long-lived instance. The first launch \
                  becomes the primary; later launches hand their command to it and exit."
)]
pub struct Cli {
    /// Clear the current work backlog
    #[arg(short, long)]
    pub clear: bool,

    /// Kill an in-progress job
    #[arg(short, long, value_name = "ID")]
    pub kill: Option<u64>,

    /// List all backlog and in-progress jobs
    #[arg(short, long)]
    pub list: bool,

    /// Print the listing as JSON
    #[arg(long, requires = "list")]
    pub json: bool,

    /// Set the maximum number of parallel jobs
    #[arg(short, long, value_name = "N", value_parser = parse_max)]
    pub max: Option<usize>,

    /// Stop the primary instance
    #[arg(long)]
    pub shutdown: bool,

    /// Command line to queue
    #[arg(value_name = "COMMAND", trailing_var_arg = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Whether any option or command was given.
    pub fn has_work(&self) -> bool {
        self.clear
            || self.kill.is_some()
            || self.list
            || self.max.is_some()
            || self.shutdown
            || !self.command.is_empty()
    }
}

/// Parse an invocation's arguments (program name excluded).
pub fn try_parse_invocation(args: &[String]) -> Result<Cli, clap::Error> {
    Cli::try_parse_from(std::iter::once("hangman").chain(args.iter().map(String::as_str)))
}

pub fn usage() -> String {
    Cli::command().render_usage().to_string()
}

fn parse_max(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;

    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        try_parse_invocation(&args)
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn command_keeps_its_own_flags() {
        let cli = parse(&["-m", "2", "ls", "-l", "--all"]).unwrap();
        assert_eq!(cli.max, Some(2));
        assert!(!cli.list);
        assert_eq!(cli.command, ["ls", "-l", "--all"]);
    }

    #[test]
    fn options_without_command() {
        let cli = parse(&["-c", "--list", "--json", "-k", "7"]).unwrap();
        assert_eq!(
            cli,
            Cli {
                clear: true,
                kill: Some(7),
                list: true,
                json: true,
                ..Cli::default()
            }
        );
        assert!(cli.has_work());
    }

    #[test]
    fn empty_invocation_has_no_work() {
        assert!(!parse(&[]).unwrap().has_work());
    }

    #[test]
    fn json_requires_list() {
        let err = parse(&["--json"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn zero_max_is_rejected() {
        let err = parse(&["-m", "0"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn kill_needs_numeric_id() {
        assert!(parse(&["-k", "abc"]).is_err());
    }

    #[test]
    fn help_is_not_a_stderr_error() {
        let err = parse(&["--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert!(!err.use_stderr());
    }

    #[test]
    fn usage_names_the_program() {
        assert!(usage().contains("hangman"));
    }
}
