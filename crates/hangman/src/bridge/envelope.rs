//! Invocation envelope - the request a secondary instance forwards.
//!
//! Wire format (inside one frame):
//!
//! ```text
//! ARG1\0ARG2\0...\0ARGn\0\0WORKDIR\0\0KEY1\0VAL1\0KEY2\0VAL2...
//! ```
//!
//! Values must not contain NUL; one that does corrupts the section split.
//! Empty arguments and empty environment values would also produce a `\0\0`
//! run, so [`Envelope::validate`] rejects them before sending.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;

const SECTION_SEPARATOR: &str = "\0\0";
const TOKEN_SEPARATOR: char = '\0';

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: expected 3 sections, found {sections}")]
    Malformed { sections: usize },
    #[error("argument {index} is empty; empty arguments cannot be forwarded")]
    EmptyArgument { index: usize },
    #[error("environment variable {key} is empty; empty values cannot be forwarded")]
    EmptyVariable { key: String },
    #[error("failed to capture invocation: {0}")]
    Capture(#[from] io::Error),
}

/// One forwarded invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
}

impl Envelope {
    pub fn new(
        args: Vec<String>,
        working_directory: impl Into<PathBuf>,
        environment: BTreeMap<String, String>,
    ) -> Self {
        Self {
            args,
            working_directory: working_directory.into(),
            environment,
        }
    }

    /// Capture the running process's invocation (argv without the program
    /// name, current directory, environment).
    ///
    /// Variables whose key or value is not valid UTF-8 are skipped, as are
    /// variables set to the empty string. The primary overlays the forwarded
    /// environment on its own, so an unset variable stands in for an empty one.
    pub fn current() -> Result<Self, EnvelopeError> {
        Ok(Self::capture(
            std::env::args_os().skip(1),
            std::env::current_dir()?,
            std::env::vars_os(),
        ))
    }

    fn capture(
        args: impl IntoIterator<Item = OsString>,
        working_directory: PathBuf,
        vars: impl IntoIterator<Item = (OsString, OsString)>,
    ) -> Self {
        let args = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let environment = vars
            .into_iter()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .filter(|(_, v)| !v.is_empty())
            .collect();

        Self {
            args,
            working_directory,
            environment,
        }
    }

    /// Check that every token survives encoding.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if let Some(index) = self.args.iter().position(String::is_empty) {
            return Err(EnvelopeError::EmptyArgument { index });
        }
        if let Some((key, _)) = self.environment.iter().find(|(_, v)| v.is_empty()) {
            return Err(EnvelopeError::EmptyVariable { key: key.clone() });
        }
        Ok(())
    }

    pub fn encode(&self) -> String {
        let args = self.args.join("\0");
        let environment = self
            .environment
            .iter()
            .flat_map(|(k, v)| [k.as_str(), v.as_str()])
            .collect::<Vec<_>>()
            .join("\0");

        format!(
            "{args}{SECTION_SEPARATOR}{}{SECTION_SEPARATOR}{environment}",
            self.working_directory.to_string_lossy()
        )
    }

    pub fn decode(message: &str) -> Result<Self, EnvelopeError> {
        let sections: Vec<&str> = message.split(SECTION_SEPARATOR).collect();
        let [args, working_directory, environment] = sections.as_slice() else {
            return Err(EnvelopeError::Malformed {
                sections: sections.len(),
            });
        };

        let args = split_tokens(args).map(str::to_string).collect();

        let mut tokens = split_tokens(environment);
        let mut env = BTreeMap::new();
        while let Some(key) = tokens.next() {
            // A trailing key with no value had its empty value eaten by the
            // separator; keep it with an empty value.
            let value = tokens.next().unwrap_or_default();
            env.insert(key.to_string(), value.to_string());
        }

        Ok(Self {
            args,
            working_directory: PathBuf::from(*working_directory),
            environment: env,
        })
    }
}

fn split_tokens(section: &str) -> impl Iterator<Item = &str> {
    let empty = section.is_empty();
    section.split(TOKEN_SEPARATOR).filter(move |_| !empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn roundtrip_keeps_all_fields() {
        let envelope = Envelope::new(
            vec!["a".to_string(), "b c".to_string()],
            "/tmp",
            env(&[("X", "1")]),
        );

        let decoded = Envelope::decode(&envelope.encode()).unwrap();

        assert_eq!(decoded.args, vec!["a", "b c"]);
        assert_eq!(decoded.working_directory, PathBuf::from("/tmp"));
        assert_eq!(decoded.environment, env(&[("X", "1")]));
    }

    #[test]
    fn encodes_documented_layout() {
        let envelope = Envelope::new(
            vec!["echo".to_string(), "hi".to_string()],
            "/work",
            env(&[("A", "1"), ("B", "2")]),
        );

        assert_eq!(envelope.encode(), "echo\0hi\0\0/work\0\0A\01\0B\02");
    }

    #[test]
    fn one_separator_is_malformed() {
        let err = Envelope::decode("echo\0hi\0\0/work").unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed { sections: 2 }));
    }

    #[test]
    fn extra_section_is_malformed() {
        let err = Envelope::decode("a\0\0/w\0\0K\0V\0\0extra").unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed { sections: 4 }));
    }

    #[test]
    fn empty_args_and_environment_roundtrip() {
        let envelope = Envelope::new(Vec::new(), "/", BTreeMap::new());

        let encoded = envelope.encode();
        assert_eq!(encoded, "\0\0/\0\0");
        assert_eq!(Envelope::decode(&encoded).unwrap(), envelope);
    }

    #[test]
    fn trailing_key_without_value_gets_empty_value() {
        let decoded = Envelope::decode("ls\0\0/\0\0A\01\0EMPTY").unwrap();
        assert_eq!(decoded.environment, env(&[("A", "1"), ("EMPTY", "")]));
    }

    #[test]
    fn current_captures_working_directory() {
        let envelope = Envelope::current().unwrap();
        assert_eq!(
            envelope.working_directory,
            std::env::current_dir().unwrap()
        );
    }

    #[test]
    fn capture_skips_empty_variables() {
        let envelope = Envelope::capture(
            [OsString::from("ls")],
            PathBuf::from("/work"),
            [
                (OsString::from("A"), OsString::new()),
                (OsString::from("PATH"), OsString::from("/bin")),
            ],
        );

        assert_eq!(envelope.environment, env(&[("PATH", "/bin")]));
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn empty_argument_is_rejected() {
        let envelope = Envelope::new(
            vec!["echo".to_string(), String::new()],
            "/work",
            BTreeMap::new(),
        );

        let err = envelope.validate().unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyArgument { index: 1 }));
        assert_eq!(
            err.to_string(),
            "argument 1 is empty; empty arguments cannot be forwarded"
        );
    }

    #[test]
    fn empty_variable_is_rejected() {
        let envelope = Envelope::new(
            vec!["ls".to_string()],
            "/work",
            env(&[("A", ""), ("PATH", "/bin")]),
        );

        let err = envelope.validate().unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyVariable { ref key } if key == "A"));
    }

    #[test]
    fn ordinary_envelope_validates() {
        let envelope = Envelope::new(vec!["ls".to_string()], "/work", env(&[("X", "1")]));
        assert!(envelope.validate().is_ok());
    }
}
