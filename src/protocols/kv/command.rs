//! Key-value command parser.

use std::fmt;

/// Parsed key-value command, borrowing from the request arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Get { key: &'a [u8] },
    Set { key: &'a [u8], value: &'a [u8] },
    Del { key: &'a [u8] },
    Ping { message: Option<&'a [u8]> },
}

/// Reasons a request is not a valid command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Empty,
    Unknown(String),
    WrongArity(&'static str),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Empty => write!(f, "empty command"),
            CommandError::Unknown(name) => write!(f, "unknown command '{}'", name),
            CommandError::WrongArity(name) => {
                write!(f, "wrong number of arguments for '{}' command", name)
            }
        }
    }
}

impl<'a> Command<'a> {
    /// Parse a command from a request's argument list.
    pub fn parse(args: &[&'a [u8]]) -> Result<Self, CommandError> {
        let (name, rest) = args.split_first().ok_or(CommandError::Empty)?;

        if name.eq_ignore_ascii_case(b"get") {
            match rest {
                &[key] => Ok(Command::Get { key }),
                _ => Err(CommandError::WrongArity("get")),
            }
        } else if name.eq_ignore_ascii_case(b"set") {
            match rest {
                &[key, value] => Ok(Command::Set { key, value }),
                _ => Err(CommandError::WrongArity("set")),
            }
        } else if name.eq_ignore_ascii_case(b"del") {
            match rest {
                &[key] => Ok(Command::Del { key }),
                _ => Err(CommandError::WrongArity("del")),
            }
        } else if name.eq_ignore_ascii_case(b"ping") {
            match rest {
                &[] => Ok(Command::Ping { message: None }),
                &[message] => Ok(Command::Ping {
                    message: Some(message),
                }),
                _ => Err(CommandError::WrongArity("ping")),
            }
        } else {
            Err(CommandError::Unknown(
                String::from_utf8_lossy(name).into_owned(),
            ))
        }
    }
}
