//! Terminal intents: one line of input becomes one [`Command`].

pub mod chat;
pub mod settings;

use std::str::FromStr;

pub use chat::{Flow, Shell};

pub const HELP: &str = "\
Commands:
  /signup <email> <password> <name>   create an account and sign in
  /login <email> <password>           sign in
  /logout                             sign out
  /new                                start a new conversation
  /list                               show your conversations
  /open <n|id>                        open a conversation
  /delete <n|id>                      delete a conversation
  /rename <title>                     rename the open conversation
  /stats                              refresh and show your totals
  /profile <name>                     change your display name
  /config                             show stored settings
  /config set <key> <value>           store a setting
  /config unset <key>                 remove a setting
  /help                               show this help
  /quit                               exit
Anything else is sent as a message.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SignUp {
        email: String,
        password: String,
        name: String,
    },
    Login {
        email: String,
        password: String,
    },
    Logout,
    New,
    List,
    Open(String),
    Delete(String),
    Rename(String),
    Stats,
    Profile(String),
    ShowConfig,
    SetConfig {
        key: String,
        value: String,
    },
    UnsetConfig(String),
    Help,
    Quit,
    Send(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command /{0} (try /help)")]
    Unknown(String),
}

fn required(arg: &str, usage: &'static str) -> Result<String, CommandError> {
    match arg.trim() {
        "" => Err(CommandError::Usage(usage)),
        value => Ok(value.to_string()),
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let Some(rest) = line.trim_start().strip_prefix('/') else {
            return Ok(Command::Send(line.to_string()));
        };
        let (name, args) = rest
            .split_once(char::is_whitespace)
            .unwrap_or((rest, ""));
        let words: Vec<&str> = args.split_whitespace().collect();

        match name {
            "signup" => match words.as_slice() {
                [email, password, name @ ..] if !name.is_empty() => Ok(Command::SignUp {
                    email: email.to_string(),
                    password: password.to_string(),
                    name: name.join(" "),
                }),
                _ => Err(CommandError::Usage("/signup <email> <password> <name>")),
            },
            "login" => match words.as_slice() {
                [email, password] => Ok(Command::Login {
                    email: email.to_string(),
                    password: password.to_string(),
                }),
                _ => Err(CommandError::Usage("/login <email> <password>")),
            },
            "logout" => Ok(Command::Logout),
            "new" => Ok(Command::New),
            "list" => Ok(Command::List),
            "open" => required(args, "/open <n|id>").map(Command::Open),
            "delete" => required(args, "/delete <n|id>").map(Command::Delete),
            "rename" => required(args, "/rename <title>").map(Command::Rename),
            "stats" => Ok(Command::Stats),
            "profile" => required(args, "/profile <name>").map(Command::Profile),
            "config" => match words.as_slice() {
                [] => Ok(Command::ShowConfig),
                ["set", key, value @ ..] if !value.is_empty() => Ok(Command::SetConfig {
                    key: key.to_string(),
                    value: value.join(" "),
                }),
                ["unset", key] => Ok(Command::UnsetConfig(key.to_string())),
                _ => Err(CommandError::Usage(
                    "/config | /config set <key> <value> | /config unset <key>",
                )),
            },
            "help" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}
