pub mod client;
pub mod del;
pub mod echo;
pub mod executable;
pub mod get;
pub mod ping;
pub mod set;

use bytes::Bytes;
use std::{str, vec};
use thiserror::Error as ThisError;
use tracing::debug;

use crate::commands::executable::Executable;
use crate::store::Store;
use crate::token::{Kind, Token};
use crate::Error;

use client::Client;
use del::Del;
use echo::Echo;
use get::Get;
use ping::Ping;
use set::Set;

/// Turns one decoded request into its response.
///
/// Malformed commands are answered with a simple error token and the session carries on. An `Err`
/// means the request could not be served at all and the session should end.
pub trait Dispatcher: Send + Sync {
    fn handle(&self, command: Token) -> Result<Token, Error>;
}

/// The default dispatcher, executing commands against a `Store`.
#[derive(Clone, Default)]
pub struct Handler {
    store: Store,
}

impl Handler {
    pub fn new(store: Store) -> Handler {
        Handler { store }
    }
}

impl Dispatcher for Handler {
    fn handle(&self, command: Token) -> Result<Token, Error> {
        match Command::try_from(command) {
            Ok(cmd) => cmd.exec(&self.store),
            Err(err) => {
                debug!("Rejected command: {}", err);
                Ok(Token::Error(format!("ERR {}", err)))
            }
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Command {
    Client(Client),
    Del(Del),
    Echo(Echo),
    Get(Get),
    Ping(Ping),
    Set(Set),
}

impl Executable for Command {
    fn exec(self, store: &Store) -> Result<Token, Error> {
        match self {
            Command::Client(cmd) => cmd.exec(store),
            Command::Del(cmd) => cmd.exec(store),
            Command::Echo(cmd) => cmd.exec(store),
            Command::Get(cmd) => cmd.exec(store),
            Command::Ping(cmd) => cmd.exec(store),
            Command::Set(cmd) => cmd.exec(store),
        }
    }
}

impl TryFrom<Token> for Command {
    type Error = CommandError;

    fn try_from(token: Token) -> Result<Self, Self::Error> {
        let parser = &mut CommandParser::new(token)?;
        let name = parser.name().to_string();

        let command = match name.as_str() {
            "client" => Client::try_from(&mut *parser).map(Command::Client),
            "del" => Del::try_from(&mut *parser).map(Command::Del),
            "echo" => Echo::try_from(&mut *parser).map(Command::Echo),
            "get" => Get::try_from(&mut *parser).map(Command::Get),
            "ping" => Ping::try_from(&mut *parser).map(Command::Ping),
            "set" => Set::try_from(&mut *parser).map(Command::Set),
            name => Err(CommandError::UnknownCommand(name.to_string())),
        }?;

        parser.finish()?;
        Ok(command)
    }
}

pub struct CommandParser {
    name: String,
    parts: vec::IntoIter<Token>,
}

impl CommandParser {
    fn new(token: Token) -> Result<CommandParser, CommandError> {
        // Clients send commands to the server as RESP arrays.
        let parts = match token {
            Token::Array(parts) => parts,
            token => return Err(CommandError::NotAnArray(token.kind())),
        };

        let mut parts = parts.into_iter();
        let name = parts.next().ok_or(CommandError::EmptyCommand)?;
        let name = str::from_utf8(&string_bytes(name)?)?.to_lowercase();

        Ok(CommandParser { name, parts })
    }

    /// The lowercased command name.
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn has_remaining(&self) -> bool {
        self.parts.len() > 0
    }

    pub(crate) fn next_bytes(&mut self) -> Result<Bytes, CommandError> {
        let token = self.parts.next().ok_or_else(|| self.wrong_arity())?;
        string_bytes(token)
    }

    pub(crate) fn next_string(&mut self) -> Result<String, CommandError> {
        let bytes = self.next_bytes()?;
        Ok(str::from_utf8(&bytes[..])?.to_string())
    }

    /// Fails when arguments are left over after the command took what it needs.
    pub(crate) fn finish(&mut self) -> Result<(), CommandError> {
        if self.has_remaining() {
            return Err(self.wrong_arity());
        }
        Ok(())
    }

    fn wrong_arity(&self) -> CommandError {
        CommandError::WrongArity(self.name.clone())
    }
}

fn string_bytes(token: Token) -> Result<Bytes, CommandError> {
    match token {
        // Both `Simple` and `Bulk` representations are accepted as strings.
        Token::Bulk(bytes) => Ok(bytes),
        Token::Simple(s) => Ok(Bytes::from(s)),
        token => Err(CommandError::WrongType(token.kind())),
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandError {
    #[error("protocol error; expected array, got {0}")]
    NotAnArray(Kind),
    #[error("empty command")]
    EmptyCommand,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),
    #[error("wrong value type: {0}")]
    WrongType(Kind),
    #[error("invalid UTF-8 string")]
    InvalidUtf8String(#[from] str::Utf8Error),
    #[error("unknown subcommand '{subcommand}' for '{command}'")]
    UnknownSubcommand { command: String, subcommand: String },
}
