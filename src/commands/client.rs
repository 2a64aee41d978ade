use crate::commands::executable::Executable;
use crate::commands::{CommandError, CommandParser};
use crate::store::Store;
use crate::token::Token;
use crate::Error;

/// Connection metadata sent by client libraries right after connecting (`CLIENT SETNAME`,
/// `CLIENT SETINFO`). It is acknowledged and otherwise ignored.
///
/// Ref: <https://redis.io/docs/latest/commands/client-setinfo/>
#[derive(Debug, PartialEq)]
pub struct Client {
    pub subcommand: String,
}

impl Executable for Client {
    fn exec(self, _store: &Store) -> Result<Token, Error> {
        Ok(Token::simple("OK"))
    }
}

impl TryFrom<&mut CommandParser> for Client {
    type Error = CommandError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let subcommand = parser.next_string()?.to_lowercase();

        match subcommand.as_str() {
            "setname" => {
                parser.next_bytes()?;
            }
            "setinfo" => {
                parser.next_bytes()?;
                parser.next_bytes()?;
            }
            _ => {
                return Err(CommandError::UnknownSubcommand {
                    command: parser.name().to_string(),
                    subcommand,
                })
            }
        }

        Ok(Self { subcommand })
    }
}
