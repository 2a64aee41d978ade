use crate::commands::executable::Executable;
use crate::commands::{CommandError, CommandParser};
use crate::store::Store;
use crate::token::Token;
use crate::Error;

// https://redis.io/commands/del
#[derive(Debug, PartialEq)]
pub struct Del {
    pub keys: Vec<String>,
}

impl Executable for Del {
    fn exec(self, store: &Store) -> Result<Token, Error> {
        let mut count = 0;
        for key in self.keys {
            if store.delete(&key)? {
                count += 1;
            }
        }
        Ok(Token::Integer(count))
    }
}

impl TryFrom<&mut CommandParser> for Del {
    type Error = CommandError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let mut keys = vec![parser.next_string()?];

        while parser.has_remaining() {
            keys.push(parser.next_string()?);
        }

        Ok(Self { keys })
    }
}
