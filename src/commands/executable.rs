use crate::store::Store;
use crate::token::Token;
use crate::Error;

pub trait Executable {
    fn exec(self, store: &Store) -> Result<Token, Error>;
}
