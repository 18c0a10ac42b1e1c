pub mod actions;
pub mod interface;
pub mod schema;

use revault_tx::bitcoin::consensus::encode;

#[derive(PartialEq, Eq, Debug)]
pub struct DatabaseError(pub String);

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Database error: {}", self.0)
    }
}

impl std::error::Error for DatabaseError {}

impl From<rusqlite::Error> for DatabaseError {
    fn from(e: rusqlite::Error) -> Self {
        Self(format!("SQLite error: {}", e))
    }
}

impl From<encode::Error> for DatabaseError {
    fn from(e: encode::Error) -> Self {
        Self(format!("Decoding stored data: {}", e))
    }
}

pub const DB_VERSION: u32 = 0;
