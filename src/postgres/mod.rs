pub mod connection;
pub mod decoder;
pub mod primary_key;
pub mod protocol;
pub mod types;

#[cfg(test)]
mod decoder_tests;

#[cfg(test)]
mod type_parser_tests;

pub use connection::{ReplicationConnection, ReplicationStream};
pub use decoder::{PgOutputMessage, RelationBody, RelationColumn, TupleData, TupleValue};
pub use primary_key::{CatalogKeyLookup, KeyLookup, StaticKeyLookup};
pub use protocol::Frame;
