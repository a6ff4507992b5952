//! Claude Messages <-> Gemini generateContent translation.
//!
//! `request` encodes an inbound Messages body into a generateContent body,
//! `response` decodes a complete generateContent response, `stream` rebuilds
//! a Claude SSE event sequence from streamed Gemini chunks, and `schema`
//! rewrites tool parameter schemas into Gemini's restricted dialect.

pub mod request;
pub mod response;
pub mod schema;
pub mod stream;

pub use request::encode_request;
pub use response::decode_response;
pub use schema::sanitize_schema;
pub use stream::{StreamState, convert_chunk};
