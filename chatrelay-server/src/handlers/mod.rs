pub mod chat;
pub mod streaming;
