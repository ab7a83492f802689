#![cfg_attr(not(test), forbid(unsafe_code))]

//! ChatRelay server: accepts chat input, streams generated replies to live
//! observers over SSE, and serves cursor-paged conversation history.

pub mod app_state;
pub mod db;
pub mod handlers;
pub mod http;
pub mod middleware;
pub mod openapi;
pub mod routes;
pub mod server;
pub mod services;
pub mod tracer;
