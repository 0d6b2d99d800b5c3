//! Request parsing plus a small poll-based worker-pool server built on top
//! of it, grounded in http.c end to end.

pub mod parse;
pub mod server;

pub use parse::{Outcome, ParseError, Parser, Request, Version, MAX_HEADER_BYTES};
pub use server::{
    not_found, serve_file_insecurely, status_response, BoundServer, Captures, Phase, Response,
    Router, Server, ServerConfig, ServerError,
};
