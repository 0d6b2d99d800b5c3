//! Per-connection state, grounded in `Client` in http.c: a phase, the raw
//! socket, and the buffers the parser and response writer share.
//!
//! The message buffer and the reply buffer both live in a context private
//! to this client (a child of the server's root context, created at
//! accept), the same way `deal_with_a_request` in http.c hangs everything
//! about one connection off `client->context`. Resetting for the next
//! keep-alive request throws the context away and starts a fresh one
//! rather than trying to reuse the old buffers in place, mirroring
//! `reset_context` followed by re-`init`.

use crate::parse::{self, ParseError, Request};
use crate::server::router::Response;
use socket2::Socket;
use std::time::Instant;
use votecore_collections::ContextVec;
use votecore_context::Context;

/// Mirrors the four states in spec §4.6's diagram exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Parsing,
    Handling,
    Sending,
    ReadyToClose,
}

pub struct Client {
    pub socket: Socket,
    pub phase: Phase,
    pub accepted_at: Instant,
    pub keep_alive: bool,

    /// This client's own context, a child of the server's root context.
    /// Handlers that need scratch space (compiling a regex, building a
    /// response body) are free to allocate out of it too.
    pub ctx: Context,

    read_buf: ContextVec<u8>,
    parser: parse::Parser,
    pub request: Option<Request>,
    pub parse_error: Option<ParseError>,

    write_buf: ContextVec<u8>,
    written: usize,
}

impl Client {
    pub fn new(socket: Socket, ctx: Context) -> Self {
        Client {
            socket,
            phase: Phase::Parsing,
            accepted_at: Instant::now(),
            keep_alive: true,
            read_buf: ContextVec::new(ctx.clone()),
            parser: parse::Parser::new(),
            request: None,
            parse_error: None,
            write_buf: ContextVec::new(ctx.clone()),
            written: 0,
            ctx,
        }
    }

    /// Keep-alive reset: throw away everything about the last request but
    /// keep the socket, mirroring `reset_context` + re-`init` in http.c.
    /// The old buffers are dropped *before* the context resets, so nothing
    /// is left pointing at memory the reset free list may hand back out.
    pub fn reset_for_next_request(&mut self) {
        self.phase = Phase::Parsing;
        self.accepted_at = Instant::now();
        self.read_buf = ContextVec::new(self.ctx.clone());
        self.parser = parse::Parser::new();
        self.request = None;
        self.parse_error = None;
        self.write_buf = ContextVec::new(self.ctx.clone());
        self.written = 0;
        self.ctx.reset();
    }

    /// Pull as many bytes as are currently available off the socket
    /// (non-blocking) and feed them to the incremental parser.
    pub fn read_and_parse(&mut self) {
        use std::io::Read;
        let mut chunk = [0u8; 8192];
        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) => {
                    self.phase = Phase::ReadyToClose;
                    return;
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.phase = Phase::ReadyToClose;
                    return;
                }
            }
        }

        match self.parser.feed(self.read_buf.as_slice()) {
            parse::Outcome::Incomplete => {}
            parse::Outcome::Complete(request) => {
                self.keep_alive = request.keep_alive;
                self.request = Some(request);
                self.phase = Phase::Handling;
            }
            parse::Outcome::Error(err) => {
                self.parse_error = Some(err);
                self.phase = Phase::Handling;
            }
        }
    }

    pub fn queue_response(&mut self, response: Response) {
        let version = self
            .request
            .as_ref()
            .map(|r| r.version)
            .unwrap_or(parse::Version::Http11);
        let bytes = response.into_bytes(version, self.keep_alive);
        let mut buf = ContextVec::new(self.ctx.clone());
        buf.extend_from_slice(&bytes);
        self.write_buf = buf;
        self.written = 0;
        self.phase = Phase::Sending;
    }

    /// Write as much of the pending response as the socket will currently
    /// accept (non-blocking).
    pub fn flush(&mut self) {
        use std::io::Write;
        while self.written < self.write_buf.len() {
            match self.socket.write(&self.write_buf.as_slice()[self.written..]) {
                Ok(0) => {
                    self.phase = Phase::ReadyToClose;
                    return;
                }
                Ok(n) => self.written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.phase = Phase::ReadyToClose;
                    return;
                }
            }
        }

        if self.keep_alive {
            self.reset_for_next_request();
        } else {
            self.phase = Phase::ReadyToClose;
        }
    }

    pub fn wants_write(&self) -> bool {
        matches!(self.phase, Phase::Sending) && self.written < self.write_buf.len()
    }
}
