//! Route registration and dispatch, grounded in `add_route`/the route table
//! walk in http.c: first matching method + pattern wins, and a pattern that
//! fails to compile is a startup failure (routes are operator-authored, not
//! request input, so there is no runtime path that can hit a bad pattern).

use crate::parse::{Request, Version};
use votecore_context::Context;
use votecore_regex::Regex;

pub struct Response {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, reason: &'static str, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Response {
            status,
            reason,
            headers: vec![("Content-Length".to_string(), body.len().to_string())],
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Replace the body and fix up `Content-Length` to match.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        {
            entry.1 = self.body.len().to_string();
        } else {
            self.headers
                .push(("Content-Length".to_string(), self.body.len().to_string()));
        }
        self
    }

    /// Serialise the status line, headers and body. `version` picks the
    /// status-line token; `keep_alive` decides whether a `Connection` header
    /// is needed at all — per spec §6, one is only emitted when it differs
    /// from what `version` already defaults to (1.0 defaults to close, 1.1
    /// to keep-alive).
    pub fn into_bytes(self, version: Version, keep_alive: bool) -> Vec<u8> {
        let version_str = match version {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        };
        let default_keep_alive = matches!(version, Version::Http11);

        let mut out = format!("{} {} {}\r\n", version_str, self.status, self.reason).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if keep_alive != default_keep_alive {
            let value = if keep_alive { "keep-alive" } else { "close" };
            out.extend_from_slice(format!("Connection: {}\r\n", value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Captures bound from the route pattern's named groups, handed to the
/// handler alongside the request.
pub struct Captures<'a> {
    request: &'a Request,
    regex: &'a Regex,
    m: votecore_regex::Match,
}

impl<'a> Captures<'a> {
    pub fn get(&self, name: &str) -> Option<&str> {
        let (start, end) = self.m.named_group(self.regex, name)?;
        Some(&self.request.path[start..end])
    }
}

/// A route handler. `ctx` is the requesting client's own context — the
/// same one its message buffer and reply buffer live in — so a handler
/// that needs scratch space (compiling a regex, building a body) can
/// allocate out of it instead of reaching for the global allocator,
/// mirroring how `deal_with_a_request` hands `client->context` down to
/// whatever handler it calls.
pub type Handler = Box<dyn Fn(&Request, &Captures, &Context) -> Response + Send + Sync>;

struct Route {
    method: &'static str,
    pattern: Regex,
    handler: Handler,
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Router { routes: Vec::new() }
    }

    /// Compiles `pattern` immediately. Panics on a bad pattern: routes are
    /// registered at startup by the operator, not derived from request
    /// input, so a compile failure here is a configuration bug, not
    /// something to recover from at request time.
    pub fn add_route(
        &mut self,
        method: &'static str,
        pattern: &str,
        handler: impl Fn(&Request, &Captures, &Context) -> Response + Send + Sync + 'static,
    ) {
        let pattern = Regex::compile(pattern)
            .unwrap_or_else(|e| panic!("invalid route pattern {:?}: {}", pattern, e));
        self.routes.push(Route {
            method,
            pattern,
            handler: Box::new(handler),
        });
    }

    pub fn dispatch(&self, request: &Request, ctx: &Context) -> Response {
        for route in &self.routes {
            if route.method != "GET" {
                continue;
            }
            if let Some(m) = route.pattern.matches(&request.path) {
                let captures = Captures {
                    request,
                    regex: &route.pattern,
                    m,
                };
                return (route.handler)(request, &captures, ctx);
            }
        }
        not_found()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_line(bytes: &[u8], name: &str) -> Option<String> {
        let text = String::from_utf8_lossy(bytes);
        text.lines()
            .find(|line| line.to_ascii_lowercase().starts_with(&format!("{}:", name.to_ascii_lowercase())))
            .map(|line| line.to_string())
    }

    #[test]
    fn http11_keep_alive_omits_connection_header() {
        let bytes = Response::new(200, "OK", Vec::new()).into_bytes(Version::Http11, true);
        assert!(header_line(&bytes, "connection").is_none());
        assert!(String::from_utf8_lossy(&bytes).starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn http11_close_is_explicit() {
        let bytes = Response::new(200, "OK", Vec::new()).into_bytes(Version::Http11, false);
        assert_eq!(header_line(&bytes, "connection").as_deref(), Some("Connection: close"));
    }

    #[test]
    fn http10_close_omits_connection_header() {
        let bytes = Response::new(200, "OK", Vec::new()).into_bytes(Version::Http10, false);
        assert!(header_line(&bytes, "connection").is_none());
        assert!(String::from_utf8_lossy(&bytes).starts_with("HTTP/1.0 200 OK\r\n"));
    }

    #[test]
    fn http10_keep_alive_is_explicit() {
        let bytes = Response::new(200, "OK", Vec::new()).into_bytes(Version::Http10, true);
        assert_eq!(
            header_line(&bytes, "connection").as_deref(),
            Some("Connection: keep-alive")
        );
    }
}

pub fn not_found() -> Response {
    Response::new(404, "Not Found", &b"404 Not Found"[..])
}

pub fn status_response(status: u16, reason: &'static str) -> Response {
    Response::new(status, reason, reason.as_bytes().to_vec())
}

/// Serves any file under `root` named by the request path, including `..`
/// segments — insecure by design, not by accident, same caveat the name
/// carries in the original.
pub fn serve_file_insecurely(request: &Request, root: &std::path::Path) -> Response {
    let relative = request.path.trim_start_matches('/');
    let path = root.join(relative);

    let body = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(_) => return Response::new(404, "Not Found", &b"We couldn't find that file.\n"[..]),
    };

    let content_type = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| match ext {
            "html" => Some("text/html"),
            "js" => Some("text/javascript"),
            "json" => Some("application/json"),
            "ttf" => Some("font/ttf"),
            _ => None,
        });

    let mut response = Response::new(200, "OK", body);
    if let Some(content_type) = content_type {
        response = response.with_header("Content-Type", content_type);
    }
    response
}
