//! A small file-and-status server, grounded in `main()` in votemap.c: bind
//! to `0.0.0.0`, take an optional port argument (default 6008), serve
//! `/status` and fall back to serving files out of the working directory.

use clap::Parser;
use std::path::PathBuf;
use votecore_http::{serve_file_insecurely, Router, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(about = "A small HTTP/1.x file and status server")]
struct Args {
    /// Port to listen on.
    #[arg(default_value_t = 6008)]
    port: u16,

    /// Directory served by the file-serving fallback route.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut router = Router::new();

    router.add_route("GET", "/status", |_request, _captures, _ctx| {
        votecore_http::status_response(200, "OK")
    });

    let root = args.root.clone();
    router.add_route("GET", "/.*", move |request, _captures, _ctx| {
        serve_file_insecurely(request, &root)
    });

    let config = ServerConfig {
        port: args.port,
        workers: args.workers,
        ..ServerConfig::default()
    };

    let server = Server::new(config, router);
    let bound = match server.bind() {
        Ok(bound) => bound,
        Err(err) => {
            tracing::error!(%err, "failed to start server");
            std::process::exit(1);
        }
    };

    bound.run();
}
