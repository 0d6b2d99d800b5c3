//! The reactor and worker pool, grounded in `create_server`/`start_server`/
//! `thread_start`/`deal_with_a_request` in http.c: a single `poll`-driven
//! main thread owns every socket, and a fixed pool of worker threads does
//! the actual parsing/handling/sending, handed one client at a time over a
//! work queue and reporting back over a completion channel.

mod client;
mod queue;
mod router;

pub use client::Phase;
pub use router::{not_found, serve_file_insecurely, status_response, Captures, Response, Router};

use client::Client;
use queue::ClientQueue;
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use votecore_context::Context;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("failed to create listening socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),
    #[error("failed to install the SIGINT self-pipe: {0}")]
    SignalPipe(#[source] io::Error),
    #[error("failed to install the SIGINT handler: {0}")]
    SignalHandler(#[source] io::Error),
}

/// Explicit configuration instead of scattered literals: address is fixed
/// at `0.0.0.0` per the non-goal on configurable bind address, but port,
/// worker count and timeouts are all named fields here rather than magic
/// numbers sprinkled through the reactor.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub workers: usize,
    pub listen_backlog: i32,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Replaces `idle_timeout`/`handshake_timeout` once SIGINT has been seen,
    /// so in-flight clients get drained quickly instead of waiting out the
    /// normal 15s bound (spec §4.6/§5: "tightened to 1 s during shutdown").
    pub draining_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 6008,
            workers: 4,
            listen_backlog: 32,
            idle_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(1),
            draining_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_millis(500),
        }
    }
}

static mut SIGINT_WRITE_FD: RawFd = -1;

extern "C" fn handle_sigint(_: libc::c_int) {
    // Async-signal-safe: write one byte to the self-pipe. The actual shutdown
    // logic runs on the main thread, which notices the pipe is readable.
    unsafe {
        let byte = 1u8;
        libc::write(SIGINT_WRITE_FD, &byte as *const u8 as *const libc::c_void, 1);
    }
}

pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
    root_ctx: Context,
}

impl Server {
    pub fn new(config: ServerConfig, router: Router) -> Self {
        Server {
            config,
            router: Arc::new(router),
            root_ctx: Context::new_root(),
        }
    }

    /// Binds the listening socket and installs the SIGINT self-pipe. Split
    /// from `run` so startup failures (all fatal, per the startup-failure
    /// taxonomy) surface before any worker thread is spawned.
    pub fn bind(&self) -> Result<BoundServer, ServerError> {
        let addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, self.config.port).into();
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(ServerError::Socket)?;
        socket.set_reuse_address(true).map_err(ServerError::Socket)?;
        socket.set_nonblocking(true).map_err(ServerError::Socket)?;
        socket
            .bind(&addr.into())
            .map_err(|source| ServerError::Bind { addr, source })?;
        socket
            .listen(self.config.listen_backlog)
            .map_err(ServerError::Listen)?;

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(ServerError::SignalPipe(io::Error::last_os_error()));
        }
        let (sigint_read, sigint_write) = (fds[0], fds[1]);
        unsafe {
            set_nonblocking_fd(sigint_read);
            SIGINT_WRITE_FD = sigint_write;
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_sigint as usize;
            if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
                return Err(ServerError::SignalHandler(io::Error::last_os_error()));
            }
        }

        tracing::info!(port = self.config.port, "listening");

        Ok(BoundServer {
            listener: socket,
            sigint_read,
            config: self.config.clone(),
            router: self.router.clone(),
            root_ctx: self.root_ctx.clone(),
        })
    }
}

unsafe fn set_nonblocking_fd(fd: RawFd) {
    let flags = libc::fcntl(fd, libc::F_GETFL);
    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
}

pub struct BoundServer {
    listener: Socket,
    sigint_read: RawFd,
    config: ServerConfig,
    router: Arc<Router>,
    root_ctx: Context,
}

struct Tracked {
    client: Arc<Mutex<Client>>,
    in_worker: bool,
}

impl BoundServer {
    /// The address actually bound, including the port the kernel picked
    /// when `ServerConfig::port` was `0` — handy for tests that want an
    /// ephemeral port instead of racing over a fixed one.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "listening socket has no IP address")
        })
    }

    /// Runs the poll loop until SIGINT is observed or `run` is asked to
    /// stop; consumes `self` and the `Router`'s owning `Server`, so no
    /// route can be registered once the server is running.
    pub fn run(self) {
        let config = &self.config;
        let queue: Arc<ClientQueue<Mutex<Client>>> = Arc::new(ClientQueue::default());
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<RawFd>();

        let mut workers = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let queue = queue.clone();
            let router = self.router.clone();
            let done_tx = done_tx.clone();
            workers.push(std::thread::spawn(move || worker_loop(queue, router, done_tx)));
        }

        let mut clients: HashMap<RawFd, Tracked> = HashMap::new();
        let mut shutting_down = false;
        let listener_fd = self.listener.as_raw_fd();

        loop {
            let mut pollfds = Vec::with_capacity(clients.len() + 2);
            pollfds.push(libc::pollfd {
                fd: self.sigint_read,
                events: libc::POLLIN,
                revents: 0,
            });
            let listener_index = pollfds.len();
            pollfds.push(libc::pollfd {
                fd: listener_fd,
                events: if shutting_down { 0 } else { libc::POLLIN },
                revents: 0,
            });

            let client_start = pollfds.len();
            let mut fd_order = Vec::with_capacity(clients.len());
            for (&fd, tracked) in clients.iter() {
                if tracked.in_worker {
                    continue;
                }
                let phase = tracked.client.lock().unwrap().phase;
                let events = match phase {
                    Phase::Parsing => libc::POLLIN,
                    Phase::Sending => libc::POLLOUT,
                    _ => continue,
                };
                pollfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
                fd_order.push(fd);
            }

            let timeout_ms = config.sweep_interval.as_millis() as i32;
            let n = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::warn!(%err, "poll failed");
                continue;
            }

            if pollfds[0].revents & libc::POLLIN != 0 {
                drain_pipe(self.sigint_read);
                tracing::info!("SIGINT received, draining");
                shutting_down = true;
            }

            if !shutting_down && pollfds[listener_index].revents & libc::POLLIN != 0 {
                accept_all(&self.listener, &self.root_ctx, &mut clients);
            }

            while let Ok(fd) = done_rx.try_recv() {
                if let Some(tracked) = clients.get_mut(&fd) {
                    tracked.in_worker = false;
                    let phase = tracked.client.lock().unwrap().phase;
                    if phase == Phase::ReadyToClose {
                        clients.remove(&fd);
                    }
                }
            }

            for (i, &fd) in fd_order.iter().enumerate() {
                let revents = pollfds[client_start + i].revents;
                if revents == 0 {
                    continue;
                }
                if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                    clients.remove(&fd);
                    continue;
                }
                if let Some(tracked) = clients.get_mut(&fd) {
                    tracked.in_worker = true;
                    queue.push(Some(tracked.client.clone()));
                }
            }

            sweep_timeouts(&mut clients, config, shutting_down);

            if shutting_down && clients.is_empty() {
                break;
            }
        }

        for _ in 0..config.workers {
            queue.push(None);
        }
        for w in workers {
            let _ = w.join();
        }
    }
}

/// Accept every pending connection, each getting its own child context of
/// the server's root context — the same per-client nesting spec §2's data
/// flow describes ("the server creates a per-client child context at
/// accept").
fn accept_all(listener: &Socket, root_ctx: &Context, clients: &mut HashMap<RawFd, Tracked>) {
    loop {
        match listener.accept() {
            Ok((socket, _addr)) => {
                if socket.set_nonblocking(true).is_err() {
                    continue;
                }
                let fd = socket.as_raw_fd();
                let client = Arc::new(Mutex::new(Client::new(socket, root_ctx.new_child())));
                clients.insert(
                    fd,
                    Tracked {
                        client,
                        in_worker: false,
                    },
                );
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(%e, "accept failed");
                break;
            }
        }
    }
}

fn sweep_timeouts(clients: &mut HashMap<RawFd, Tracked>, config: &ServerConfig, shutting_down: bool) {
    let now = Instant::now();
    clients.retain(|_, tracked| {
        if tracked.in_worker {
            return true;
        }
        let guard = tracked.client.lock().unwrap();
        let limit = if shutting_down {
            config.draining_timeout
        } else if guard.request.is_none() && guard.phase == Phase::Parsing {
            config.handshake_timeout
        } else {
            config.idle_timeout
        };
        now.duration_since(guard.accepted_at) < limit
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn tracked_client(ctx: &Context) -> Tracked {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = std::net::TcpStream::connect(addr).unwrap();
        let socket = socket2::Socket::from(stream);
        Tracked {
            client: Arc::new(Mutex::new(Client::new(socket, ctx.new_child()))),
            in_worker: false,
        }
    }

    #[test]
    fn normal_sweep_respects_the_idle_timeout() {
        let root = Context::new_root();
        let config = ServerConfig {
            idle_timeout: Duration::from_millis(20),
            handshake_timeout: Duration::from_secs(30),
            draining_timeout: Duration::from_millis(1),
            ..ServerConfig::default()
        };
        let mut clients = HashMap::new();
        let tracked = tracked_client(&root);
        tracked.client.lock().unwrap().request = Some(dummy_request());
        clients.insert(999, tracked);

        sweep_timeouts(&mut clients, &config, false);
        assert_eq!(clients.len(), 1, "fresh client should survive a sweep well inside idle_timeout");

        std::thread::sleep(Duration::from_millis(40));
        sweep_timeouts(&mut clients, &config, false);
        assert!(clients.is_empty(), "client past idle_timeout should be swept");
    }

    #[test]
    fn shutdown_sweep_uses_the_draining_timeout_instead() {
        let root = Context::new_root();
        let config = ServerConfig {
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            draining_timeout: Duration::from_millis(20),
            ..ServerConfig::default()
        };
        let mut clients = HashMap::new();
        let tracked = tracked_client(&root);
        tracked.client.lock().unwrap().request = Some(dummy_request());
        clients.insert(1, tracked);

        sweep_timeouts(&mut clients, &config, true);
        assert_eq!(clients.len(), 1, "fresh client should survive a sweep well inside draining_timeout");

        std::thread::sleep(Duration::from_millis(40));
        // Not shutting down: the 30s idle_timeout would keep this client.
        sweep_timeouts(&mut clients, &config, false);
        assert_eq!(clients.len(), 1, "without shutdown, the long idle_timeout still applies");

        sweep_timeouts(&mut clients, &config, true);
        assert!(
            clients.is_empty(),
            "once shutting down, the short draining_timeout must apply even though idle_timeout hasn't elapsed"
        );
    }

    fn dummy_request() -> crate::parse::Request {
        crate::parse::Request {
            path: "/".to_string(),
            query: Vec::new(),
            version: crate::parse::Version::Http11,
            keep_alive: true,
            header_end: 0,
        }
    }
}

fn drain_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

/// A worker's whole job, run once per dequeue: parse if `Parsing`, route
/// and handle if `Handling`, send if `Sending`, then unconditionally report
/// completion. Workers never close sockets or free contexts — that's the
/// main thread's job once it sees the fd come back over `done_tx`.
///
/// The phases run as sequential `if`s, not a single-shot `match`, mirroring
/// `deal_with_a_request` in http.c: a client that just finished parsing
/// falls straight through into handling, and one that just got a response
/// built falls straight through into sending the first chunk of it, all in
/// the same dequeue. Without this, a freshly-parsed client would sit in
/// `Handling` forever — the reactor never polls a socket in that phase (it
/// has nothing to wait on: there's no I/O left to do, just local work) and
/// the main thread only re-examines a client once a worker reports it done.
fn worker_loop(
    queue: Arc<ClientQueue<Mutex<Client>>>,
    router: Arc<Router>,
    done_tx: crossbeam_channel::Sender<RawFd>,
) {
    loop {
        let client = match queue.pop() {
            Some(c) => c,
            None => return,
        };

        let fd = {
            let mut guard = client.lock().unwrap();

            if guard.phase == Phase::Parsing {
                guard.read_and_parse();
            }

            if guard.phase == Phase::Handling {
                let response = if let Some(err) = guard.parse_error {
                    let (code, reason) = err.status();
                    status_response(code, reason)
                } else {
                    let request = guard
                        .request
                        .clone()
                        .expect("Handling phase implies a parsed request or a parse_error");
                    router.dispatch(&request, &guard.ctx)
                };
                guard.queue_response(response);
            }

            if guard.phase == Phase::Sending {
                guard.flush();
            }

            guard.socket.as_raw_fd()
        };

        let _ = done_tx.send(fd);
    }
}
