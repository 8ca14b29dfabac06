//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on one thread. Each readiness event is handled to
//! completion (accept, read, frame, dispatch, write) before the next poll,
//! and a failure while servicing one connection only ever closes that
//! connection.
//!
//! ## Bounded work per event
//!
//! A listener event accepts one connection and a readable event performs
//! one read of at most `READ_CHUNK` bytes. Because mio readiness is
//! edge-triggered, every handled source is re-registered afterwards, which
//! re-arms it so leftover readiness is reported on the next poll.

use crate::config::Config;
use crate::runtime::{ConnState, Connection};
use crate::shell::Response;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Maximum bytes read from a connection per readiness event.
const READ_CHUNK: usize = 4096;

/// Connection state paired with the socket it belongs to.
///
/// Dropping it closes the socket.
struct MioConnection {
    stream: TcpStream,
    peer: SocketAddr,
    conn: Connection,
}

/// Single-threaded remote shell server.
pub struct Server {
    poll: Poll,
    /// `None` once shutdown has been requested.
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    connections: Slab<MioConnection>,
    root: PathBuf,
    max_connections: usize,
    batch_size: usize,
}

/// Stops a running [`Server`] from another thread.
///
/// The listener is closed; connected clients are served until they
/// disconnect, then [`Server::run`] returns.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

impl Server {
    /// Bind the listening socket and prepare the poller.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let root = std::fs::canonicalize(&config.root)?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("root '{}' is not a directory", root.display()),
            ));
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            poll,
            listener: Some(listener),
            local_addr,
            waker,
            connections: Slab::with_capacity(config.max_connections),
            root,
            max_connections: config.max_connections,
            batch_size: config.batch_size.max(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
        }
    }

    /// Serve until shutdown is requested and the last client has left.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.batch_size);

        info!(
            addr = %self.local_addr,
            root = %self.root.display(),
            max_connections = self.max_connections,
            "Server listening"
        );

        loop {
            if self.listener.is_none() && self.connections.is_empty() {
                info!("Server stopped");
                return Ok(());
            }

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connection(),
                    WAKER_TOKEN => self.stop_accepting(),
                    Token(conn_id) => {
                        let result = self.handle_connection_event(conn_id, event);
                        match result {
                            Ok(true) => {}
                            Ok(false) => self.close_connection(conn_id),
                            Err(e) => {
                                debug!(conn_id, error = %e, "Connection error");
                                self.close_connection(conn_id);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Accept one pending connection.
    fn accept_connection(&mut self) {
        let listener = match self.listener.as_mut() {
            Some(listener) => listener,
            None => return,
        };

        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                error!(error = %e, "Accept error");
                return;
            }
        };

        // Re-arm so a backlog of pending connections is reported again
        if let Err(e) =
            self.poll
                .registry()
                .reregister(listener, LISTENER_TOKEN, Interest::READABLE)
        {
            error!(error = %e, "Failed to re-arm listener");
        }

        if self.connections.len() >= self.max_connections {
            warn!(peer = %peer, "Connection limit reached");
            return;
        }

        let entry = self.connections.vacant_entry();
        let conn_id = entry.key();
        let mut mio_conn = MioConnection {
            stream,
            peer,
            conn: Connection::new(self.root.clone()),
        };

        let registered = drive(&mut mio_conn).and_then(|()| {
            let interest = interest_for(&mio_conn.conn);
            self.poll
                .registry()
                .register(&mut mio_conn.stream, Token(conn_id), interest)
        });

        match registered {
            Ok(()) => {
                debug!(conn_id, peer = %peer, "Accepted connection");
                entry.insert(mio_conn);
            }
            Err(e) => debug!(peer = %peer, error = %e, "Failed to set up connection"),
        }
    }

    fn stop_accepting(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
            info!(
                connections = self.connections.len(),
                "Shutdown requested, no longer accepting"
            );
        }
    }

    /// Service one readiness event.
    ///
    /// Returns `Ok(false)` when the connection has closed gracefully.
    fn handle_connection_event(
        &mut self,
        conn_id: usize,
        event: &mio::event::Event,
    ) -> io::Result<bool> {
        let mio_conn = match self.connections.get_mut(conn_id) {
            Some(c) => c,
            None => return Ok(true),
        };

        if event.is_readable() && mio_conn.conn.state() == ConnState::Active {
            read_once(mio_conn)?;
        }

        drive(mio_conn)?;

        if mio_conn.conn.finish_close() {
            return Ok(false);
        }

        let interest = interest_for(&mio_conn.conn);
        self.poll
            .registry()
            .reregister(&mut mio_conn.stream, Token(conn_id), interest)?;
        Ok(true)
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut mio_conn) = self.connections.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut mio_conn.stream);
            debug!(
                conn_id,
                peer = %mio_conn.peer,
                unframed = mio_conn.conn.buffered_input(),
                "Connection closed"
            );
        }
    }
}

/// Perform one bounded read.
fn read_once(mio_conn: &mut MioConnection) -> io::Result<()> {
    let mut buf = [0u8; READ_CHUNK];
    match mio_conn.stream.read(&mut buf) {
        Ok(0) => {
            debug!(peer = %mio_conn.peer, "Peer closed connection");
            mio_conn.conn.begin_close();
            Ok(())
        }
        Ok(n) => {
            mio_conn.conn.receive(&buf[..n]);
            Ok(())
        }
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Write pending output and execute buffered lines, one at a time.
///
/// The next line is only executed once the previous response has been
/// written completely; if the socket stops accepting bytes the remaining
/// lines wait for the next writable event.
fn drive(mio_conn: &mut MioConnection) -> io::Result<()> {
    loop {
        flush(mio_conn)?;
        if mio_conn.conn.has_pending_output() {
            return Ok(());
        }
        if !step_contained(mio_conn) {
            return Ok(());
        }
    }
}

/// Execute the next line, containing any panic to this connection.
fn step_contained(mio_conn: &mut MioConnection) -> bool {
    match contain_panic(&mut mio_conn.conn, Connection::step) {
        Some(stepped) => stepped,
        None => {
            error!(peer = %mio_conn.peer, "Command handler panicked");
            true
        }
    }
}

/// Run `f` against `conn`, catching a panic.
///
/// On panic an error line is queued for the client, the connection stays
/// usable, and `None` is returned.
fn contain_panic<F>(conn: &mut Connection, f: F) -> Option<bool>
where
    F: FnOnce(&mut Connection) -> bool,
{
    match panic::catch_unwind(AssertUnwindSafe(|| f(&mut *conn))) {
        Ok(result) => Some(result),
        Err(_) => {
            conn.queue(&Response::text("internal error while executing command"));
            None
        }
    }
}

/// Write as much pending output as the socket accepts.
fn flush(mio_conn: &mut MioConnection) -> io::Result<()> {
    while mio_conn.conn.has_pending_output() {
        match mio_conn.stream.write(mio_conn.conn.pending_output()) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => mio_conn.conn.consume_output(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn interest_for(conn: &Connection) -> Interest {
    if conn.has_pending_output() {
        Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::{Shutdown, TcpStream as StdTcpStream};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const PROMPT: &str = "nnoopt-> ";

    type Running = (SocketAddr, ShutdownHandle, thread::JoinHandle<io::Result<()>>);

    fn start(root: &std::path::Path) -> Running {
        start_with_limit(root, 16)
    }

    fn start_with_limit(root: &std::path::Path, max_connections: usize) -> Running {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            root: root.to_path_buf(),
            max_connections,
            batch_size: 64,
            log_level: "info".to_string(),
        };
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let join = thread::spawn(move || server.run());
        (addr, handle, join)
    }

    fn connect(addr: SocketAddr) -> StdTcpStream {
        let stream = StdTcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Read until the accumulated text ends with `terminator`.
    fn read_until(stream: &mut StdTcpStream, terminator: &str) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        while !out.ends_with(terminator.as_bytes()) {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "unexpected EOF, got {:?}", String::from_utf8_lossy(&out));
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    fn send(stream: &mut StdTcpStream, line: &str) -> String {
        stream.write_all(line.as_bytes()).unwrap();
        read_until(stream, PROMPT)
    }

    fn canonical(dir: &TempDir) -> PathBuf {
        fs::canonicalize(dir.path()).unwrap()
    }

    #[test]
    fn test_end_to_end_session() {
        let dir = TempDir::new().unwrap();
        let root = canonical(&dir);
        fs::write(root.join("hello.txt"), b"hi").unwrap();
        fs::create_dir(root.join("docs")).unwrap();

        let (addr, handle, join) = start(&root);
        let mut client = connect(addr);

        assert_eq!(read_until(&mut client, PROMPT), "Welcome\n\rnnoopt-> ");
        assert_eq!(
            send(&mut client, "ls\n"),
            "docs [DIR]\nhello.txt [FILE] 2 bytes\n\rnnoopt-> "
        );
        assert_eq!(
            send(&mut client, "mkdir demo\n"),
            "directory demo created\n\rnnoopt-> "
        );
        assert_eq!(send(&mut client, "cd demo\n"), PROMPT);
        assert_eq!(send(&mut client, "ls\n"), "\n\rnnoopt-> ");
        assert_eq!(send(&mut client, "cat ../hello.txt\r\n"), "hi\n\rnnoopt-> ");
        assert_eq!(
            send(&mut client, "frobnicate\n"),
            "Command frobnicate is not exists\n\rnnoopt-> "
        );

        client.write_all(b"exit\n").unwrap();
        assert_eq!(read_until(&mut client, "\n\r"), "Bye\n\r");
        let mut rest = [0u8; 16];
        assert_eq!(client.read(&mut rest).unwrap(), 0);

        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_command_split_across_writes() {
        let dir = TempDir::new().unwrap();
        let root = canonical(&dir);
        let (addr, handle, join) = start(&root);
        let mut client = connect(addr);
        read_until(&mut client, PROMPT);

        for piece in ["mk", "dir sp", "lit", "\r", "\n"] {
            client.write_all(piece.as_bytes()).unwrap();
            client.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(
            read_until(&mut client, PROMPT),
            "directory split created\n\rnnoopt-> "
        );
        assert!(root.join("split").is_dir());

        drop(client);
        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_pipelined_lines_answered_in_order() {
        let dir = TempDir::new().unwrap();
        let root = canonical(&dir);
        let (addr, handle, join) = start(&root);
        let mut client = connect(addr);
        read_until(&mut client, PROMPT);

        client
            .write_all(b"mkdir one\ntouch one/f\ncd one\nls\n")
            .unwrap();
        let expected = "directory one created\n\rnnoopt-> \
                        File one/f created\n\rnnoopt-> \
                        nnoopt-> \
                        f [FILE] 0 bytes\n\rnnoopt-> ";
        assert_eq!(read_until(&mut client, "bytes\n\rnnoopt-> "), expected);

        drop(client);
        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_clients_have_private_directories() {
        let dir = TempDir::new().unwrap();
        let root = canonical(&dir);
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/only-in-sub"), b"").unwrap();

        let (addr, handle, join) = start(&root);
        let mut a = connect(addr);
        let mut b = connect(addr);
        read_until(&mut a, PROMPT);
        read_until(&mut b, PROMPT);

        assert_eq!(send(&mut a, "cd sub\n"), PROMPT);
        assert_eq!(
            send(&mut a, "ls\n"),
            "only-in-sub [FILE] 0 bytes\n\rnnoopt-> "
        );
        assert_eq!(send(&mut b, "ls\n"), "sub [DIR]\n\rnnoopt-> ");

        drop(a);
        drop(b);
        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_disconnect_does_not_affect_others() {
        let dir = TempDir::new().unwrap();
        let root = canonical(&dir);
        let (addr, handle, join) = start(&root);

        let mut survivor = connect(addr);
        read_until(&mut survivor, PROMPT);

        let mut leaver = connect(addr);
        read_until(&mut leaver, PROMPT);
        leaver.write_all(b"ls").unwrap();
        leaver.shutdown(Shutdown::Both).unwrap();
        drop(leaver);

        assert_eq!(
            send(&mut survivor, "touch still-here\n"),
            "File still-here created\n\rnnoopt-> "
        );

        drop(survivor);
        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_waits_for_connected_clients() {
        let dir = TempDir::new().unwrap();
        let root = canonical(&dir);
        let (addr, handle, join) = start(&root);

        let mut client = connect(addr);
        read_until(&mut client, PROMPT);

        handle.shutdown().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!join.is_finished());

        // Existing client is still served
        assert_eq!(send(&mut client, "mkdir late\n"), "directory late created\n\rnnoopt-> ");

        drop(client);
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_bind_rejects_file_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"").unwrap();

        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            root: file,
            max_connections: 1,
            batch_size: 1,
            log_level: "info".to_string(),
        };
        assert!(Server::bind(&config).is_err());
    }

    #[test]
    fn test_connection_limit_drops_extra_clients() {
        let dir = TempDir::new().unwrap();
        let root = canonical(&dir);
        let (addr, handle, join) = start_with_limit(&root, 1);

        let mut first = connect(addr);
        assert_eq!(read_until(&mut first, PROMPT), "Welcome\n\rnnoopt-> ");

        // Accepted and dropped without a welcome
        let mut second = connect(addr);
        let mut buf = [0u8; 64];
        assert_eq!(second.read(&mut buf).unwrap(), 0);

        assert_eq!(
            send(&mut first, "touch kept\n"),
            "File kept created\n\rnnoopt-> "
        );

        drop(second);
        drop(first);
        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_cat_on_fifo_does_not_stall_loop() {
        let dir = TempDir::new().unwrap();
        let root = canonical(&dir);
        let status = std::process::Command::new("mkfifo")
            .arg(root.join("pipe"))
            .status()
            .unwrap();
        assert!(status.success());

        let (addr, handle, join) = start(&root);
        let mut a = connect(addr);
        read_until(&mut a, PROMPT);
        assert_eq!(
            send(&mut a, "cat pipe\n"),
            "pipe is not a regular file\n\rnnoopt-> "
        );

        let mut b = connect(addr);
        assert_eq!(read_until(&mut b, PROMPT), "Welcome\n\rnnoopt-> ");

        drop(a);
        drop(b);
        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_panicking_command_is_contained() {
        let dir = TempDir::new().unwrap();
        let mut conn = Connection::new(canonical(&dir));
        let n = conn.pending_output().len();
        conn.consume_output(n);

        let result = contain_panic(&mut conn, |_| panic!("handler blew up"));
        assert_eq!(result, None);
        assert_eq!(
            conn.pending_output(),
            b"internal error while executing command\n\rnnoopt-> "
        );
        assert_eq!(conn.state(), ConnState::Active);

        // Non-panicking calls pass their result through
        assert_eq!(contain_panic(&mut conn, |_| false), Some(false));
    }
}
