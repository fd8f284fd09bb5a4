use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tungstenite::WebSocket;

use crate::scheduler::BuildRun;

/// Most connections kept open at once. Older tabs are closed first.
const MAX_CLIENTS: usize = 10;

type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// Notified by the watch loop after every successful build.
pub trait BuildListener {
    fn notify_ready(&self, run: &BuildRun);
}

/// Pushes a `"reload"` message to every connected browser tab.
///
/// The pages connect through the script from
/// [`Environment::get_refresh_script`](crate::Environment::get_refresh_script).
pub struct LiveReload {
    port: u16,
    clients: Clients,
    tx: Sender<()>,
    _incoming: JoinHandle<()>,
    _broadcast: JoinHandle<()>,
}

impl LiveReload {
    /// Bind the WebSocket port, preferring 1337.
    pub fn reserve() -> io::Result<TcpListener> {
        match TcpListener::bind("127.0.0.1:1337") {
            Ok(sock) => Ok(sock),
            Err(_) => TcpListener::bind("127.0.0.1:0"),
        }
    }

    /// Start accepting connections on `listener`.
    pub fn start(listener: TcpListener) -> io::Result<Self> {
        let port = listener.local_addr()?.port();
        let clients: Clients = Arc::default();

        let incoming = new_thread_ws_incoming(listener, clients.clone());
        let (tx, broadcast) = new_thread_ws_reload(clients.clone());

        Ok(Self {
            port,
            clients,
            tx,
            _incoming: incoming,
            _broadcast: broadcast,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of currently connected clients.
    pub fn connected(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl BuildListener for LiveReload {
    fn notify_ready(&self, _: &BuildRun) {
        if self.tx.send(()).is_err() {
            tracing::warn!("live-reload thread is gone");
        }
    }
}

fn new_thread_ws_incoming(server: TcpListener, clients: Clients) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!("live-reload connection failed: {e}");
                    continue;
                }
            };

            match tungstenite::accept(stream) {
                Ok(socket) => clients
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(socket),
                Err(e) => tracing::debug!("live-reload handshake failed: {e}"),
            }
        }
    })
}

fn new_thread_ws_reload(clients: Clients) -> (Sender<()>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();

    let thread = std::thread::spawn(move || {
        while rx.recv().is_ok() {
            let mut clients = clients.lock().unwrap_or_else(PoisonError::into_inner);
            let mut broken = vec![];

            for (i, socket) in clients.iter_mut().enumerate() {
                match socket.send("reload".into()) {
                    Ok(_) => {}
                    Err(tungstenite::Error::Io(e)) => {
                        tracing::debug!("dropping live-reload client: {e}");
                        broken.push(i);
                    }
                    Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                        broken.push(i);
                    }
                    Err(e) => {
                        tracing::error!("Error: {e:?}");
                    }
                }
            }

            for i in broken.into_iter().rev() {
                clients.remove(i);
            }

            let len = clients.len();
            if len > MAX_CLIENTS {
                for mut socket in clients.drain(0..len - MAX_CLIENTS) {
                    socket.close(None).ok();
                }
            }
        }
    });

    (tx, thread)
}
