use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::thread::{self, JoinHandle};

use crate::config::{Config, ConfigStore, ServerConfig, UserConfig, CONFIG_FILE};

/// Accepts a single connection on a loopback port and hands it to `handler`
/// on its own thread. Returns the port and the handler's join handle.
pub fn serve_once<T, F>(handler: F) -> (String, JoinHandle<T>)
where
    T: Send + 'static,
    F: FnOnce(TcpStream) -> T + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        handler(stream)
    });
    (port, handle)
}

/// A port nothing is listening on.
pub fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port().to_string()
}

/// Config store inside `dir` pointing at a loopback server and holding
/// credentials for `alice`.
pub fn store_for(dir: &Path, port: &str) -> ConfigStore {
    let store = ConfigStore::new(dir.join(CONFIG_FILE));
    let config = Config {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: port.into(),
        },
        user: UserConfig {
            user: "alice".into(),
            token: "abc".into(),
        },
    };
    store.save(&config).unwrap();
    store
}
