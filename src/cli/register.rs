use serde_json::Value;
use tracing::{info, warn};

use super::CommandError;
use crate::config::{ConfigStore, UserConfig};
use crate::connector::{ConnectOptions, ServerConnector};
use crate::protocol::{action, code, Request};

pub fn run(store: &ConfigStore, options: ConnectOptions) -> Result<(), CommandError> {
    let mut config = store.load();

    // No credentials exist yet, so the request goes out without auth meta.
    let mut connector = ServerConnector::new(UserConfig::default(), options);
    connector.connect(&config.server.host, &config.server.port)?;
    let response = connector.send_and_disconnect(Request::new(action::REGISTER))?;

    if response.code != code::OK {
        return Err(CommandError::ServerError {
            code: response.code,
            data: Value::Object(response.data),
        });
    }

    let user = response
        .data_str("user")
        .ok_or(CommandError::MissingField("user"))?
        .to_string();
    let token = response
        .data_str("token")
        .ok_or(CommandError::MissingField("token"))?
        .to_string();

    if !config.user.is_empty() {
        warn!(
            "Replacing stored credentials of '{}' in {:?}",
            config.user.user,
            store.path()
        );
    }
    config.user = UserConfig { user, token };
    store.save(&config)?;

    info!("Registered as {}", config.user.user);
    println!("successfully registered as {}", config.user.user);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use tempfile::TempDir;

    use crate::protocol::ProtocolError;
    use crate::test_support::{closed_port, serve_once, store_for};

    fn register_server(reply: &'static str) -> (String, std::thread::JoinHandle<Value>) {
        serve_once(move |stream| {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            reader.get_mut().write_all(reply.as_bytes()).unwrap();
            serde_json::from_str(&line).unwrap()
        })
    }

    #[test]
    fn successful_register_persists_credentials() {
        let dir = TempDir::new().unwrap();
        let (port, server) =
            register_server("{\"code\":0,\"data\":{\"user\":\"bob\",\"token\":\"t0k\"}}\n");
        let store = store_for(dir.path(), &port);

        run(&store, ConnectOptions::default()).unwrap();

        let request = server.join().unwrap();
        assert_eq!(request, serde_json::json!({"action": "register", "meta": {}}));

        let config = store.load();
        assert_eq!(config.user.user, "bob");
        assert_eq!(config.user.token, "t0k");
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, port);
    }

    #[test]
    fn failed_register_keeps_existing_credentials() {
        let dir = TempDir::new().unwrap();
        let (port, server) =
            register_server("{\"code\":1,\"data\":{\"message\":\"registration closed\"}}\n");
        let store = store_for(dir.path(), &port);

        let err = run(&store, ConnectOptions::default()).unwrap_err();
        server.join().unwrap();

        match err {
            CommandError::ServerError { code, data } => {
                assert_eq!(code, 1);
                assert_eq!(data["message"], "registration closed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.load().user.user, "alice");
    }

    #[test]
    fn missing_token_is_reported() {
        let dir = TempDir::new().unwrap();
        let (port, server) = register_server("{\"code\":0,\"data\":{\"user\":\"bob\"}}\n");
        let store = store_for(dir.path(), &port);

        let err = run(&store, ConnectOptions::default()).unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, CommandError::MissingField("token")));
        assert_eq!(store.load().user.token, "abc");
    }

    #[test]
    fn unreachable_server_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = store_for(dir.path(), &closed_port());

        let err = run(&store, ConnectOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            CommandError::Protocol(ProtocolError::ConnectFailed { .. })
        ));
    }
}
