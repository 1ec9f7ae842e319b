use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use super::CommandError;
use crate::config::ConfigStore;
use crate::connector::{ConnectOptions, ServerConnector};
use crate::progress;
use crate::protocol::{self, action, code, ProtocolError, Request, SIGNAL_READY};
use crate::transfer;

pub struct UploadArgs<'a> {
    pub path: &'a Path,
    pub name: Option<&'a str>,
    pub overwrite: bool,
}

pub fn run(
    store: &ConfigStore,
    options: ConnectOptions,
    args: &UploadArgs<'_>,
) -> Result<(), CommandError> {
    let path = std::env::current_dir()
        .map(|cwd| cwd.join(args.path))
        .map_err(|source| local_io(args.path, source))?;

    let file = File::open(&path).map_err(|source| local_io(&path, source))?;
    let metadata = file.metadata().map_err(|source| local_io(&path, source))?;
    if !metadata.is_file() {
        return Err(local_io(
            &path,
            std::io::Error::new(ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    let size = metadata.len();
    let resource_name = resource_name(&path, args.name).ok_or_else(|| {
        local_io(
            &path,
            std::io::Error::new(ErrorKind::InvalidInput, "cannot derive a resource name"),
        )
    })?;

    let config = store.load();
    if config.user.is_empty() {
        warn!("No credentials stored, run `luxbox register` first");
    }

    let request = Request::new(action::UPLOAD)
        .with_meta("resourceName", resource_name.clone())
        .with_meta("resourceSize", size)
        .with_meta("overwrite", args.overwrite);

    let mut connector = ServerConnector::new(config.user, options);
    connector.connect(&config.server.host, &config.server.port)?;
    connector.set_auth_enabled(true);
    connector.send_request(request)?;

    // The server allocates the resource before it accepts any bytes.
    connector
        .wait_for_signal(SIGNAL_READY)
        .map_err(refused_upload)?;

    info!("Uploading {:?} as '{}' ({} bytes)", path, resource_name, size);
    let mut reader = BufReader::new(file);
    let mut bar = progress::transfer_bar(&resource_name, size);
    let state = transfer::put_stream(&mut reader, connector.data_stream()?, size, &mut bar)?;

    let response = connector.get_response()?;
    connector.disconnect();

    if response.code != code::TRANSFER_COMPLETE {
        return Err(CommandError::ServerError {
            code: response.code,
            data: Value::Object(response.data),
        });
    }

    println!("uploaded {} ({} bytes)", resource_name, state.bytes_written);
    Ok(())
}

/// The `--name` flag when given and non-empty, the local file name otherwise.
fn resource_name(path: &Path, name: Option<&str>) -> Option<String> {
    match name.filter(|n| !n.is_empty()) {
        Some(name) => Some(name.to_string()),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
    }
}

/// A server that refuses an upload answers with a regular response in place
/// of the ready signal.
fn refused_upload(err: ProtocolError) -> CommandError {
    if let ProtocolError::UnexpectedSignal { actual, .. } = &err {
        if let Ok(response) = protocol::decode(actual) {
            return CommandError::ServerError {
                code: response.code,
                data: Value::Object(response.data),
            };
        }
    }
    err.into()
}

fn local_io(path: &Path, source: std::io::Error) -> CommandError {
    CommandError::LocalIo {
        path: PathBuf::from(path),
        source,
    }
}
