//! Purpose: Run the JSON-RPC control surface over stdio.
//! Exports: `serve`.
//! Role: Bridge newline-delimited JSON-RPC lines to the shared dispatcher.
//! Invariants: stdout only emits JSON-RPC messages (one JSON value per line).
//! Invariants: stdin EOF or an `Exit` call ends the loop and releases the engine.
//! Invariants: Parse/protocol errors are surfaced as JSON-RPC error responses.
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nekobox_core::control::ControlService;
use nekobox_core::core::error::{Error, ErrorKind};
use nekobox_core::rpc::{
    DispatchOutcome, JsonRpcError, JsonRpcId, JsonRpcResponse, RpcDispatcher, parse_jsonrpc_line,
};
use serde_json::Value;
use tracing::info;

pub(super) fn serve(service: Arc<ControlService>) -> Result<(), Error> {
    let exit_requested = Arc::new(AtomicBool::new(false));
    {
        let exit_requested = Arc::clone(&exit_requested);
        service.on_exit(move || exit_requested.store(true, Ordering::Release));
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = BufWriter::new(stdout.lock());
    let dispatcher = RpcDispatcher::new(Arc::clone(&service));
    let mut line = String::new();

    let result = loop {
        if exit_requested.load(Ordering::Acquire) {
            info!("exit requested over rpc");
            break Ok(());
        }
        line.clear();
        let read = match reader.read_line(&mut line) {
            Ok(read) => read,
            Err(err) => {
                break Err(Error::new(ErrorKind::Io)
                    .with_message("failed to read rpc request")
                    .with_source(err));
            }
        };
        if read == 0 {
            break Ok(());
        }

        let message = line.trim_end_matches(['\n', '\r']);
        if message.is_empty() {
            continue;
        }

        let response = match parse_jsonrpc_line(message) {
            Ok(request) => match dispatcher.dispatch_value(request) {
                DispatchOutcome::NoResponse => continue,
                DispatchOutcome::Response(response) => response,
            },
            Err(error) => parse_error(error),
        };
        let payload = match serde_json::to_value(response) {
            Ok(payload) => payload,
            Err(err) => {
                break Err(Error::new(ErrorKind::Internal)
                    .with_message("failed to encode rpc response")
                    .with_source(err));
            }
        };
        if let Err(err) = write_json_line(&mut writer, &payload) {
            break Err(err);
        }
    };

    service.exit();
    result
}

fn parse_error(error: JsonRpcError) -> JsonRpcResponse {
    JsonRpcResponse::error(JsonRpcId::Null, error)
}

fn write_json_line(
    writer: &mut BufWriter<io::StdoutLock<'_>>,
    payload: &Value,
) -> Result<(), Error> {
    serde_json::to_writer(&mut *writer, payload).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode rpc message")
            .with_source(err)
    })?;
    writer.write_all(b"\n").map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write rpc message")
            .with_source(err)
    })?;
    writer.flush().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to flush rpc message")
            .with_source(err)
    })
}
