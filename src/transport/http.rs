//! HTTP gateway for built assets.
//!
//! One blocking serve loop answers every request through the `fetch-asset`
//! command, which waits for the owning compiler to be stable before it
//! touches the output directory. Slow builds therefore show up to clients
//! as slow responses, never as stale files.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use tiny_http::{Header, Response, Server, StatusCode};
use tokio::runtime::Handle;

use crate::logger::Logger;
use crate::server::{AssetRequest, ServerCommands};

/// MIME constants for the asset types a bundle output contains.
mod types {
    pub const HTML: &str = "text/html; charset=utf-8";
    pub const PLAIN: &str = "text/plain; charset=utf-8";
    pub const CSS: &str = "text/css; charset=utf-8";
    pub const JAVASCRIPT: &str = "text/javascript; charset=utf-8";
    pub const JSON: &str = "application/json";
    pub const OCTET_STREAM: &str = "application/octet-stream";
    pub const WASM: &str = "application/wasm";
    pub const PNG: &str = "image/png";
    pub const JPEG: &str = "image/jpeg";
    pub const SVG: &str = "image/svg+xml";
    pub const ICO: &str = "image/x-icon";
    pub const WOFF2: &str = "font/woff2";
}

/// Guess the Content-Type for a public asset path.
pub(crate) fn content_type_for(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => types::HTML,
        Some("css") => types::CSS,
        Some("js" | "mjs" | "cjs") => types::JAVASCRIPT,
        // source maps are json under another name
        Some("json" | "map") => types::JSON,
        Some("wasm") => types::WASM,
        Some("svg") => types::SVG,
        Some("png") => types::PNG,
        Some("jpg" | "jpeg") => types::JPEG,
        Some("ico") => types::ICO,
        Some("woff2") => types::WOFF2,
        Some("txt") => types::PLAIN,
        _ => types::OCTET_STREAM,
    }
}

pub struct HttpGateway {
    log: Logger,
    port: u16,
    server: Arc<Server>,
}

impl HttpGateway {
    /// Bind and start answering asset requests on a dedicated thread.
    pub fn serve(
        log: &Logger,
        commands: Arc<ServerCommands>,
        host: &str,
        port: u16,
    ) -> anyhow::Result<Self> {
        let log = log.scoped("http");
        let server = Server::http(format!("{host}:{port}")).map_err(|err| {
            anyhow::anyhow!("failed to bind asset gateway on {host}:{port}: {err}")
        })?;
        let server = Arc::new(server);
        let port = match server.server_addr().to_ip() {
            Some(addr) => addr.port(),
            None => port,
        };
        let handle = Handle::current();

        {
            let log = log.clone();
            let server = Arc::clone(&server);
            thread::spawn(move || serve_loop(log, server, commands, handle));
        }

        log.info(format!("asset gateway on http://{host}:{port}"));
        Ok(Self { log, port, server })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Unblock the serve loop; it exits on the next woken receive.
    pub fn shutdown(&self) {
        self.server.unblock();
        self.log.debug("http gateway closed");
    }
}

fn serve_loop(log: Logger, server: Arc<Server>, commands: Arc<ServerCommands>, handle: Handle) {
    for request in server.incoming_requests() {
        let path = match request.url().split('?').next() {
            Some(path) => path.to_string(),
            None => "/".to_string(),
        };
        let outcome = handle.block_on(commands.fetch_asset.execute(AssetRequest::new(&path)));
        let result = match outcome {
            Ok(Some(asset)) => {
                let body = asset.bytes.as_slice().to_vec();
                request.respond(
                    Response::from_data(body)
                        .with_header(make_header("Content-Type", asset.content_type)),
                )
            }
            Ok(None) => request.respond(
                Response::from_string("404 Not Found")
                    .with_status_code(StatusCode(404))
                    .with_header(make_header("Content-Type", types::PLAIN)),
            ),
            Err(err) => {
                log.error(format!("asset fetch failed for {path}: {err:#}"));
                request.respond(
                    Response::from_string("500 Internal Server Error")
                        .with_status_code(StatusCode(500))
                        .with_header(make_header("Content-Type", types::PLAIN)),
                )
            }
        };
        if let Err(e) = result {
            log.debug(format!("response for {path} not delivered: {e}"));
        }
    }
}

fn make_header(key: &'static str, value: &'static str) -> Header {
    Header::from_bytes(key, value).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_table() {
        assert_eq!(content_type_for("/web/index.html"), types::HTML);
        assert_eq!(content_type_for("/web/app.js"), types::JAVASCRIPT);
        assert_eq!(content_type_for("/web/chunk.mjs"), types::JAVASCRIPT);
        assert_eq!(content_type_for("/web/styles.css"), types::CSS);
        assert_eq!(content_type_for("/web/app.js.map"), types::JSON);
        assert_eq!(content_type_for("/web/mod.wasm"), types::WASM);
        assert_eq!(content_type_for("/web/logo.svg"), types::SVG);
        assert_eq!(content_type_for("/web/font.woff2"), types::WOFF2);
        assert_eq!(content_type_for("/web/blob.xyz"), types::OCTET_STREAM);
        assert_eq!(content_type_for("/web/no-extension"), types::OCTET_STREAM);
    }
}
