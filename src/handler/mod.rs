//! One connection, end to end: read, parse, compile, respond, clean up.
//!
//! Never fails past its boundary. Every outcome is either a response sent
//! to the client or a log line, and the scratch workspace is always removed
//! before the response is written.

mod workspace;

use std::{path::PathBuf, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::{debug, error, info, warn};

pub use workspace::Workspace;

use crate::{
    pipeline::Pipeline,
    process::CommandRunner,
    protocol::{parse_request, FrameLimits, FrameReader, Request, Response},
};

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub limits: FrameLimits,
    pub write_timeout: Duration,
    pub scratch_root: PathBuf,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            limits: FrameLimits::default(),
            write_timeout: Duration::from_secs(60),
            scratch_root: std::env::temp_dir(),
        }
    }
}

pub struct Handler<R> {
    pipeline: Pipeline<R>,
    settings: HandlerSettings,
}

impl<R: CommandRunner> Handler<R> {
    pub fn new(pipeline: Pipeline<R>, settings: HandlerSettings) -> Self {
        Self { pipeline, settings }
    }

    pub fn pipeline(&self) -> &Pipeline<R> {
        &self.pipeline
    }

    pub async fn handle<S>(&self, mut stream: S, peer: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(peer, "connection opened");
        let mut workspace = None;

        let response = match FrameReader::new(self.settings.limits).read_from(&mut stream).await {
            Ok(data) => match parse_request(&data) {
                Ok(request) => self.process(request, &mut workspace).await,
                Err(e) => {
                    warn!(peer, error = %e, "malformed request");
                    Response::from(&e)
                }
            },
            Err(e) => {
                warn!(peer, error = %e, "could not read request");
                Response::from(&e)
            }
        };

        // Removed before replying so a client that saw the result never sees leftovers.
        if let Some(ws) = workspace.take() {
            ws.cleanup();
        }

        self.send(&mut stream, &response, peer).await;
        if let Err(e) = stream.shutdown().await {
            debug!(peer, error = %e, "close failed");
        }
        info!(peer, "connection closed");
    }

    async fn process(&self, request: Request, workspace: &mut Option<Workspace>) -> Response {
        let extension = request.extension();
        info!(
            filename = %request.filename,
            extension = %extension,
            code_len = request.source_code.len(),
            "request received"
        );

        let ws = match Workspace::create(
            &self.settings.scratch_root,
            &request.filename,
            &extension,
            &request.source_code,
        ) {
            Ok(ws) => workspace.insert(ws),
            Err(e) => {
                error!(error = %format!("{e:#}"), "could not materialize source");
                return Response::new(format!("Server error: {e:#}"));
            }
        };

        match self.pipeline.handle(ws.source_path(), &extension).await {
            Ok(result) => {
                info!(success = result.overall_success, len = result.transcript.len(), "pipeline finished");
                Response::new(result.transcript)
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "pipeline error");
                Response::new(format!("Compilation failed with exception: {e:#}"))
            }
        }
    }

    async fn send<S>(&self, stream: &mut S, response: &Response, peer: &str)
    where
        S: AsyncWrite + Unpin,
    {
        let bytes = response.to_bytes();
        let write = async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        };
        match timeout(self.settings.write_timeout, write).await {
            Ok(Ok(())) => debug!(peer, bytes = bytes.len(), "response sent"),
            Ok(Err(e)) => warn!(peer, error = %e, "client went away before the response was sent"),
            Err(_) => warn!(peer, "timed out sending response"),
        }
    }
}
