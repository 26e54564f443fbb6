use chrono::Utc;
use portia_core::protocol::{parse_request, Command, RejectedRequest, Reply, Request};
use portia_core::{parse_timestamp, InvalidTimestamp, Msisdn, MsisdnError};
use portia_resolver::ResolutionEngine;
use portia_storage::{AnnotationStore, StorageError};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Msisdn(#[from] MsisdnError),
    #[error(transparent)]
    Timestamp(#[from] InvalidTimestamp),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CommandError {
    pub fn is_validation(&self) -> bool {
        match self {
            CommandError::Msisdn(_) | CommandError::Timestamp(_) => true,
            CommandError::Storage(err) => err.is_validation(),
            CommandError::Encode(_) => false,
        }
    }
}

/// Shared by every connection and HTTP request.
pub struct Dispatcher {
    engine: ResolutionEngine,
    max_frame_bytes: usize,
}

impl Dispatcher {
    pub fn new(engine: ResolutionEngine, max_frame_bytes: usize) -> Self {
        Self {
            engine,
            max_frame_bytes,
        }
    }

    pub fn store(&self) -> &AnnotationStore {
        self.engine.store()
    }

    pub fn engine(&self) -> &ResolutionEngine {
        &self.engine
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn parse(&self, line: &[u8]) -> Result<Request, RejectedRequest> {
        parse_request(line, self.max_frame_bytes).map_err(|rejected| {
            debug!(event = "request_rejected", error = %rejected.error);
            rejected
        })
    }

    pub async fn handle_request(&self, request: Request) -> Reply {
        let cmd = request.command.name().as_str();
        match self.execute(request.command).await {
            Ok(response) => Reply::ok(cmd, request.id, response),
            Err(err) => {
                debug!(event = "command_failed", cmd, error = %err);
                Reply::error(Some(cmd.to_string()), request.id, err.to_string())
            }
        }
    }

    pub async fn execute(&self, command: Command) -> Result<Value, CommandError> {
        match command {
            Command::Get(args) => {
                let msisdn = Msisdn::parse(&args.msisdn)?;
                let entry = self.store().get_annotations(&msisdn).await?;
                Ok(serde_json::to_value(entry)?)
            }
            Command::Annotate(args) => {
                let msisdn = Msisdn::parse(&args.msisdn)?;
                let timestamp = match args.timestamp.as_deref() {
                    Some(raw) => parse_timestamp(raw)?,
                    None => Utc::now(),
                };
                let written = self
                    .store()
                    .annotate(&msisdn, &args.key, &args.value, timestamp)
                    .await?;
                Ok(serde_json::to_value(written)?)
            }
            Command::Resolve(args) => {
                let msisdn = Msisdn::parse(&args.msisdn)?;
                let result = self.engine.resolve(&msisdn).await?;
                Ok(serde_json::to_value(result)?)
            }
        }
    }
}
