//! # Reflection Client
//!
//! A client for `grpc.reflection.v1`.
//!
//! Lists the services of a backend and downloads the file descriptors a service needs. The
//! server answers a `file_containing_symbol` request with one or more files; the client inspects
//! their imports and keeps asking for the missing ones, on the same stream, until the closure
//! is complete.
//!
//! Files are returned in arrival order, which servers commonly make dependents-first. Ordering
//! them for linking is the registry's job.
//!
//! ## References
//!
//! * [gRPC Server Reflection Protocol](https://github.com/grpc/grpc/blob/master/doc/server-reflection.md)
use crate::BackendService;
use futures_util::stream::once;
use prost::Message;
use prost_types::FileDescriptorProto;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Code, Streaming};
use tonic_reflection::pb::v1::{
    ServerReflectionRequest, ServerReflectionResponse,
    server_reflection_client::ServerReflectionClient, server_reflection_request::MessageRequest,
    server_reflection_response::MessageResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum ReflectionError {
    #[error("The backend refused to open a reflection stream: '{0}'")]
    StreamRefused(#[source] tonic::Status),

    #[error("The reflection stream ended with status: '{0}'")]
    StreamAborted(#[source] tonic::Status),

    #[error("The reflection stream ended before every request was answered")]
    StreamClosed,

    #[error("Failed to queue a reflection request")]
    SendFailed,

    #[error("The backend rejected a reflection request ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("Unexpected reflection answer: {0}")]
    UnexpectedAnswer(String),

    #[error("Invalid file descriptor in a reflection answer: {0}")]
    InvalidDescriptor(#[from] prost::DecodeError),
}

impl ReflectionError {
    /// Whether the backend could not be reached at all, as opposed to misbehaving once reached.
    pub fn is_unavailable(&self) -> bool {
        match self {
            ReflectionError::StreamRefused(_) => true,
            ReflectionError::StreamAborted(status) => status.code() == Code::Unavailable,
            _ => false,
        }
    }
}

// The host field of reflection requests is optional and servers ignore it.
const NO_HOST: &str = "";

pub struct ReflectionClient<S = Channel> {
    client: ServerReflectionClient<S>,
}

impl<S> ReflectionClient<S>
where
    S: BackendService,
{
    pub fn new(service: S) -> Self {
        let client = ServerReflectionClient::new(service);
        Self { client }
    }

    /// Service names, in the order the backend lists them.
    pub async fn list_services(&mut self) -> Result<Vec<String>, ReflectionError> {
        let list = request(MessageRequest::ListServices(String::new()));

        let mut answers = self
            .client
            .server_reflection_info(once(async { list }))
            .await
            .map_err(ReflectionError::StreamRefused)?
            .into_inner();

        let response = next_response(&mut answers).await?;

        match response.message_response {
            Some(MessageResponse::ListServicesResponse(listing)) => {
                Ok(listing.service.into_iter().map(|service| service.name).collect())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Fetches the file declaring `symbol` and every file it imports, transitively.
    ///
    /// # Returns
    ///
    /// * `Ok(files)` - The complete closure, in the order the server sent it.
    /// * `Err(ReflectionError)` - The stream failed or the server answered with an error.
    pub async fn file_descriptors_by_symbol(
        &mut self,
        symbol: &str,
    ) -> Result<Vec<FileDescriptorProto>, ReflectionError> {
        let (tx, rx) = mpsc::channel(32);

        let mut answers = self
            .client
            .server_reflection_info(ReceiverStream::new(rx))
            .await
            .map_err(ReflectionError::StreamRefused)?
            .into_inner();

        tx.send(request(MessageRequest::FileContainingSymbol(
            symbol.to_string(),
        )))
        .await
        .map_err(|_| ReflectionError::SendFailed)?;

        collect_closure(&mut answers, tx).await
    }
}

fn request(message: MessageRequest) -> ServerReflectionRequest {
    ServerReflectionRequest {
        host: NO_HOST.to_string(),
        message_request: Some(message),
    }
}

async fn next_response(
    stream: &mut Streaming<ServerReflectionResponse>,
) -> Result<ServerReflectionResponse, ReflectionError> {
    stream
        .message()
        .await
        .map_err(ReflectionError::StreamAborted)?
        .ok_or(ReflectionError::StreamClosed)
}

fn unexpected(response: Option<MessageResponse>) -> ReflectionError {
    match response {
        Some(MessageResponse::ErrorResponse(error)) => ReflectionError::Rejected {
            code: error.error_code,
            message: error.error_message,
        },
        Some(other) => ReflectionError::UnexpectedAnswer(format!("{other:?}")),
        None => ReflectionError::UnexpectedAnswer("empty answer".into()),
    }
}

/// Reads responses until no request is left unanswered, asking for every import not yet seen.
async fn collect_closure(
    response_stream: &mut Streaming<ServerReflectionResponse>,
    requests: mpsc::Sender<ServerReflectionRequest>,
) -> Result<Vec<FileDescriptorProto>, ReflectionError> {
    let mut inflight = 1usize;
    let mut files = Vec::new();
    let mut seen = HashSet::new();
    let mut asked = HashSet::new();

    while inflight > 0 {
        let response = next_response(response_stream).await?;
        inflight -= 1;

        let batch = match response.message_response {
            Some(MessageResponse::FileDescriptorResponse(res)) => res.file_descriptor_proto,
            other => return Err(unexpected(other)),
        };

        for raw in batch {
            let file = FileDescriptorProto::decode(raw.as_ref())?;
            if !seen.insert(file.name().to_string()) {
                continue;
            }

            for dep in &file.dependency {
                if !seen.contains(dep) && asked.insert(dep.clone()) {
                    requests
                        .send(request(MessageRequest::FileByFilename(dep.clone())))
                        .await
                        .map_err(|_| ReflectionError::SendFailed)?;
                    inflight += 1;
                }
            }

            files.push(file);
        }
    }

    Ok(files)
}
