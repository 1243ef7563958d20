//! The API endpoint: answers client requests against one engine.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pnyx_consensus::{operations, Engine};
use pnyx_model::Query;

use crate::{ApiError, Receipt, Request, Response, Transaction};

/// Framed TCP endpoint serving the client API over one engine.
pub struct ApiServer {
    engine: Arc<Engine>,
    local_addr: SocketAddr,
    token: CancellationToken,
}

impl ApiServer {
    /// Bind the listener and start answering clients.
    pub async fn bind(
        engine: Arc<Engine>,
        listen: SocketAddr,
        token: CancellationToken,
    ) -> Result<ApiServer, ApiError> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;

        let server = ApiServer {
            engine: engine.clone(),
            local_addr,
            token: token.clone(),
        };

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, remote)) = accepted else { continue };

                let engine = engine.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    debug!(client = %remote, "api client connected");
                    if let Err(e) = serve_connection(engine, stream, token).await {
                        debug!(client = %remote, error = %e, "api connection ended");
                    }
                });
            }
        });

        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

async fn serve_connection(
    engine: Arc<Engine>,
    stream: TcpStream,
    token: CancellationToken,
) -> Result<(), ApiError> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            frame = framed.next() => match frame {
                Some(frame) => frame?,
                None => return Ok(()),
            },
        };

        let response = match borsh::from_slice::<Request>(&frame) {
            Ok(request) => handle_request(&engine, request)
                .await
                .unwrap_or_else(|e| Response::Error(e.to_string())),
            Err(e) => {
                warn!(error = %e, "malformed api request");
                Response::Error(format!("malformed request: {e}"))
            }
        };

        let bytes = borsh::to_vec(&response)?;
        framed.send(bytes.into()).await?;
    }
}

async fn handle_request(engine: &Arc<Engine>, request: Request) -> Result<Response, ApiError> {
    match request {
        Request::Get { key } => {
            let (data, version) = engine.store().get(&key)?;
            Ok(Response::Value { version, data })
        }

        Request::Members { key } => {
            let (data, version) = engine.store().get(&key)?;
            let members = operations::decode_set(&data)?;
            Ok(Response::Values {
                version,
                elements: members.into_iter().collect(),
            })
        }

        Request::Contains { key, value } => {
            let (data, _) = engine.store().get(&key)?;
            let members = operations::decode_set(&data)?;
            Ok(Response::Boolean(members.contains(&value)))
        }

        Request::Submit(transaction) => {
            let query = query_from_transaction(transaction);
            let uuid = engine.submit(query).await?;
            Ok(Response::Receipt(Receipt { uuid }))
        }
    }
}

fn query_from_transaction(transaction: Transaction) -> Query {
    let mut query = Query::new();
    query.policy = transaction.policy;
    query.deadline = transaction.deadline;
    query.requirements = transaction.requirements;
    query.operations = transaction.operations;
    query
}
