//! Convenience client for the framed TCP API.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use pnyx_model::Version;

use crate::{ApiError, Receipt, Request, Response, Transaction};

/// One connection to an [`crate::ApiServer`].
pub struct ApiClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl ApiClient {
    pub async fn connect(addr: SocketAddr) -> Result<ApiClient, ApiError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(ApiClient {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        })
    }

    async fn call(&mut self, request: Request) -> Result<Response, ApiError> {
        let bytes = borsh::to_vec(&request)?;
        self.framed.send(bytes.into()).await?;

        let frame = self.framed.next().await.ok_or(ApiError::Closed)??;
        let response = borsh::from_slice::<Response>(&frame)?;
        match response {
            Response::Error(message) => Err(ApiError::Remote(message)),
            other => Ok(other),
        }
    }

    /// Current value of a key.
    pub async fn get(&mut self, key: &str) -> Result<(Version, Vec<u8>), ApiError> {
        match self.call(Request::Get { key: key.into() }).await? {
            Response::Value { version, data } => Ok((version, data)),
            _ => Err(ApiError::UnexpectedResponse),
        }
    }

    /// Elements of a set-typed key.
    pub async fn members(&mut self, key: &str) -> Result<(Version, Vec<Vec<u8>>), ApiError> {
        match self.call(Request::Members { key: key.into() }).await? {
            Response::Values { version, elements } => Ok((version, elements)),
            _ => Err(ApiError::UnexpectedResponse),
        }
    }

    /// Whether a set-typed key contains a value.
    pub async fn contains(&mut self, key: &str, value: &[u8]) -> Result<bool, ApiError> {
        let request = Request::Contains {
            key: key.into(),
            value: value.to_vec(),
        };
        match self.call(request).await? {
            Response::Boolean(contained) => Ok(contained),
            _ => Err(ApiError::UnexpectedResponse),
        }
    }

    /// Submit a transaction; returns the receipt with the query uuid.
    pub async fn submit(&mut self, transaction: Transaction) -> Result<Receipt, ApiError> {
        match self.call(Request::Submit(transaction)).await? {
            Response::Receipt(receipt) => Ok(receipt),
            _ => Err(ApiError::UnexpectedResponse),
        }
    }
}
