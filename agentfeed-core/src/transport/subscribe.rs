use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{BodyReader, Transport, TransportKind};
use crate::error::CoreResult;
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::GenerationRequest;

/// Push-subscribe stream: a GET whose query string carries the request.
///
/// `open` may be called repeatedly; each call replaces the previous body.
pub struct SubscribeTransport {
    client: HttpClient,
    url: String,
    query: Vec<(&'static str, String)>,
    connection_id: String,
    reader: BodyReader,
    opens: u32,
}

impl SubscribeTransport {
    pub fn new(client: HttpClient, url: String, request: GenerationRequest, connection_id: String) -> Self {
        Self {
            client,
            url,
            query: request.to_query_pairs(),
            connection_id,
            reader: BodyReader::new(TransportKind::Subscribe),
            opens: 0,
        }
    }

}

#[async_trait]
impl Transport for SubscribeTransport {
    async fn open(&mut self) -> CoreResult<()> {
        self.reader.close();
        debug!(url = %self.url, connection = %self.connection_id, attempt = self.opens, "subscribing");
        let ctx = RequestCtx {
            request_id: Some(&self.connection_id),
        };
        let body = self.client.get_stream(&self.url, &self.query, &ctx).await?;
        self.reader.set(body);
        self.opens += 1;
        Ok(())
    }

    async fn read(&mut self) -> CoreResult<Option<Bytes>> {
        self.reader.next().await
    }

    fn cancel(&mut self) {
        self.reader.close();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Subscribe
    }
}
