use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{BodyReader, Transport, TransportKind};
use crate::error::CoreResult;
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::GenerationRequest;

/// POSTs the request as JSON and streams the response body.
pub struct RequestStreamTransport {
    client: HttpClient,
    url: String,
    request: GenerationRequest,
    connection_id: String,
    reader: BodyReader,
}

impl RequestStreamTransport {
    pub fn new(client: HttpClient, url: String, request: GenerationRequest, connection_id: String) -> Self {
        Self {
            client,
            url,
            request,
            connection_id,
            reader: BodyReader::new(TransportKind::RequestStream),
        }
    }
}

#[async_trait]
impl Transport for RequestStreamTransport {
    async fn open(&mut self) -> CoreResult<()> {
        debug!(url = %self.url, connection = %self.connection_id, "opening request stream");
        let ctx = RequestCtx {
            request_id: Some(&self.connection_id),
        };
        let body = self.client.post_stream(&self.url, &self.request, &ctx).await?;
        self.reader.set(body);
        Ok(())
    }

    async fn read(&mut self) -> CoreResult<Option<Bytes>> {
        self.reader.next().await
    }

    fn cancel(&mut self) {
        self.reader.close();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::RequestStream
    }
}
