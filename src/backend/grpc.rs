use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tonic::{
    codec::Streaming,
    transport::{Channel, ClientTlsConfig, Endpoint},
    Code, Status,
};
use tracing::{debug, info, warn};

use crate::backend::proto::{gpt, vertex};
use crate::backend::{BackendError, DeltaStream, InferenceBackend};
use crate::config::{GatewayConfig, PoolConfig};
use crate::models::ChatCompletionsResponse;
use crate::pool::{ConnectionPool, ManageConnection, PoolError, PoolStatus, PooledConnection};
use crate::tokenizer::TokenCounter;
use crate::translate::{BackendFamily, FamilyCodec, Gpt, RoutedRequest, StreamEvent, Vertex};

const USER_AGENT: &str = "dart-grpc/2.0.0";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WINDOW_SIZE: u32 = 1 << 20;

/// Builds channels to one backend address.
pub struct GrpcConnector {
    address: String,
    endpoint: Endpoint,
}

impl GrpcConnector {
    pub fn new(address: &str) -> Result<Self, BackendError> {
        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_owned()
        } else {
            format!("https://{address}")
        };
        let connect_error = |error: tonic::transport::Error| BackendError::Connect(error.to_string());

        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(connect_error)?
            .user_agent(USER_AGENT)
            .map_err(connect_error)?
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(false)
            .initial_stream_window_size(WINDOW_SIZE)
            .initial_connection_window_size(WINDOW_SIZE)
            .connect_timeout(CONNECT_TIMEOUT);
        if uri.starts_with("https://") {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_webpki_roots())
                .map_err(connect_error)?;
        }

        debug!(uri = %uri, "configured backend endpoint");
        Ok(Self {
            address: address.to_owned(),
            endpoint,
        })
    }
}

/// One multiplexed HTTP/2 channel plus a flag set once the transport reports it
/// unusable.
pub struct GrpcConnection {
    channel: Channel,
    broken: AtomicBool,
}

impl GrpcConnection {
    fn channel(&self) -> Channel {
        self.channel.clone()
    }

    fn observe(&self, status: &Status) {
        if status.code() == Code::Unavailable {
            self.broken.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ManageConnection for GrpcConnector {
    type Connection = GrpcConnection;

    async fn connect(&self) -> Result<GrpcConnection, PoolError> {
        debug!(address = %self.address, "opening backend channel");
        Ok(GrpcConnection {
            channel: self.endpoint.connect_lazy(),
            broken: AtomicBool::new(false),
        })
    }

    fn is_broken(&self, connection: &GrpcConnection) -> bool {
        connection.broken.load(Ordering::SeqCst)
    }
}

/// The two RPCs each family exposes.
#[async_trait]
trait Rpc: FamilyCodec + 'static {
    async fn predict(channel: Channel, request: Self::Request) -> Result<Self::Response, Status>;

    async fn predict_with_stream(
        channel: Channel,
        request: Self::Request,
    ) -> Result<Streaming<Self::Response>, Status>;
}

#[async_trait]
impl Rpc for Gpt {
    async fn predict(channel: Channel, request: gpt::Request) -> Result<gpt::Response, Status> {
        let mut client = gpt::GptInferenceClient::new(channel);
        Ok(client.predict(request).await?.into_inner())
    }

    async fn predict_with_stream(
        channel: Channel,
        request: gpt::Request,
    ) -> Result<Streaming<gpt::Response>, Status> {
        let mut client = gpt::GptInferenceClient::new(channel);
        Ok(client.predict_with_stream(request).await?.into_inner())
    }
}

#[async_trait]
impl Rpc for Vertex {
    async fn predict(
        channel: Channel,
        request: vertex::Requests,
    ) -> Result<vertex::Response, Status> {
        let mut client = vertex::VertexInferenceClient::new(channel);
        Ok(client.predict(request).await?.into_inner())
    }

    async fn predict_with_stream(
        channel: Channel,
        request: vertex::Requests,
    ) -> Result<Streaming<vertex::Response>, Status> {
        let mut client = vertex::VertexInferenceClient::new(channel);
        Ok(client.predict_with_stream(request).await?.into_inner())
    }
}

/// Backend that speaks gRPC to the GPT and Vertex inference services through one
/// connection pool per service.
pub struct GrpcBackend {
    gpt: Option<ConnectionPool<GrpcConnector>>,
    vertex: Option<ConnectionPool<GrpcConnector>>,
    tokens: Arc<dyn TokenCounter>,
}

impl GrpcBackend {
    pub async fn connect(
        config: &GatewayConfig,
        tokens: Arc<dyn TokenCounter>,
    ) -> Result<Self, BackendError> {
        let gpt = build_pool("gpt", &config.gpt_addr, &config.pool).await?;
        let vertex = build_pool("vertex", &config.vertex_addr, &config.pool).await?;
        Ok(Self { gpt, vertex, tokens })
    }

    pub fn spawn_autoscalers(&self, interval: Duration) -> Vec<JoinHandle<()>> {
        [&self.gpt, &self.vertex]
            .into_iter()
            .flatten()
            .map(|pool| pool.spawn_autoscaler(interval))
            .collect()
    }

    fn pool(&self, family: BackendFamily) -> Result<&ConnectionPool<GrpcConnector>, BackendError> {
        let pool = match family {
            BackendFamily::Gpt => self.gpt.as_ref(),
            BackendFamily::Vertex => self.vertex.as_ref(),
        };
        pool.ok_or(BackendError::NotConfigured(family.as_str()))
    }

    async fn execute<C: Rpc>(
        &self,
        request: &RoutedRequest,
    ) -> Result<ChatCompletionsResponse, BackendError> {
        let connection = self.pool(request.family)?.acquire().await?;
        let response = C::predict(connection.channel(), C::encode(request))
            .await
            .map_err(|status| {
                connection.observe(&status);
                BackendError::Status(status)
            })?;
        drop(connection);
        C::decode_unary(response, request, self.tokens.as_ref())
    }

    async fn open_stream<C: Rpc>(&self, request: RoutedRequest) -> Result<DeltaStream, BackendError> {
        let connection = self.pool(request.family)?.acquire().await?;
        let upstream = C::predict_with_stream(connection.channel(), C::encode(&request))
            .await
            .map_err(|status| {
                connection.observe(&status);
                BackendError::Status(status)
            })?;
        Ok(relay_upstream::<C, _>(connection, upstream, &request, self.tokens.clone()))
    }
}

/// Decodes upstream messages into deltas. The pooled connection lives inside the
/// returned stream and is released when the stream finishes or is dropped.
fn relay_upstream<C, S>(
    connection: PooledConnection<GrpcConnector>,
    upstream: S,
    request: &RoutedRequest,
    tokens: Arc<dyn TokenCounter>,
) -> DeltaStream
where
    C: FamilyCodec + 'static,
    S: Stream<Item = Result<C::Response, Status>> + Send + 'static,
{
    let mut state = C::open_stream(request, tokens.as_ref());
    let stream = async_stream::stream! {
        let connection = connection;
        let mut upstream = Box::pin(upstream);
        loop {
            let event = match upstream.next().await {
                Some(Ok(message)) => StreamEvent::Message(message),
                None => StreamEvent::Eof,
                Some(Err(status)) => {
                    connection.observe(&status);
                    StreamEvent::Failed(status)
                }
            };
            match C::decode_stream_event(event, &mut state, tokens.as_ref()) {
                Ok(step) => {
                    for delta in step.deltas {
                        yield Ok(delta);
                    }
                    if step.done {
                        break;
                    }
                }
                Err(error) => {
                    yield Err(error);
                    break;
                }
            }
        }
    };
    stream.boxed()
}

async fn build_pool(
    name: &str,
    address: &str,
    config: &PoolConfig,
) -> Result<Option<ConnectionPool<GrpcConnector>>, BackendError> {
    if address.is_empty() {
        warn!(backend = name, "no address configured, backend disabled");
        return Ok(None);
    }
    let connector = GrpcConnector::new(address)?;
    info!(backend = name, address, "initializing backend pool");
    Ok(Some(ConnectionPool::new(name, connector, config).await))
}

#[async_trait]
impl InferenceBackend for GrpcBackend {
    fn name(&self) -> &str {
        "grpc"
    }

    async fn execute_chat(
        &self,
        request: &RoutedRequest,
    ) -> Result<ChatCompletionsResponse, BackendError> {
        match request.family {
            BackendFamily::Gpt => self.execute::<Gpt>(request).await,
            BackendFamily::Vertex => self.execute::<Vertex>(request).await,
        }
    }

    async fn stream_chat(&self, request: RoutedRequest) -> Result<DeltaStream, BackendError> {
        match request.family {
            BackendFamily::Gpt => self.open_stream::<Gpt>(request).await,
            BackendFamily::Vertex => self.open_stream::<Vertex>(request).await,
        }
    }

    fn pool_status(&self) -> Vec<PoolStatus> {
        [&self.gpt, &self.vertex]
            .into_iter()
            .flatten()
            .map(ConnectionPool::status)
            .collect()
    }

    async fn shutdown(&self) {
        for pool in [&self.gpt, &self.vertex].into_iter().flatten() {
            pool.shutdown().await;
        }
    }
}
