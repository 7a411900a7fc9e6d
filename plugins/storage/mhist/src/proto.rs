//! Сообщения и клиент сервиса `proto.Mhist`.
//!
//! Поддерживаются вручную вместо tonic-build: relay использует только
//! Subscribe и StoreStream, а сборка не должна зависеть от protoc.

use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Filter {
    #[prost(string, repeated, tag = "1")]
    pub names: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MeasurementMessage {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub measurement: Option<Measurement>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Measurement {
    #[prost(oneof = "measurement::Type", tags = "1, 2, 3")]
    pub r#type: Option<measurement::Type>,
}

pub mod measurement {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "1")]
        Numerical(super::Numerical),
        #[prost(message, tag = "2")]
        Categorical(super::Categorical),
        #[prost(message, tag = "3")]
        Raw(super::Raw),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Numerical {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(double, tag = "2")]
    pub value: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Categorical {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Raw {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

// ═══════════════════════════════════════════════════════════════
//  Client
// ═══════════════════════════════════════════════════════════════

const SUBSCRIBE: &str = "/proto.Mhist/Subscribe";
const STORE_STREAM: &str = "/proto.Mhist/StoreStream";

#[derive(Debug, Clone)]
pub struct MhistClient {
    inner: tonic::client::Grpc<Channel>,
}

impl MhistClient {
    pub async fn connect(uri: String) -> Result<Self, tonic::transport::Error> {
        let channel = tonic::transport::Endpoint::from_shared(uri)?.connect().await?;
        Ok(Self::new(channel))
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    async fn ready(&mut self) -> Result<(), tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("service was not ready: {e}")))
    }

    /// Server-streaming: одна запись на каждое сохранение в подписанный канал.
    pub async fn subscribe(
        &mut self,
        request: impl tonic::IntoRequest<Filter>,
    ) -> Result<tonic::Response<tonic::codec::Streaming<MeasurementMessage>>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(SUBSCRIBE);
        self.inner
            .server_streaming(request.into_request(), path, codec)
            .await
    }

    /// Client-streaming: store сохраняет каждое полученное сообщение.
    pub async fn store_stream(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = MeasurementMessage>,
    ) -> Result<tonic::Response<Empty>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(STORE_STREAM);
        self.inner
            .client_streaming(request.into_streaming_request(), path, codec)
            .await
    }
}
