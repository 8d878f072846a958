//! Wire messages and unary/streaming clients for the two inference services.
//!
//! Both services expose `Predict` and `PredictWithStream` over HTTP/2 with protobuf
//! bodies. The clients below are the subset of what `tonic-build` would emit for a
//! `Channel` transport.

use tonic::{
    codec::{ProstCodec, Streaming},
    codegen::http::uri::PathAndQuery,
    transport::Channel,
};

fn not_ready(error: tonic::transport::Error) -> tonic::Status {
    tonic::Status::unavailable(format!("service was not ready: {error}"))
}

pub mod gpt {
    use super::*;

    pub const PREDICT: &str =
        "/runtime.aot.machine_learning.parents.gpt.GPTInferenceService/Predict";
    pub const PREDICT_WITH_STREAM: &str =
        "/runtime.aot.machine_learning.parents.gpt.GPTInferenceService/PredictWithStream";

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Request {
        #[prost(string, tag = "1")]
        pub models: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "2")]
        pub messages: ::prost::alloc::vec::Vec<Message>,
        #[prost(double, tag = "3")]
        pub temperature: f64,
        #[prost(double, tag = "4")]
        pub top_p: f64,
    }

    /// Role 0 carries the system block, role 1 the dialog block.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Message {
        #[prost(int64, tag = "1")]
        pub role: i64,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Response {
        #[prost(int64, tag = "2")]
        pub response_code: i64,
        #[prost(message, optional, tag = "4")]
        pub body: ::core::option::Option<ResponseBody>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ResponseBody {
        #[prost(string, tag = "1")]
        pub id: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub object: ::prost::alloc::string::String,
        #[prost(int64, tag = "3")]
        pub time: i64,
        #[prost(message, optional, tag = "4")]
        pub message_wrapper: ::core::option::Option<MessageWrapper>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MessageWrapper {
        #[prost(int64, tag = "1")]
        pub arg1: i64,
        #[prost(message, optional, tag = "2")]
        pub message: ::core::option::Option<Message>,
    }

    impl Response {
        /// Text at `body.message_wrapper.message.message`, if the whole path is present.
        pub fn text(&self) -> Option<&str> {
            self.body
                .as_ref()?
                .message_wrapper
                .as_ref()?
                .message
                .as_ref()
                .map(|message| message.message.as_str())
        }
    }

    #[derive(Debug, Clone)]
    pub struct GptInferenceClient {
        inner: tonic::client::Grpc<Channel>,
    }

    impl GptInferenceClient {
        pub fn new(channel: Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(channel),
            }
        }

        pub async fn predict(
            &mut self,
            request: impl tonic::IntoRequest<Request>,
        ) -> Result<tonic::Response<Response>, tonic::Status> {
            self.inner.ready().await.map_err(not_ready)?;
            self.inner
                .unary(
                    request.into_request(),
                    PathAndQuery::from_static(PREDICT),
                    ProstCodec::default(),
                )
                .await
        }

        pub async fn predict_with_stream(
            &mut self,
            request: impl tonic::IntoRequest<Request>,
        ) -> Result<tonic::Response<Streaming<Response>>, tonic::Status> {
            self.inner.ready().await.map_err(not_ready)?;
            self.inner
                .server_streaming(
                    request.into_request(),
                    PathAndQuery::from_static(PREDICT_WITH_STREAM),
                    ProstCodec::default(),
                )
                .await
        }
    }
}

pub mod vertex {
    use super::*;

    pub const PREDICT: &str =
        "/runtime.aot.machine_learning.parents.vertex.VertexInferenceService/Predict";
    pub const PREDICT_WITH_STREAM: &str =
        "/runtime.aot.machine_learning.parents.vertex.VertexInferenceService/PredictWithStream";

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Requests {
        #[prost(string, tag = "1")]
        pub models: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub args: ::core::option::Option<Args>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Args {
        #[prost(message, optional, tag = "1")]
        pub messages: ::core::option::Option<Messages>,
        #[prost(string, tag = "2")]
        pub rules: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Messages {
        #[prost(int64, tag = "1")]
        pub unknown: i64,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Response {
        #[prost(int64, tag = "2")]
        pub response_code: i64,
        #[prost(message, optional, tag = "4")]
        pub args: ::core::option::Option<ResponseArgs>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ResponseArgs {
        #[prost(message, optional, tag = "1")]
        pub args: ::core::option::Option<NestedArgs>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NestedArgs {
        #[prost(message, optional, tag = "1")]
        pub args: ::core::option::Option<ResponseMessage>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ResponseMessage {
        #[prost(string, tag = "1")]
        pub message: ::prost::alloc::string::String,
    }

    impl Response {
        /// Text at `args.args.args.message`, if the whole path is present.
        pub fn text(&self) -> Option<&str> {
            self.args
                .as_ref()?
                .args
                .as_ref()?
                .args
                .as_ref()
                .map(|message| message.message.as_str())
        }
    }

    #[derive(Debug, Clone)]
    pub struct VertexInferenceClient {
        inner: tonic::client::Grpc<Channel>,
    }

    impl VertexInferenceClient {
        pub fn new(channel: Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(channel),
            }
        }

        pub async fn predict(
            &mut self,
            request: impl tonic::IntoRequest<Requests>,
        ) -> Result<tonic::Response<Response>, tonic::Status> {
            self.inner.ready().await.map_err(not_ready)?;
            self.inner
                .unary(
                    request.into_request(),
                    PathAndQuery::from_static(PREDICT),
                    ProstCodec::default(),
                )
                .await
        }

        pub async fn predict_with_stream(
            &mut self,
            request: impl tonic::IntoRequest<Requests>,
        ) -> Result<tonic::Response<Streaming<Response>>, tonic::Status> {
            self.inner.ready().await.map_err(not_ready)?;
            self.inner
                .server_streaming(
                    request.into_request(),
                    PathAndQuery::from_static(PREDICT_WITH_STREAM),
                    ProstCodec::default(),
                )
                .await
        }
    }
}
