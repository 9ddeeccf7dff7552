// SPDX-License-Identifier: Apache-2.0

//! Message types for the subset of the OpenCensus agent protocol accepted by ocagent.
//!
//! Field numbers follow the published `opencensus-proto` definitions so that stock
//! OpenCensus exporters can talk to the agent. Fields outside the subset are skipped
//! on decode. The gRPC client and server stubs are generated by `build.rs`.

pub mod agent {
    pub mod common {
        pub mod v1 {
            /// Identifier metadata of the process or service emitting telemetry.
            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct Node {
                #[prost(message, optional, tag = "1")]
                pub identifier: ::core::option::Option<ProcessIdentifier>,
                #[prost(message, optional, tag = "2")]
                pub library_info: ::core::option::Option<LibraryInfo>,
                #[prost(message, optional, tag = "3")]
                pub service_info: ::core::option::Option<ServiceInfo>,
                #[prost(map = "string, string", tag = "4")]
                pub attributes: ::std::collections::HashMap<
                    ::prost::alloc::string::String,
                    ::prost::alloc::string::String,
                >,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct ProcessIdentifier {
                #[prost(string, tag = "1")]
                pub host_name: ::prost::alloc::string::String,
                #[prost(uint32, tag = "2")]
                pub pid: u32,
                #[prost(message, optional, tag = "3")]
                pub start_timestamp: ::core::option::Option<::prost_types::Timestamp>,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct LibraryInfo {
                #[prost(enumeration = "library_info::Language", tag = "1")]
                pub language: i32,
                #[prost(string, tag = "2")]
                pub exporter_version: ::prost::alloc::string::String,
                #[prost(string, tag = "3")]
                pub core_library_version: ::prost::alloc::string::String,
            }

            pub mod library_info {
                #[derive(
                    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
                )]
                #[repr(i32)]
                pub enum Language {
                    Unspecified = 0,
                    Cpp = 1,
                    CSharp = 2,
                    Erlang = 3,
                    GoLang = 4,
                    Java = 5,
                    NodeJs = 6,
                    Php = 7,
                    Python = 8,
                    Ruby = 9,
                    WebJs = 10,
                }
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct ServiceInfo {
                #[prost(string, tag = "1")]
                pub name: ::prost::alloc::string::String,
            }
        }
    }

    pub mod trace {
        pub mod v1 {
            use crate::agent::common::v1::Node;
            use crate::resource::v1::Resource;
            use crate::trace::v1::Span;

            /// One message of the bidirectional `TraceService.Export` stream. The first
            /// message of a stream must carry `node`; later messages without one inherit it.
            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct ExportTraceServiceRequest {
                #[prost(message, optional, tag = "1")]
                pub node: ::core::option::Option<Node>,
                #[prost(message, repeated, tag = "2")]
                pub spans: ::prost::alloc::vec::Vec<Span>,
                #[prost(message, optional, tag = "3")]
                pub resource: ::core::option::Option<Resource>,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct ExportTraceServiceResponse {}

            include!(concat!(
                env!("OUT_DIR"),
                "/opencensus.proto.agent.trace.v1.TraceService.rs"
            ));
        }
    }

    pub mod interaction {
        pub mod v1 {
            use crate::agent::common::v1::Node;
            use crate::resource::v1::Resource;
            use crate::trace::v1::{Attributes, TruncatableString};

            /// A user interaction (click, navigation, form submit) observed by a client
            /// library, optionally correlated with the trace it started.
            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct Interaction {
                #[prost(bytes = "vec", tag = "1")]
                pub trace_id: ::prost::alloc::vec::Vec<u8>,
                #[prost(bytes = "vec", tag = "2")]
                pub span_id: ::prost::alloc::vec::Vec<u8>,
                #[prost(message, optional, tag = "3")]
                pub name: ::core::option::Option<TruncatableString>,
                #[prost(message, optional, tag = "4")]
                pub time: ::core::option::Option<::prost_types::Timestamp>,
                #[prost(message, optional, tag = "5")]
                pub attributes: ::core::option::Option<Attributes>,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct ExportInteractionServiceRequest {
                #[prost(message, optional, tag = "1")]
                pub node: ::core::option::Option<Node>,
                #[prost(message, repeated, tag = "2")]
                pub interactions: ::prost::alloc::vec::Vec<Interaction>,
                #[prost(message, optional, tag = "3")]
                pub resource: ::core::option::Option<Resource>,
            }

            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct ExportInteractionServiceResponse {}

            include!(concat!(
                env!("OUT_DIR"),
                "/opencensus.proto.agent.interaction.v1.InteractionService.rs"
            ));
        }
    }
}

pub mod resource {
    pub mod v1 {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Resource {
            #[prost(string, tag = "1")]
            pub r#type: ::prost::alloc::string::String,
            #[prost(map = "string, string", tag = "2")]
            pub labels: ::std::collections::HashMap<
                ::prost::alloc::string::String,
                ::prost::alloc::string::String,
            >,
        }
    }
}

pub mod trace {
    pub mod v1 {
        use crate::resource::v1::Resource;

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Span {
            #[prost(bytes = "vec", tag = "1")]
            pub trace_id: ::prost::alloc::vec::Vec<u8>,
            #[prost(bytes = "vec", tag = "2")]
            pub span_id: ::prost::alloc::vec::Vec<u8>,
            #[prost(bytes = "vec", tag = "3")]
            pub parent_span_id: ::prost::alloc::vec::Vec<u8>,
            #[prost(message, optional, tag = "4")]
            pub name: ::core::option::Option<TruncatableString>,
            #[prost(message, optional, tag = "5")]
            pub start_time: ::core::option::Option<::prost_types::Timestamp>,
            #[prost(message, optional, tag = "6")]
            pub end_time: ::core::option::Option<::prost_types::Timestamp>,
            #[prost(message, optional, tag = "7")]
            pub attributes: ::core::option::Option<Attributes>,
            #[prost(message, optional, tag = "11")]
            pub status: ::core::option::Option<Status>,
            #[prost(enumeration = "span::SpanKind", tag = "14")]
            pub kind: i32,
            #[prost(message, optional, tag = "16")]
            pub resource: ::core::option::Option<Resource>,
        }

        pub mod span {
            #[derive(
                Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
            )]
            #[repr(i32)]
            pub enum SpanKind {
                Unspecified = 0,
                Server = 1,
                Client = 2,
            }
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Attributes {
            #[prost(map = "string, message", tag = "1")]
            pub attribute_map:
                ::std::collections::HashMap<::prost::alloc::string::String, AttributeValue>,
            #[prost(int32, tag = "2")]
            pub dropped_attributes_count: i32,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct AttributeValue {
            #[prost(oneof = "attribute_value::Value", tags = "1, 2, 3, 4")]
            pub value: ::core::option::Option<attribute_value::Value>,
        }

        pub mod attribute_value {
            #[derive(Clone, PartialEq, ::prost::Oneof)]
            pub enum Value {
                #[prost(message, tag = "1")]
                StringValue(super::TruncatableString),
                #[prost(int64, tag = "2")]
                IntValue(i64),
                #[prost(bool, tag = "3")]
                BoolValue(bool),
                #[prost(double, tag = "4")]
                DoubleValue(f64),
            }
        }

        /// Canonical gRPC status code plus an optional developer message.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Status {
            #[prost(int32, tag = "1")]
            pub code: i32,
            #[prost(string, tag = "2")]
            pub message: ::prost::alloc::string::String,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct TruncatableString {
            #[prost(string, tag = "1")]
            pub value: ::prost::alloc::string::String,
            #[prost(int32, tag = "2")]
            pub truncated_byte_count: i32,
        }

        impl From<&str> for TruncatableString {
            fn from(value: &str) -> Self {
                Self {
                    value: value.to_string(),
                    truncated_byte_count: 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::agent::trace::v1::ExportTraceServiceRequest;
    use crate::trace::v1::attribute_value::Value;
    use crate::trace::v1::{AttributeValue, Attributes, Span, TruncatableString};
    use prost::Message;

    #[test]
    fn unknown_span_fields_are_skipped() {
        // tracestate (15) is not part of the accepted subset
        let mut buf = Vec::new();
        Span {
            trace_id: vec![1; 16],
            span_id: vec![2; 8],
            name: Some(TruncatableString::from("op")),
            ..Default::default()
        }
        .encode(&mut buf)
        .unwrap();
        buf.extend_from_slice(&[0x7a, 0x02, 0x08, 0x01]);

        let span = Span::decode(buf.as_slice()).unwrap();
        assert_eq!(vec![1; 16], span.trace_id);
        assert_eq!("op", span.name.unwrap().value);
    }

    #[test]
    fn attribute_map_decodes() {
        let mut attrs = Attributes::default();
        attrs.attribute_map.insert(
            "http.status_code".to_string(),
            AttributeValue {
                value: Some(Value::IntValue(200)),
            },
        );
        let req = ExportTraceServiceRequest {
            spans: vec![Span {
                attributes: Some(attrs),
                ..Default::default()
            }],
            ..Default::default()
        };

        let decoded = ExportTraceServiceRequest::decode(req.encode_to_vec().as_slice()).unwrap();
        let value = &decoded.spans[0].attributes.as_ref().unwrap().attribute_map["http.status_code"];
        assert_eq!(Some(Value::IntValue(200)), value.value);
    }
}
