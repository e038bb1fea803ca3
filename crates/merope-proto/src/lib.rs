//! Generated protobuf messages and gRPC stubs for the `server` package.

pub mod server {
    tonic::include_proto!("server");
}

/// Encoded file descriptor set, registered with the reflection service.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptor");
