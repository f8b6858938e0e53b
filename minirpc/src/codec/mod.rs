//! Envelope encodings. [`json`] is what [`RpcServer`](crate::RpcServer) and
//! [`RpcClient`](crate::RpcClient) speak; [`binary`] is the fixed-layout
//! alternative for single numeric methods.

pub mod binary;
pub mod json;

pub use json::{Reply, Request};
