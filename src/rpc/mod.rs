//! The `rpc` module layers request/response calls on top of the broker's
//! publish/subscribe contract. It has no access to broker internals.

pub mod client;

pub use client::{REQUEST_ID, RESPONSE_SUFFIX, RpcClient, resolve, respond};
