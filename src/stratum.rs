use super::*;

mod client;
mod error;
mod message;

pub use {
    client::Client,
    error::{ClientError, RpcError},
    message::{Message, Notification},
};
