pub mod client;
pub mod endpoint;
pub mod message;
pub mod partition;
pub mod render;
pub mod stream;
pub mod tools;
