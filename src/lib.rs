pub mod config;
pub mod logging;
pub mod rpc;

pub use config::AppConfig;
pub use rpc::{CallOptions, CallResponse, RpcClient, RpcServer, Status};
