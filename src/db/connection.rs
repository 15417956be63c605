use crate::{
    db::{QueryResult, Value},
    error::GatewayResult,
};

/// A live, authenticated channel to the database
///
/// Implementations classify their failures: `GatewayError::Transport` means
/// the channel is no longer trustworthy and the pool will throw it away, any
/// other error leaves it reusable.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Connection: Send {
    /// Run one statement with `params` bound to its positional placeholders
    ///
    /// Returns only after every row has been received.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> GatewayResult<QueryResult>;

    /// Round-trip to the server to check the channel is alive
    async fn ping(&mut self) -> GatewayResult<()>;

    /// Close the channel gracefully
    async fn close(&mut self) -> GatewayResult<()>;
}

/// Opens new connections for the pool
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> GatewayResult<Box<dyn Connection>>;

    /// Driver name for logging
    fn name(&self) -> &'static str;
}
