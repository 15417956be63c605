use std::sync::Arc;

use tracing::instrument;

use crate::{
    config::GatewayConfig,
    db::{
        Connector, PgConnector, Pool, PoolStats, PoolStatus, PooledConnection, QueryResult, Value,
    },
    error::GatewayResult,
};

/// Single access point for parameterized SQL
///
/// Owns the connection pool. Cloning is cheap and every clone shares the same
/// pool, so construct one gateway at startup and pass it to whoever needs it.
#[derive(Clone)]
pub struct QueryGateway {
    pool: Pool,
}

impl QueryGateway {
    /// Creates a gateway over any connector
    ///
    /// The configuration is validated up front; no connection is opened until
    /// the first query.
    pub fn new(config: GatewayConfig, connector: Arc<dyn Connector>) -> GatewayResult<Self> {
        config.validate()?;
        tracing::debug!(
            driver = connector.name(),
            max_connections = config.max_connections,
            "Creating query gateway"
        );

        Ok(Self {
            pool: Pool::new(&config, connector),
        })
    }

    /// Creates a PostgreSQL gateway without connecting
    pub fn connect_lazy(config: &GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;
        let connector = PgConnector::new(config)?;
        Self::new(config.clone(), Arc::new(connector))
    }

    /// Runs one parameterized statement on a pooled connection
    ///
    /// `params` are bound to `$1`, `$2`, ... by the driver. The connection is
    /// returned to the pool afterwards, unless the failure was at the
    /// transport level, in which case it is discarded. Nothing is retried.
    #[instrument(skip(self, text, params), fields(param_count = params.len()))]
    pub async fn execute(&self, text: &str, params: &[Value]) -> GatewayResult<QueryResult> {
        let mut conn = self.pool.acquire().await?;

        match conn.execute(text, params).await {
            Ok(result) => {
                conn.release().await;
                tracing::debug!(
                    rows = result.row_count(),
                    rows_affected = result.rows_affected,
                    "Query completed"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    kind = ?e.kind(),
                    query = text,
                    param_count = params.len(),
                    "Database query error"
                );
                conn.release().await;
                Err(e)
            }
        }
    }

    /// Borrows a connection for multi-statement work such as transactions
    ///
    /// Hand it back with [`QueryGateway::release`]. A handle dropped without
    /// being released is closed rather than reused.
    pub async fn acquire_raw_connection(&self) -> GatewayResult<PooledConnection> {
        self.pool.acquire().await
    }

    /// Returns a connection obtained from [`QueryGateway::acquire_raw_connection`]
    pub async fn release(&self, conn: PooledConnection) {
        conn.release().await;
    }

    /// Checks that a connection can be opened and answers a ping
    pub async fn test_connection(&self) -> bool {
        let result: GatewayResult<()> = async {
            let mut conn = self.pool.acquire().await?;
            let ping = conn.ping().await;
            conn.release().await;
            ping
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!("Database connection successful");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Database connection failed");
                false
            }
        }
    }

    /// Closes idle connections and rejects further requests
    ///
    /// Connections still borrowed are closed when they are released. Safe to
    /// call more than once.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Waits until every connection has been closed after [`QueryGateway::shutdown`]
    pub async fn closed(&self) {
        self.pool.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.status() != PoolStatus::Open
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl std::fmt::Debug for QueryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryGateway")
            .field("stats", &self.pool.stats())
            .finish()
    }
}
