pub mod connection;
pub mod pool;
pub mod postgres;
pub mod result;
pub mod value;

mod macros;

pub use connection::{Connection, Connector};
pub use pool::{Pool, PoolStats, PoolStatus, PooledConnection};
pub use postgres::PgConnector;
pub use result::{QueryResult, Row};
pub use value::Value;
