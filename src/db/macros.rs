/// Builds a parameter slice for a query.
///
/// Each argument is converted with `Value::from`, so plain Rust values can be
/// passed directly.
///
/// # Example
/// ```rust,no_run
/// # async fn run(gateway: pg_gateway::QueryGateway) -> pg_gateway::GatewayResult<()> {
/// use pg_gateway::params;
///
/// let result = gateway
///     .execute("INSERT INTO t(x, label) VALUES ($1, $2)", params![42, "answer"])
///     .await?;
/// assert_eq!(result.rows_affected, 1);
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! params {
    () => {
        &[] as &[$crate::Value]
    };
    ($($value:expr),+ $(,)?) => {
        &[$($crate::Value::from($value)),+] as &[$crate::Value]
    };
}
