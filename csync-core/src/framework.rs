use sqlx::PgPool;

/// Executes query objects against the connection pool.
///
/// Each statement is a plain struct with a
/// [`Processor`](kanau::processor::Processor) implementation on this type.
#[derive(Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}

impl DatabaseProcessor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}
