pub mod order_records;
pub mod user_records;

/// Current time as stored in `TIMESTAMP` columns.
pub(crate) fn now_primitive() -> time::PrimitiveDateTime {
    let now = time::OffsetDateTime::now_utc();
    time::PrimitiveDateTime::new(now.date(), now.time())
}
