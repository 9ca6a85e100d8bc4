// Row types mirror the migration schema; status enums map to the Postgres
// enum types and serialize SCREAMING_SNAKE_CASE on the wire.

pub mod application;
pub mod job;
pub mod profile;
pub mod recipe;
pub mod worker;
