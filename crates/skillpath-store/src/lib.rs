pub mod database;
pub mod error;
pub mod row_helpers;
pub mod runs;
pub mod schema;
pub mod stages;

pub use database::Database;
pub use error::StoreError;
