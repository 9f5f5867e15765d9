pub mod error;
pub mod row;

pub use error::{Result, ShardError};
pub use row::{Params, Row, as_number, compare_values};
