pub mod cursor;
pub mod model;
pub mod snowflake;
pub mod util;
