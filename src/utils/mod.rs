pub mod sanitize;
pub mod shutdown;
