pub mod attrs;
pub mod error;
pub mod iter;
