pub mod discovery;
pub mod message;
pub mod traits;
