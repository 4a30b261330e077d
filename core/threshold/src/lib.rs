pub use tokio;

pub mod algebra;
pub mod conf;
pub mod error;
pub mod execution;
pub mod hashing;
pub mod networking;
pub mod node;
pub mod scheme;
pub mod session_id;

#[cfg(any(test, feature = "testing"))]
pub mod tests;
