pub mod circuits;
pub mod compute;
pub mod keys;
pub mod protocols;
pub mod runtime;
pub mod sharing;
