pub mod structure_traits;
pub mod zq;
pub mod poly;
