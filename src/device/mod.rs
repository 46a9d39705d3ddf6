pub mod partition;
pub mod resolver;
