pub mod battery;
pub mod manager;
pub mod scan;
pub mod tracker;

pub use manager::Resolver;
