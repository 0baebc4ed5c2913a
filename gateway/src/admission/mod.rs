pub mod registry;
pub mod worker;
