pub mod enforce;
pub mod selector;
