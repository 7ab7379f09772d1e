pub mod core;
pub mod entry;
pub mod grading;
pub mod marking;
pub mod reports;
pub mod scores;
pub mod setup;
