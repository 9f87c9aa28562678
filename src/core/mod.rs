pub mod assembler;
pub mod context;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod planner;
pub mod quality;
pub mod terminal;
pub mod tools;
pub mod types;
