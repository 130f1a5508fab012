pub mod builder;
pub mod defaults;
pub mod runtime;
pub mod schedule;
pub mod traits;
