pub mod detector;
pub mod document;
pub mod monitor;
pub mod page;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod timeout;
