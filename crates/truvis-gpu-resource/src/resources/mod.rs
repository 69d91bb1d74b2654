pub mod deferred_queue;
pub mod format;
pub mod pool;
pub mod resource_data;
