pub mod jobs;
pub mod queues;
pub mod system;
