pub mod prompts;
pub mod task_runner;
