pub mod config;
pub mod fetch;
pub mod frame;
pub mod history;
pub mod load;
pub mod pipeline;
pub mod stage;
pub mod validate;
