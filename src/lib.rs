pub mod audio;
pub mod cli;
pub mod commands;
pub mod engine;
pub mod lesson;
pub mod persistence;
pub mod session;
pub mod state;

mod app;

pub use app::run;
