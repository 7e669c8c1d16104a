pub mod commands;
pub mod config;
pub mod data;
pub mod handlers;
pub mod logging;
pub mod moderation;

pub const BOT_NAME: &str = "case_engine";
pub const COMMAND_TARGET: &str = "case_engine::command";
pub const ERROR_TARGET: &str = "case_engine::error";
pub const EVENT_TARGET: &str = "case_engine::handlers";
pub const CONSOLE_TARGET: &str = "case_engine";
/// Finalized cases, written to their own log file
pub const CASE_TARGET: &str = "case_engine::cases";

pub use data::{Data, DataInner};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
