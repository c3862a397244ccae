pub mod cli;
pub mod commands;
pub mod config;
pub mod inputs;
pub mod sitemap;
pub mod sync;
