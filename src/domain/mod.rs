pub mod command;
pub mod models;
pub mod settings;
pub mod status;
