pub mod client;
pub mod commands;
pub mod fun_with_tls;
pub mod home_assistant;
pub mod models;
