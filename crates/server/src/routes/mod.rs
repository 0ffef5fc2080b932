pub mod auth;
pub mod chat;
pub mod projects;
pub mod tasks;
