pub mod chat;
pub mod constants;
pub mod dashboard;
pub mod gemini;
pub mod session;
pub mod tools;
pub mod web_server;
