pub mod server;
pub mod tools;

pub use server::run_stdio_server;
