pub mod commands;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use server::{Backend, SmtpServer};
pub use session::SmtpSession;
