//! MIME decoding of received messages.

pub mod parser;
pub mod types;

pub use parser::MimeParser;
pub use types::{AttachmentPart, ExtractedMail, MimePart};
