pub mod email;

pub use email::{parse_address, sender_domain, split_address, validate_email};
