pub mod email;

pub use email::DigestMailer;
