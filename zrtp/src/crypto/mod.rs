mod aes;
mod hash;
mod key_exchange;
mod srtp;

pub use self::aes::*;
pub use hash::*;
pub use key_exchange::*;
pub use srtp::*;
