pub mod config;
pub mod sessions;
pub mod voice;

pub use self::config::*;
pub use self::sessions::*;
pub use self::voice::*;
