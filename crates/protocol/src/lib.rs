pub mod config;
pub mod messages;
pub mod tenant;

pub use config::*;
pub use messages::*;
pub use tenant::*;
