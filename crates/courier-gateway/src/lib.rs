pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod presence;
pub mod rooms;

pub use dispatcher::Dispatcher;
pub use error::GatewayError;
