pub mod connection;
pub mod framing;
pub mod inbox;
pub mod protocol;
pub mod session;
pub mod transport;
