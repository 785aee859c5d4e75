//! Outbound command channel to devices
//!
//! Commands travel on a separate connection from the device's session: the
//! base station dials the device's declared command port for every delivery.

mod tcp;
mod traits;

pub use tcp::TcpCommandLink;
pub use traits::CommandLink;
