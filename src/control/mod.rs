mod server;
mod session;

pub use server::ControlServer;
pub use session::SessionOutcome;
