//! Administrative control plane.

mod handlers;
mod server;

pub use handlers::{route, AdminContext, MAX_BODY_BYTES};
pub use server::AdminServer;
