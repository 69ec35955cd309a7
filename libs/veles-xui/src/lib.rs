pub mod client;
pub mod error;
pub mod session;
pub mod transport;

pub use client::{Provision, ProvisionRequest, ProvisionedCredential, XuiClient};
pub use error::PanelError;
pub use session::{PanelAuth, PanelSession};
pub use transport::{FallbackDefaults, RealityParams};
