pub mod auth;
pub mod cert;
pub mod exchange;
pub mod graph;

pub use auth::{AuthCommands, auth_command};
pub use cert::{CertCommands, cert_command};
pub use exchange::{ExchangeCommands, exchange_command};
pub use graph::{GraphCommands, graph_command};
