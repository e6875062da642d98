use std::sync::Arc;
use tokio::sync::RwLock;

/// Maximum number of numbered databases, matching the reference server's
/// default.
pub const NUM_DATABASES: usize = 16;

/// Runtime-adjustable server settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub databases: usize,
    /// Clients must AUTH with this password before issuing commands.
    /// None disables authentication.
    pub requirepass: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            databases: NUM_DATABASES,
            requirepass: None,
        }
    }
}

pub type SharedConfig = Arc<RwLock<Config>>;
