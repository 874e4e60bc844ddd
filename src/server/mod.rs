pub mod relay;

use anyhow::Result;

use crate::config::CollabConfig;

pub use relay::{router, serve_on, RelayState};

pub async fn start(port: u16, config: CollabConfig) -> Result<()> {
    relay::serve(port, &config).await
}
