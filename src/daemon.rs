//! Daemon runtime: owns the tokio runtime, mounts the configured layers,
//! and tears everything down on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use stargz_fs::fs::LayerFs;
use stargz_fs::remote::ReqwestClient;

use crate::app_config::Config;

/// Per-request timeout for registry traffic.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the daemon until interrupted. Mount failures for individual layers
/// are reported and skipped; the daemon keeps serving the rest.
pub fn run(config: Config) -> Result<(), std::io::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = Arc::new(ReqwestClient::new(HTTP_TIMEOUT));
        let layer_fs = LayerFs::new(&config.root, &config.filesystem, client)
            .await
            .map_err(std::io::Error::other)?;

        let mut mounted = 0_usize;
        for layer in &config.layers {
            if let Err(e) = std::fs::create_dir_all(&layer.mountpoint) {
                error!(mountpoint = %layer.mountpoint.display(), error = %e, "cannot create mountpoint");
                continue;
            }
            match layer_fs.mount(&layer.mountpoint, &layer.labels()).await {
                Ok(()) => mounted += 1,
                Err(e) => {
                    error!(
                        mountpoint = %layer.mountpoint.display(),
                        reference = %layer.reference,
                        error = %e,
                        "failed to mount layer"
                    );
                }
            }
        }
        info!(mounted, total = config.layers.len(), "daemon ready");

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        layer_fs.unmount_all();
        Ok(())
    })
}
