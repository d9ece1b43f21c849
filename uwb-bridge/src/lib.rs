extern crate self as uwb_bridge;

pub mod anchor_config;
pub mod api;
pub mod config;
pub mod http;
mod logging;

use std::sync::Arc;

pub use anchor_config::AnchorConfig;
pub use api::Bridge;
pub use config::{BridgeConfig, ConfigError, bridge_home};
pub use logging::init_logging;

pub type HttpResult<E = std::io::Error> = Result<HttpResponse, E>;

pub type HttpResponse =
    hyper::Response<http_body_util::combinators::BoxBody<hyper::body::Bytes, std::io::Error>>;

/// Open the Bluetooth adapter and start the link driver and reply router
pub async fn start(config: &BridgeConfig) -> Result<Bridge, uwb_link::TransportError> {
    let (transport, events) = uwb_link::BtleplugTransport::new().await?;
    let (driver, handle, upstream) = uwb_link::link(transport, events, config.link_config());
    tokio::spawn(driver.run());

    let correlator = Arc::new(uwb_link::Correlator::new(handle));
    let router = correlator.clone();
    tokio::spawn(async move { router.route(upstream).await });

    Ok(Bridge::new(correlator, config.reply_timing()))
}
