use gantry::config::GatewayConfig;

#[tokio::main]
async fn main() {
    let config = GatewayConfig::from_args();
    gantry::run(config).await;
}
