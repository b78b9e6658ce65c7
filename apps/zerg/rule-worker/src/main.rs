//! Rule Worker Service (NATS JetStream)
//!
//! Binary entry point for the rule checking function.

#[tokio::main]
async fn main() {
    core_config::tracing::install_color_eyre();

    if let Err(e) = zerg_rule_worker::run().await {
        eprintln!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}
