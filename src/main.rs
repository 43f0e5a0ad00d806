use std::sync::Arc;

use relay_gateway::{config, logger, store::Store, AppState};

#[tokio::main]
async fn main() {
    logger::init();

    std::panic::set_hook(Box::new(|panic_info| {
        let message = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => s.to_string(),
            None => panic_info
                .payload()
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "Unknown panic payload".to_string()),
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        logger::error("panic", &format!("PANIC: {} at {}", message, location));
    }));

    let cfg = config::load();
    let store = match Store::connect(&cfg.redis_url).await {
        Ok(store) => store,
        Err(e) => {
            logger::error("main", &format!("Failed to connect to store: {}", e));
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(store));
    state.cost_rank.spawn_timers();
    logger::info("main", "Relay gateway started");

    relay_gateway::server::serve(state).await;
}
