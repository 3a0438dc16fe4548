use ai_chatbot_lib::config::Config;
use ai_chatbot_lib::logging::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::load();
    ai_chatbot_lib::run(config).await
}
