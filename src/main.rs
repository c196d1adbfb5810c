use lingo_relay::config::AppConfig;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    lingo_relay::init_tracing();

    let config = AppConfig::load()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    lingo_relay::run(config).await
}
