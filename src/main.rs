use snapsort_lib::{HostOptions, USAGE};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(options) = HostOptions::parse(std::env::args().skip(1))? else {
        println!("{}", USAGE);
        return Ok(());
    };

    snapsort_lib::run(options).await
}
