#![cfg_attr(not(test), forbid(unsafe_code))]

//! Entry point for the ChatRelay CLI binary.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run(cli::initialize_cli()).await
}
