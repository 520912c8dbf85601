use clap::Parser;
mod args;
mod icmp;
mod packet;
use anyhow::Result;
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = args::Opts::parse();

    let mut client = icmp::IcmpClient::new(&args)?;
    client.run().await?;
    Ok(())
}
