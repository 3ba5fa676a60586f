mod app;
mod cancel;
mod cli;
mod config;
mod filecasing;
mod games;
mod plan;
mod resolve;
mod steamcmd;
mod store;
mod sync;
mod workshop;

use anyhow::Result;

fn main() -> Result<()> {
    cli::run()
}
