use outdial_dialer::config::Config;
use outdial_dialer::server::{DialerService, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    outdial_log::init();
    let config = Config::load()?;
    let service = DialerService::new(config)?;
    Server::run(Server::new(service)).await
}
