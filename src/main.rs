use anyhow::Result;
use clap::Parser;
use deskphone::config::{Cli, Command, Config};
use deskphone::negotiation::strip_trickle;
use deskphone::useragent::RegisterOption;
use std::fs::File;
use tracing::{info, level_filters::LevelFilter};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.conf {
        Some(ref conf) => Config::load(conf)?,
        None => Config::default(),
    };

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let _guard = if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file)
            .map_err(|e| anyhow::anyhow!("failed to create log file {}: {}", log_file, e))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
        Some(guard)
    } else {
        log_fmt.try_init().ok();
        None
    };

    match cli.command.unwrap_or(Command::Check) {
        Command::Check => {
            config.validate()?;
            let option = RegisterOption::from(&config.sip);
            info!(server = option.server, "configuration ok");
            println!("signaling: {}", option.server);
            println!("account:   {}", option.aor());
            for server in config.policy().ice_servers() {
                println!("ice:       {}", server.urls.join(", "));
            }
        }
        Command::Target { number } => {
            let target = config.sip.dial_target(&number)?;
            println!("{}", target.uri());
        }
        Command::Sdp { file } => {
            let sdp = std::fs::read_to_string(&file)
                .map_err(|e| anyhow::anyhow!("{}: {}", e, file))?;
            print!("{}", strip_trickle(&sdp));
        }
    }
    Ok(())
}
