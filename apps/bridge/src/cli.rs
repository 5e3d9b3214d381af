use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use filament_proto::setup::{RouterInfo, SetupParams};
use filament_proto::{CommandEnvelope, Decoded};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::Duration;

use crate::config::Config;
use crate::provisioning::Handshake;
use crate::registry::Registry;
use crate::udp::Sender;

#[derive(Parser, Debug)]
#[command(name = "filament-bridge")]
#[command(about = "Stand-in cloud for WiFi smart bulbs: registration, broker discovery, UDP control")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a factory-mode bulb to WiFi and point it at this bridge
    Provision {
        /// Bulb address while it is in setup AP mode
        #[arg(long, default_value = "192.168.8.1")]
        target: IpAddr,

        /// SSID of the network the bulb should join
        #[arg(long)]
        ssid: String,

        /// WiFi password
        #[arg(long)]
        password: String,

        /// User id baked into the setup payload
        #[arg(long)]
        user_id: Option<String>,

        /// IANA time zone handed to the bulb
        #[arg(long, default_value = "America/Chicago")]
        time_zone: String,
    },

    /// Send one command to a bulb and print the reply
    Send {
        /// Bulb address on the production network
        #[arg(long)]
        target: IpAddr,

        /// Function name, e.g. set_device_switch
        #[arg(long)]
        func: String,

        /// key=value parameters; values are parsed as JSON when possible
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
}

pub async fn run_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Provision {
            target,
            ssid,
            password,
            user_id,
            time_zone,
        } => run_provision(config, target, ssid, password, user_id, time_zone).await,
        Commands::Send {
            target,
            func,
            params,
        } => run_send(config, target, func, params).await,
    }
}

async fn run_provision(
    config: &Config,
    target: IpAddr,
    ssid: String,
    password: String,
    user_id: Option<String>,
    time_zone: String,
) -> Result<()> {
    let params = SetupParams {
        user_id: user_id.unwrap_or_else(|| config.default_user_id.clone()),
        app_server_domain: config.access_cloud_url(),
        jbalancer_domain: config.jbalancer_url(),
        time_zone,
        router_info: RouterInfo { ssid, password },
    };

    let registry = Arc::new(Registry::new(Duration::from_secs(config.stale_after_secs)));
    let sender = Sender::new(
        registry,
        config.udp_port,
        Duration::from_secs(config.udp_timeout_secs),
    );
    let target_addr = SocketAddr::new(target, config.udp_port);

    println!("Provisioning bulb at {target_addr}...");
    let report = Handshake::new(
        &sender,
        target_addr,
        Duration::from_secs(config.provisioning_timeout_secs),
    )
    .run(&params, config.setup_key.as_bytes())
    .await
    .context("handshake aborted; restart the bulb's setup mode to retry")?;

    for outcome in &report.steps {
        println!("  ✅ {}", outcome.step);
        if let Some(detail) = &outcome.detail {
            println!("     {detail}");
        }
    }
    println!("Setup complete for {}.", report.mac);
    println!(
        "The bulb should reboot and register at {}",
        config.access_cloud_url()
    );
    Ok(())
}

async fn run_send(config: &Config, target: IpAddr, func: String, params: Vec<String>) -> Result<()> {
    let mut command = CommandEnvelope::new(func);
    for pair in params {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("parameter {pair:?} is not of the form KEY=VALUE"))?;
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        command = command.with_param(key, value);
    }

    let registry = Arc::new(Registry::new(Duration::from_secs(config.stale_after_secs)));
    let sender = Sender::new(
        registry,
        config.udp_port,
        Duration::from_secs(config.udp_timeout_secs),
    );

    let reply = sender
        .send(SocketAddr::new(target, config.udp_port), &command)
        .await?;
    match reply {
        Decoded::Json(value) => println!("{value:#}"),
        Decoded::Raw(text) => println!("{text}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
