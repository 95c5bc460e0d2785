use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{anyhow, bail, Context};
use busbridge_host::{BridgeConfig, Filter, Runtime};
use busbridge_protocol::{validate, HandlerResult, MatchRule, MessageHeader, NameKind};
use busbridge_transport::LoopbackTransport;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "busbridge", about = "Message-bus binding tools")]
struct Cli {
    /// env_logger filter; overrides the config's `log_filter`.
    #[arg(long, global = true)]
    log: Option<String>,

    /// Bridge configuration (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a name against one of the protocol grammars.
    Validate {
        #[arg(value_enum)]
        kind: KindArg,
        name: String,
    },
    /// Build and print a match rule.
    MatchRule {
        #[arg(long = "type")]
        msg_type: Option<String>,
        #[arg(long)]
        sender: Option<String>,
        #[arg(long)]
        interface: Option<String>,
        #[arg(long)]
        member: Option<String>,
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        destination: Option<String>,
        /// `N=VALUE`; may be repeated.
        #[arg(long = "arg", value_parser = parse_arg)]
        args: Vec<(u32, String)>,
    },
    /// Print the effective configuration as JSON.
    Config { path: Option<PathBuf> },
    /// Emit a signal on the in-memory loopback bus and report what a
    /// subscribed filter receives.
    Ping {
        #[arg(long, default_value = "/org/busbridge/Ping")]
        path: String,
        #[arg(long, default_value = "org.busbridge.Ping")]
        interface: String,
        #[arg(long, default_value = "Pong")]
        member: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum KindArg {
    Bus,
    Unique,
    Interface,
    Member,
    Path,
    Sender,
}

impl From<KindArg> for NameKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Bus => NameKind::Bus,
            KindArg::Unique => NameKind::UniqueConnection,
            KindArg::Interface => NameKind::Interface,
            KindArg::Member => NameKind::Member,
            KindArg::Path => NameKind::ObjectPath,
            KindArg::Sender => NameKind::BusOrUniqueConnection,
        }
    }
}

fn parse_arg(raw: &str) -> Result<(u32, String), String> {
    let (index, value) =
        raw.split_once('=').ok_or_else(|| format!("expected N=VALUE, got '{raw}'"))?;
    let index = index.trim().parse::<u32>().map_err(|err| format!("bad arg index '{index}': {err}"))?;
    Ok((index, value.to_string()))
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("busbridge error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = match &cli.command {
        Command::Config { path: Some(path) } => Some(path.clone()),
        _ => cli.config.clone(),
    };
    let config = match &config_path {
        Some(path) => BridgeConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    let filter = cli.log.as_deref().unwrap_or(&config.log_filter);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match cli.command {
        Command::Validate { kind, name } => {
            let length = validate(&name, kind.into())?;
            println!("{length}");
        }
        Command::MatchRule { msg_type, sender, interface, member, path, destination, args } => {
            let mut rule =
                MatchRule { msg_type, sender, interface, member, path, destination, ..MatchRule::default() };
            for (index, value) in args {
                if rule.arg.insert(index, value).is_some() {
                    bail!("arg{index} given more than once");
                }
            }
            println!("{}", rule.build()?);
        }
        Command::Config { .. } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Ping { path, interface, member } => {
            let header = ping(config, &path, &interface, &member)?;
            println!("{}", serde_json::to_string_pretty(&header)?);
        }
    }
    Ok(())
}

/// Round-trips one signal through the bridge: a second connection on the
/// loopback bus emits it, and a filter on the configured bus catches it.
fn ping(config: BridgeConfig, path: &str, interface: &str, member: &str) -> anyhow::Result<MessageHeader> {
    let transport = Rc::new(LoopbackTransport::new());
    let bus_type = config.default_bus;
    let runtime = Runtime::with_config(transport.clone(), config);

    let bus = runtime.default_bus()?;
    let rule = MatchRule::new().msg_type("signal").interface(interface).member(member);
    bus.add_match(&rule)?;
    log::info!("subscribed {}", bus.unique_name()?.unwrap_or_default());

    let seen: Rc<RefCell<Option<MessageHeader>>> = Rc::default();
    let slot = seen.clone();
    bus.add_filter(Filter::new(move |_, message| {
        *slot.borrow_mut() = Some(message.header()?);
        Ok(HandlerResult::Handled)
    }))?;

    let peer = runtime.adopt_connection(
        transport.open_bus_peer(bus_type),
        busbridge_host::CloseOnFinalize::DontClose,
    )?;
    let signal = runtime.message_new_signal(path, interface, member)?;
    if !peer.send(&signal)? {
        bail!("loopback bus refused the signal");
    }
    peer.flush()?;
    bus.read_write_dispatch(0)?;

    let header = seen.borrow_mut().take();
    header.ok_or_else(|| anyhow!("no filter saw the signal"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_indexed_args() {
        assert_eq!(parse_arg("3=it's"), Ok((3, "it's".to_string())));
        assert_eq!(parse_arg("0=a=b"), Ok((0, "a=b".to_string())));
        assert!(parse_arg("x=1").is_err());
        assert!(parse_arg("value").is_err());
    }

    #[test]
    fn cli_accepts_every_subcommand() {
        let cli = Cli::try_parse_from(["busbridge", "validate", "sender", ":1.42"]).expect("parse");
        assert!(matches!(cli.command, Command::Validate { kind: KindArg::Sender, .. }));

        let cli = Cli::try_parse_from([
            "busbridge", "--log", "debug", "match-rule", "--type", "signal", "--arg", "1=x", "--arg", "2=y",
        ])
        .expect("parse");
        assert_eq!(cli.log.as_deref(), Some("debug"));
        let Command::MatchRule { args, .. } = cli.command else {
            panic!("expected match-rule");
        };
        assert_eq!(args.len(), 2);

        assert!(Cli::try_parse_from(["busbridge", "validate", "bogus", "x"]).is_err());
    }

    #[test]
    fn ping_reaches_the_filter() {
        let header =
            ping(BridgeConfig::default(), "/a/b", "com.example.Foo", "Bar").expect("ping");
        assert_eq!(header.member.as_deref(), Some("Bar"));
        assert_eq!(header.path.as_deref(), Some("/a/b"));
    }
}
