use std::sync::Arc;

use ipscell::config::Config;
use ipscell::logging;
use ipscell::proto::{Event, GenericName, SandboxRecord, SendEventRequest};
use ipscell::service::LxcSandboxService;
use ipscell_host::LocalHost;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!(
        r#"ipscell v{VERSION} — host-local sandbox lifecycle agent

USAGE:
    ipscell <COMMAND> [ARGS]

COMMANDS:
    status                         Host-wide container listing
    list                           Known sandbox ids
    available                      Sandboxes in STOP/BOOT/READY state
    state <ID>                     Derived state of a sandbox
    info <ID>                      Runtime/memory/address details
    events <ID>                    Events the sandbox accepts right now
    sandbox-help <ID>              Operator notes for a sandbox
    event <ID> <EVENT> [SPEC]      Send a lifecycle event; PROVISIONING
                                   takes a YAML spec file
    generic-names                  Registered (role, owner) groups
    alternatives <ROLE> <OWNER>    Versions registered for a group
    set-alternative <ROLE> <OWNER> [ID]
                                   Pin a version, or AUTO without an id
    help                           Show this message

EVENTS:
    PROVISIONING START OPEN_NETWORK LAMEDUCK_NETWORK SHUTDOWN REBOOT
    STOP DESTROY ARCHIVE

CONFIG:
    Reads ipscell.yaml (or $IPSCELL_CONFIG). Keys: sandbox_vgname, dev,
    shared_dir, data_dir. IPSCELL_VGNAME, IPSCELL_DEV, IPSCELL_SHARED_DIR
    and IPSCELL_DATA_DIR override. RUST_LOG controls verbosity."#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str());

    let Some(command) = command else {
        print_help();
        return Ok(());
    };
    if command == "help" {
        print_help();
        return Ok(());
    }

    logging::init_console_logging();
    let config = Config::load()?;
    let host = Arc::new(LocalHost::new(config.dev.clone()));
    let service = LxcSandboxService::new(host, config);

    match command {
        "status" => print!("{}", service.get_status().await),
        "list" => {
            for id in service.get_sandboxes().await {
                println!("{id}");
            }
        }
        "available" => {
            for id in service.get_available_sandboxes().await {
                println!("{id}");
            }
        }
        "state" => {
            let id = required(&args, 2, "state <ID>")?;
            let state = service.get_state(id).await;
            println!("state: {}", state.state);
            if !state.description.is_empty() {
                println!("description: {}", state.description);
            }
        }
        "info" => {
            let id = required(&args, 2, "info <ID>")?;
            println!("{}", service.get_info(id).await);
        }
        "events" => {
            let id = required(&args, 2, "events <ID>")?;
            for event in service.get_valid_events(id).await {
                println!("{event}");
            }
        }
        "sandbox-help" => {
            let id = required(&args, 2, "sandbox-help <ID>")?;
            println!("{}", service.get_help(id).await);
        }
        "event" => {
            let id = required(&args, 2, "event <ID> <EVENT>")?;
            let event: Event = required(&args, 3, "event <ID> <EVENT>")?.parse()?;
            let spec = match args.get(4) {
                Some(path) => {
                    let raw = std::fs::read_to_string(path)?;
                    Some(serde_yaml::from_str::<SandboxRecord>(&raw)?)
                }
                None => None,
            };
            let response = service
                .send_event(id, SendEventRequest { event, spec })
                .await;
            println!("status: {:?}", response.status);
            if !response.description.is_empty() {
                println!("description: {}", response.description);
            }
        }
        "generic-names" => {
            for name in service.get_generic_names().await {
                println!("{} {}", name.role, name.owner);
            }
        }
        "alternatives" => {
            let role = required(&args, 2, "alternatives <ROLE> <OWNER>")?;
            let owner = required(&args, 3, "alternatives <ROLE> <OWNER>")?;
            let response = service
                .get_alternatives(&GenericName::new(role, owner))
                .await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        "set-alternative" => {
            let role = required(&args, 2, "set-alternative <ROLE> <OWNER> [ID]")?;
            let owner = required(&args, 3, "set-alternative <ROLE> <OWNER> [ID]")?;
            let response = service
                .set_alternative(&GenericName::new(role, owner), args.get(4).map(|s| s.as_str()))
                .await;
            println!("status: {:?}", response.status);
            if !response.description.is_empty() {
                println!("description: {}", response.description);
            }
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(2);
        }
    }
    Ok(())
}

fn required<'a>(args: &'a [String], index: usize, usage: &str) -> anyhow::Result<&'a str> {
    args.get(index)
        .map(|s| s.as_str())
        .ok_or_else(|| anyhow::anyhow!("usage: ipscell {usage}"))
}
