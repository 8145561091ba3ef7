//! apm - atomic package manager binary.
//!
//! Thin entry point: parses the CLI, initializes logging and the
//! cancellation handler, dispatches into the shared command handlers, and
//! renders the response envelope. Exit codes: 0 success, 1 error (the
//! envelope is still emitted), 130 after an interrupt; SIGTERM keeps the
//! default disposition and therefore the conventional 143.

use anyhow::Result;
use apm::cli::{
    Cli, Commands, ConfigCommands, ContainerCommands, DistroboxCommands, ImageCommands,
    SystemCommands,
};
use apm::commands::{AppState, distrobox, image, system};
use apm::config::AppConfig;
use apm::dialog::{AutoApprove, ChangeGate, TerminalGate};
use apm::events::{EventSink, NullSink, Reporter};
use apm::response::{Envelope, OutputFormat};
use apm::runner::CancelToken;
use apm::{apt, dbus, progress, transaction};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        let _ = ctrlc::set_handler(move || cancel.cancel());
    }

    let code = run(cli, &cancel);
    std::process::exit(code);
}

fn run(cli: Cli, cancel: &CancelToken) -> i32 {
    let transaction = transaction::resolve(cli.transaction.as_deref());
    let format = cli.format;

    let state = match AppConfig::resolve().and_then(AppState::init) {
        Ok(state) => state,
        Err(err) => {
            let envelope = Envelope::failure(err.to_string(), &transaction);
            println!("{}", envelope.render(format));
            return 1;
        }
    };

    if matches!(cli.command, Commands::Serve) {
        return match dbus::serve(Arc::new(state), Arc::new(dbus::AllowAll)) {
            Ok(()) => 0,
            Err(err) => {
                let envelope = Envelope::failure(err.to_string(), &transaction);
                println!("{}", envelope.render(format));
                1
            }
        };
    }

    // Terminal mode gets the live task tracker; machine modes stay silent
    // and bypass the dialog gate.
    let tracker = if format.is_machine() {
        None
    } else {
        Some(progress::global())
    };
    let sink: Arc<dyn EventSink> = match tracker {
        Some(tracker) => Arc::new(tracker.handle()),
        None => Arc::new(NullSink),
    };
    let gate: Box<dyn ChangeGate> = if format.is_machine() {
        Box::new(AutoApprove)
    } else {
        Box::new(TerminalGate::new(tracker.map(|t| t.handle())))
    };

    let reporter = Reporter::new(sink, transaction);
    let envelope = dispatch(cli.command, &state, &reporter, cancel, gate.as_ref());

    // Bring the spinner region down before the tree prints.
    if let Some(tracker) = tracker {
        tracker.clear();
    }
    println!("{}", envelope.render(format));

    if format == OutputFormat::Dbus {
        publish_to_bus(&envelope);
    }
    if cancel.is_cancelled() {
        130
    } else if envelope.error {
        1
    } else {
        0
    }
}

fn dispatch(
    command: Commands,
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    gate: &dyn ChangeGate,
) -> Envelope {
    match command {
        Commands::Update => system::update(state, reporter, cancel),
        Commands::Install { packages, apply } => {
            system::install(state, reporter, cancel, &packages, apply, gate)
        }
        Commands::Remove { packages, apply } => {
            system::remove(state, reporter, cancel, &packages, apply, gate)
        }
        Commands::Check { action, packages } => {
            let action = match action {
                apm::cli::CheckVerb::Install => apt::CheckAction::Install,
                apm::cli::CheckVerb::Remove => apt::CheckAction::Remove,
            };
            system::check(state, reporter, cancel, action, &packages)
        }
        Commands::Info { package } => system::info(state, reporter, &package),
        Commands::Search { query, installed } => {
            system::search(state, reporter, &query, installed)
        }
        Commands::List {
            filters,
            sort,
            desc,
            limit,
            offset,
        } => system::list(state, reporter, &filters, sort, desc, limit, offset),
        Commands::System {
            command: SystemCommands::Image { command },
        } => match command {
            ImageCommands::Status => image::status(state, reporter, cancel),
            ImageCommands::Apply { pull, allow_same } => {
                image::apply(state, reporter, cancel, pull, allow_same)
            }
            ImageCommands::Update => image::update(state, reporter, cancel),
            ImageCommands::History { limit } => image::history(state, reporter, limit),
            ImageCommands::Build => image::build(state, reporter, cancel),
            ImageCommands::Config { command } => match command {
                ConfigCommands::Get => image::config_get(state, reporter, cancel),
                ConfigCommands::Set { config } => image::config_save(state, reporter, &config),
            },
        },
        Commands::Distrobox { command } => dispatch_distrobox(command, state, reporter, cancel),
        Commands::Serve => unreachable!("serve handled before dispatch"),
    }
}

fn dispatch_distrobox(
    command: DistroboxCommands,
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
) -> Envelope {
    match command {
        DistroboxCommands::Update { container } => {
            distrobox::update(state, reporter, cancel, &container)
        }
        DistroboxCommands::Info { container, package } => {
            distrobox::info(state, reporter, &container, &package)
        }
        DistroboxCommands::Search {
            container,
            query,
            installed,
        } => distrobox::search(state, reporter, &container, &query, installed),
        DistroboxCommands::List {
            container,
            filters,
            sort,
            desc,
            limit,
            offset,
        } => distrobox::list(
            state, reporter, &container, &filters, sort, desc, limit, offset,
        ),
        DistroboxCommands::Install {
            container,
            packages,
            export,
        } => distrobox::install(state, reporter, cancel, &container, &packages, export),
        DistroboxCommands::Remove {
            container,
            packages,
        } => distrobox::remove(state, reporter, cancel, &container, &packages),
        DistroboxCommands::Export {
            container,
            package,
            delete,
        } => distrobox::export(state, reporter, cancel, &container, &package, delete),
        DistroboxCommands::Container { command } => match command {
            ContainerCommands::List => distrobox::container_list(state, reporter, cancel),
            ContainerCommands::Add { name, image } => {
                distrobox::container_add(state, reporter, cancel, &name, &image)
            }
            ContainerCommands::Remove { name } => {
                distrobox::container_remove(state, reporter, cancel, &name)
            }
        },
    }
}

/// Mirror the envelope onto the bus so a remote client observes both the
/// completion signal and the payload.
fn publish_to_bus(envelope: &Envelope) {
    let result: Result<()> = (|| {
        let connection = zbus::blocking::Connection::system()?;
        connection.emit_signal(
            None::<&str>,
            dbus::OBJECT_PATH,
            dbus::SERVICE_NAME,
            "Notification",
            &(envelope.to_wire(),),
        )?;
        Ok(())
    })();
    if let Err(err) = result {
        tracing::warn!(error = %err, "could not publish envelope to the bus");
    }
}
